//! Job bucket summary: `refinery status`.

use anyhow::Result;
use console::style;

use refinery::config::Config;
use refinery::controller::report::parse_total_iterations;
use refinery::events::EventBus;
use refinery::jobs::{Bucket, JobStore};

pub fn cmd_status(config: &Config) -> Result<()> {
    let store = JobStore::new(config.jobs_dir.clone(), EventBus::default());

    println!();
    println!("Jobs in {}", style(config.jobs_dir.display()).bold());
    let mut total = 0;
    for bucket in Bucket::ALL {
        let jobs = store.list(bucket)?;
        total += jobs.len();
        println!("  {:<12} {}", bucket.as_str(), jobs.len());
    }
    println!("  {:<12} {}", "total", total);
    println!();

    let iterations = std::fs::read_to_string(&config.product_state_path)
        .ok()
        .and_then(|text| parse_total_iterations(&text));
    match iterations {
        Some(n) => println!("Total iterations: {}", n),
        None => println!(
            "No iterations recorded yet ({} not found)",
            config.product_state_path.display()
        ),
    }
    println!();
    Ok(())
}
