use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use refinery::config::Config;
use refinery::telemetry;

mod cmd;

#[derive(Parser)]
#[command(name = "refinery")]
#[command(version, about = "Autonomous, job-based codebase improvement loop")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Analyze, dispatch, and merge until nothing is left to improve
    Run {
        /// Serve the live dashboard while the loop runs
        #[arg(long)]
        dashboard: bool,
        /// Dashboard port (defaults to DASHBOARD_PORT or 3141)
        #[arg(long)]
        port: Option<u16>,
        /// Continue iteration numbering from the existing state report
        #[arg(long)]
        resume: bool,
    },
    /// Serve the dashboard over the job directories without running the loop
    Dashboard {
        #[arg(long)]
        port: Option<u16>,
        /// Bind on all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,
        /// Open the dashboard in a browser
        #[arg(long)]
        open: bool,
    },
    /// Show job counts per bucket and the recorded iteration total
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("Invalid configuration")?;
    let _log_guard = telemetry::init(cli.verbose, config.log_dir.as_deref())?;

    match cli.command {
        Commands::Run {
            dashboard,
            port,
            resume,
        } => {
            cmd::cmd_run(
                config,
                cmd::run::RunOptions {
                    dashboard,
                    port,
                    resume,
                },
            )
            .await?;
        }
        Commands::Dashboard { port, dev, open } => {
            cmd::cmd_dashboard(config, port, dev, open).await?;
        }
        Commands::Status => cmd::cmd_status(&config)?,
    }

    Ok(())
}
