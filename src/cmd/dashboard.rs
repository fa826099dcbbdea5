//! Standalone dashboard server: `refinery dashboard`.
//!
//! Without a running loop the event bus stays idle, so observers only see
//! the reconcile ticks and `connected` is false.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use refinery::config::Config;
use refinery::dashboard::{AppState, ServerConfig, start_server};
use refinery::events::{DEFAULT_CAPACITY, EventBus};
use refinery::jobs::JobStore;

pub async fn cmd_dashboard(config: Config, port: Option<u16>, dev: bool, open: bool) -> Result<()> {
    let port = port.unwrap_or(config.dashboard_port);

    // Skip in dev mode (no browser inside containers)
    if open && !dev {
        let url = format!("http://localhost:{}", port);
        tokio::spawn(async move {
            // Small delay to let the server start binding
            tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
            if let Err(e) = open::that(&url) {
                eprintln!("Failed to open browser: {}", e);
            }
        });
    }

    let bus = EventBus::new(DEFAULT_CAPACITY);
    let state = Arc::new(AppState {
        store: JobStore::new(config.jobs_dir.clone(), bus.clone()),
        bus,
        public_dir: config.public_dir.clone(),
    });

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\nShutting down...");
                shutdown.cancel();
            }
        });
    }

    start_server(ServerConfig { port, dev_mode: dev }, state, shutdown).await
}
