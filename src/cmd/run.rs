//! The improvement loop: `refinery run`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use refinery::config::{Config, SandboxKind};
use refinery::controller::IterationController;
use refinery::controller::report::StateReport;
use refinery::dashboard::{AppState, ServerConfig, start_server};
use refinery::events::{DEFAULT_CAPACITY, EventBus};
use refinery::jobs::JobStore;
use refinery::oracle::ClaudeCli;
use refinery::sandbox::{DockerProvider, EnvironmentProvider, LocalProvider, SandboxConfig};
use refinery::ui::Narrator;

pub struct RunOptions {
    pub dashboard: bool,
    pub port: Option<u16>,
    pub resume: bool,
}

pub async fn cmd_run(config: Config, options: RunOptions) -> Result<()> {
    config
        .require_run_settings()
        .context("Cannot start the improvement loop")?;

    let narrator = Narrator::default();
    let bus = EventBus::new(DEFAULT_CAPACITY);
    let store = JobStore::new(config.jobs_dir.clone(), bus.clone());

    let provider: Arc<dyn EnvironmentProvider> = match config.sandbox {
        SandboxKind::Local => Arc::new(LocalProvider::new(config.project_path.clone())),
        SandboxKind::Docker => {
            let sandbox = SandboxConfig::load(Path::new("."))?;
            tracing::info!(image = %sandbox.image, "using docker environments");
            Arc::new(DockerProvider::new(sandbox))
        }
    };
    let oracle = Arc::new(ClaudeCli::new(
        config.claude_cmd.clone(),
        config.credentials.clone(),
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                Narrator::default().warn("Interrupt received; finishing the current step...");
                cancel.cancel();
            }
        });
    }

    let server_shutdown = cancel.child_token();
    let server = options.dashboard.then(|| {
        let state = Arc::new(AppState {
            store: store.clone(),
            bus: bus.clone(),
            public_dir: config.public_dir.clone(),
        });
        let server_config = ServerConfig {
            port: options.port.unwrap_or(config.dashboard_port),
            dev_mode: false,
        };
        let shutdown = server_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = start_server(server_config, state, shutdown).await {
                tracing::error!(error = %e, "dashboard stopped");
            }
        })
    });

    let report = if options.resume {
        StateReport::resume(&config.product_state_path)?
    } else {
        StateReport::fresh(&config.product_state_path)
    };

    let controller =
        IterationController::new(config, store, bus, provider, oracle, narrator, cancel);
    let result = controller.run(report).await;

    server_shutdown.cancel();
    if let Some(handle) = server {
        let _ = handle.await;
    }

    let outcome = result?;
    println!(
        "\n{} iteration(s) run, stopped: {}",
        outcome.history.len(),
        outcome.stop.describe()
    );
    Ok(())
}
