use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    extract::State,
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use super::api::{self, SharedState};
use super::ws;
use crate::config::DEFAULT_DASHBOARD_PORT;

/// Configuration for the dashboard server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DASHBOARD_PORT,
            dev_mode: false,
        }
    }
}

/// Build the full application router: API, WebSocket, and static files.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .fallback(static_handler)
        .with_state(state)
}

enum StaticLookup {
    Found(PathBuf),
    Missing,
    Forbidden,
}

/// Resolve a request path under `root`. The resolved file must stay inside
/// the root after symlinks and `..` are followed.
fn resolve_static(root: &Path, request_path: &str) -> StaticLookup {
    let Ok(root) = root.canonicalize() else {
        return StaticLookup::Missing;
    };
    let rel = request_path.trim_start_matches('/');
    let mut candidate = if rel.is_empty() {
        root.join("index.html")
    } else {
        root.join(rel)
    };
    if candidate.is_dir() {
        candidate = candidate.join("index.html");
    }
    match candidate.canonicalize() {
        Ok(resolved) if resolved.starts_with(&root) => StaticLookup::Found(resolved),
        Ok(_) => StaticLookup::Forbidden,
        Err(_) => StaticLookup::Missing,
    }
}

async fn static_handler(State(state): State<SharedState>, uri: Uri) -> Response {
    let path = match resolve_static(&state.public_dir, uri.path()) {
        StaticLookup::Found(path) => path,
        StaticLookup::Forbidden => {
            tracing::warn!(path = %uri.path(), "rejected static path outside the public directory");
            return (StatusCode::FORBIDDEN, "Forbidden").into_response();
        }
        StaticLookup::Missing => return (StatusCode::NOT_FOUND, "Not found").into_response(),
    };
    match tokio::fs::read(&path).await {
        Ok(content) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            ([(header::CONTENT_TYPE, mime.to_string())], Body::from(content)).into_response()
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not read static file");
            (StatusCode::NOT_FOUND, "Not found").into_response()
        }
    }
}

/// Serve the dashboard until `shutdown` is cancelled.
pub async fn start_server(
    config: ServerConfig,
    state: SharedState,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    let url = format!("http://{}", local_addr);
    println!("Dashboard running at {}", url);
    tracing::info!(%url, "dashboard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;

    tracing::info!("dashboard shut down");
    Ok(())
}
