//! Live dashboard: a read model over the job buckets, served over HTTP with
//! a WebSocket event stream.
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /api/state` | Current [`DashboardState`] |
//! | `GET /api/jobs/{bucket}` | Job records in one bucket |
//! | `GET /ws` | `initial` snapshot, then every bus event |
//! | `GET /health` | Liveness |
//! | anything else | Static files from the public directory |

pub mod api;
pub mod server;
pub mod state;
pub mod ws;

pub use api::{AppState, SharedState};
pub use server::{ServerConfig, build_router, start_server};
pub use state::DashboardState;
