//! The generative agent behind analysis and job execution.
//!
//! The loop only sees the [`Oracle`] trait: a prompt goes in, raw text comes
//! out. `ClaudeCli` is the production implementation; tests substitute a
//! scripted one.

pub mod claude;
pub mod prompts;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::OracleError;
use crate::sandbox::Environment;

pub use claude::ClaudeCli;

/// What the oracle is asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleTask {
    /// Propose the next batch of jobs.
    Analyze { iteration: u32 },
    /// Carry out one job.
    Execute { job_id: String },
}

#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub task: OracleTask,
    pub prompt: String,
    /// Whether the agent may edit the checkout itself with full tool access.
    pub autonomous: bool,
}

#[async_trait]
pub trait Oracle: Send + Sync {
    /// Run `request` inside `env` and return the agent's raw reply.
    async fn propose(&self, env: &dyn Environment, request: &OracleRequest)
    -> Result<String, OracleError>;
}

/// Call the oracle, giving up when `cancel` fires or `timeout` elapses.
/// Dropping the in-flight call kills the agent process.
pub async fn propose_cancellable(
    oracle: &dyn Oracle,
    env: &dyn Environment,
    request: &OracleRequest,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<String, OracleError> {
    let call = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, oracle.propose(env, request))
                .await
                .map_err(|_| OracleError::TimedOut {
                    secs: limit.as_secs(),
                })?,
            None => oracle.propose(env, request).await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OracleError::Cancelled),
        result = call => result,
    }
}
