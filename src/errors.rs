//! Typed error hierarchy for the refinery loop.
//!
//! - `ConfigError`: startup configuration problems (fatal)
//! - `StoreError`: job lifecycle store I/O
//! - `OracleError`: agent invocation failures
//! - `JobError`: which step of the per-job protocol failed
//! - `LoopError`: fatal run errors surfaced by the iteration controller

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while assembling the runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("No oracle credential found: set ANTHROPIC_API_KEY or CLAUDE_CODE_OAUTH_TOKEN")]
    MissingCredential,

    #[error("Invalid value '{value}' for {key}: {message}")]
    Invalid {
        key: &'static str,
        value: String,
        message: String,
    },
}

/// Errors from the job lifecycle store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job id must not be empty")]
    EmptyId,

    #[error("Job id '{0}' is not a valid file name")]
    InvalidId(String),

    #[error("Store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode job {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from a single oracle invocation.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Failed to start oracle process: {0}")]
    SpawnFailed(#[source] anyhow::Error),

    #[error("Oracle exited with non-zero code {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },

    #[error("Oracle call timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("Oracle call cancelled")]
    Cancelled,
}

/// A failure at one step of the per-job protocol.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Failed to acquire environment: {0}")]
    Acquire(#[source] anyhow::Error),

    #[error("Clone failed: {0}")]
    CloneRepo(String),

    #[error("Branch {branch} could not be created: {message}")]
    Branch { branch: String, message: String },

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error("Could not apply change: {0}")]
    Apply(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Push of {branch} failed: {message}")]
    Push { branch: String, message: String },

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Worker panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    /// Short label of the protocol step, used in narration.
    pub fn step(&self) -> &'static str {
        match self {
            JobError::Acquire(_) => "acquire",
            JobError::CloneRepo(_) => "clone",
            JobError::Branch { .. } => "branch",
            JobError::Oracle(_) => "oracle",
            JobError::Apply(_) => "apply",
            JobError::Commit(_) => "commit",
            JobError::Push { .. } => "push",
            JobError::Store(_) => "store",
            JobError::Panicked(_) => "panic",
            JobError::Other(_) => "other",
        }
    }
}

/// Fatal errors that abort the whole run.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to provision coordinating environment: {0}")]
    CoordinatorProvisioning(#[source] anyhow::Error),

    #[error("Failed to prepare coordinating checkout: {0}")]
    CoordinatorCheckout(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
