use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;

pub const DEFAULT_MAX_WORKERS: usize = 3;
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_DASHBOARD_PORT: u16 = 3141;
pub const DEFAULT_ITERATION_PAUSE_SECS: u64 = 5;

/// Where isolated environments are provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    Local,
    Docker,
}

impl FromStr for SandboxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "docker" => Ok(Self::Docker),
            _ => Err(format!("expected 'local' or 'docker', got '{}'", s)),
        }
    }
}

/// How a worker turns the oracle's reply into a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// The agent edits the working copy itself with full tool access.
    Autonomous,
    /// The agent replies with a list of file writes that the worker applies.
    FileOps,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "autonomous" => Ok(Self::Autonomous),
            "file-ops" => Ok(Self::FileOps),
            _ => Err(format!("expected 'autonomous' or 'file-ops', got '{}'", s)),
        }
    }
}

/// How much of the codebase the analysis prompt includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    Full,
    Listing,
}

impl FromStr for SnapshotMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "listing" => Ok(Self::Listing),
            _ => Err(format!("expected 'full' or 'listing', got '{}'", s)),
        }
    }
}

/// Secrets passed to the oracle and the git remote.
#[derive(Clone, Default)]
pub struct Credentials {
    pub anthropic_api_key: Option<String>,
    pub oauth_token: Option<String>,
    pub github_token: Option<String>,
}

impl Credentials {
    pub fn has_oracle_credential(&self) -> bool {
        self.anthropic_api_key.is_some() || self.oauth_token.is_some()
    }

    /// Environment variables that authenticate the oracle process.
    pub fn oracle_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(key) = &self.anthropic_api_key {
            env.push(("ANTHROPIC_API_KEY".to_string(), key.clone()));
        }
        if let Some(token) = &self.oauth_token {
            env.push(("CLAUDE_CODE_OAUTH_TOKEN".to_string(), token.clone()));
        }
        env
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("Credentials")
            .field("anthropic_api_key", &redact(&self.anthropic_api_key))
            .field("oauth_token", &redact(&self.oauth_token))
            .field("github_token", &redact(&self.github_token))
            .finish()
    }
}

/// Runtime configuration, sourced from the process environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub max_workers: usize,
    pub max_iterations: u32,
    pub jobs_dir: PathBuf,
    pub repo_url: Option<String>,
    pub repo_branch: String,
    /// Root under which isolated environments are created.
    pub project_path: PathBuf,
    pub coordinator_prompt_path: PathBuf,
    pub product_vision_path: PathBuf,
    pub product_state_path: PathBuf,
    pub credentials: Credentials,
    pub claude_cmd: String,
    pub sandbox: SandboxKind,
    pub execution_mode: ExecutionMode,
    pub snapshot_mode: SnapshotMode,
    pub iteration_pause: Duration,
    pub oracle_timeout: Option<Duration>,
    pub dashboard_port: u16,
    pub public_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            tracing::warn!(error = %e, "ignoring unreadable .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let max_workers: usize = parse_or(&get, "REFINERY_MAX_WORKERS", DEFAULT_MAX_WORKERS)?;
        if max_workers == 0 {
            return Err(ConfigError::Invalid {
                key: "REFINERY_MAX_WORKERS",
                value: "0".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            max_workers,
            max_iterations: parse_or(&get, "REFINERY_MAX_ITERATIONS", DEFAULT_MAX_ITERATIONS)?,
            jobs_dir: get("REFINERY_JOBS_DIR").unwrap_or_else(|| "jobs".into()).into(),
            repo_url: get("REPO_URL"),
            repo_branch: get("REPO_BRANCH").unwrap_or_else(|| "main".into()),
            project_path: get("PROJECT_PATH")
                .unwrap_or_else(|| ".refinery/workspaces".into())
                .into(),
            coordinator_prompt_path: get("COORDINATOR_PROMPT_PATH")
                .unwrap_or_else(|| "prompts/coordinator.md".into())
                .into(),
            product_vision_path: get("PRODUCT_VISION_PATH")
                .unwrap_or_else(|| "PRODUCT_VISION.md".into())
                .into(),
            product_state_path: get("PRODUCT_STATE_PATH")
                .unwrap_or_else(|| "PRODUCT_STATE.md".into())
                .into(),
            credentials: Credentials {
                anthropic_api_key: get("ANTHROPIC_API_KEY"),
                oauth_token: get("CLAUDE_CODE_OAUTH_TOKEN"),
                github_token: get("GITHUB_TOKEN"),
            },
            claude_cmd: get("CLAUDE_CMD").unwrap_or_else(|| "claude".into()),
            sandbox: parse_or(&get, "REFINERY_SANDBOX", SandboxKind::Local)?,
            execution_mode: parse_or(&get, "REFINERY_EXECUTION_MODE", ExecutionMode::Autonomous)?,
            snapshot_mode: parse_or(&get, "REFINERY_SNAPSHOT_MODE", SnapshotMode::Full)?,
            iteration_pause: Duration::from_secs(parse_or(
                &get,
                "REFINERY_ITERATION_PAUSE_SECS",
                DEFAULT_ITERATION_PAUSE_SECS,
            )?),
            oracle_timeout: get("REFINERY_ORACLE_TIMEOUT_SECS")
                .map(|v| parse_value::<u64>("REFINERY_ORACLE_TIMEOUT_SECS", v))
                .transpose()?
                .map(Duration::from_secs),
            dashboard_port: parse_or(&get, "DASHBOARD_PORT", DEFAULT_DASHBOARD_PORT)?,
            public_dir: get("DASHBOARD_PUBLIC_DIR")
                .unwrap_or_else(|| "public".into())
                .into(),
            log_dir: get("REFINERY_LOG_DIR").map(PathBuf::from),
        })
    }

    /// Settings that only the loop needs; the dashboard and status commands
    /// run without them.
    pub fn require_run_settings(&self) -> Result<&str, ConfigError> {
        if !self.credentials.has_oracle_credential() {
            return Err(ConfigError::MissingCredential);
        }
        self.repo_url.as_deref().ok_or(ConfigError::Missing("REPO_URL"))
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => parse_value(key, value),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        message: e.to_string(),
        value,
    })
}
