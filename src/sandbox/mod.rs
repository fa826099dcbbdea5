//! Isolated execution environments.
//!
//! An [`EnvironmentProvider`] hands out disposable [`Environment`]s, each
//! with its own working directory and repository checkout. Every command the
//! loop issues (git, the oracle CLI) runs through [`Environment::exec`], so
//! the same control flow works against local directories, containers, or an
//! in-memory fake in tests.

pub mod config;
pub mod docker;
pub mod local;

use std::path::{Component, Path};

use anyhow::{Result, bail};
use async_trait::async_trait;

pub use config::SandboxConfig;
pub use docker::DockerProvider;
pub use local::LocalProvider;

/// Directory name of the repository checkout inside an environment.
pub const REPO_DIR: &str = "repo";

/// One command to run inside an environment.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    /// Run inside the repository checkout rather than the environment root.
    pub in_repo: bool,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

impl ExecRequest {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// A git command run inside the checkout.
    pub fn git<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("git", args).in_repo()
    }

    pub fn in_repo(mut self) -> Self {
        self.in_repo = true;
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Command line for logs; env values and stdin are never included.
    /// Token-bearing URLs and `-e KEY=VALUE` values are redacted.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        let mut after_env_flag = false;
        for arg in &self.args {
            let shown = if arg.contains("x-access-token") {
                "<redacted-url>".to_string()
            } else if after_env_flag && let Some((key, _)) = arg.split_once('=') {
                format!("{}=<redacted>", key)
            } else {
                arg.clone()
            };
            after_env_flag = matches!(arg.as_str(), "-e" | "--env");
            parts.push(shown);
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stderr if present, otherwise stdout; used in error messages.
    pub fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        text.trim().to_string()
    }
}

/// A disposable, isolated place to check out and modify the repository.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Unique name; also the handle the provider uses to tear it down.
    fn name(&self) -> &str;

    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput>;

    /// Read a file relative to the checkout. `Ok(None)` when it does not exist.
    async fn read_file(&self, rel: &str) -> Result<Option<String>>;

    /// Write a file relative to the checkout, creating parent directories.
    async fn write_file(&self, rel: &str, contents: &str) -> Result<()>;

    async fn remove_file(&self, rel: &str) -> Result<()>;
}

#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Provision a fresh environment. `hint` seeds its name.
    async fn acquire(&self, hint: &str) -> Result<Box<dyn Environment>>;

    /// Tear an environment down. Must be safe to call on a half-built one.
    async fn release(&self, env: Box<dyn Environment>) -> Result<()>;

    fn supports_snapshot(&self) -> bool {
        false
    }

    /// Capture the environment's state; returns a reference to the snapshot.
    async fn snapshot(&self, _env: &dyn Environment, _label: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Release `env`, logging instead of failing: teardown errors must not mask
/// the outcome that was already decided.
pub async fn release_quietly(provider: &dyn EnvironmentProvider, env: Box<dyn Environment>) {
    let name = env.name().to_string();
    if let Err(e) = provider.release(env).await {
        tracing::warn!(environment = %name, error = %e, "environment teardown failed");
    } else {
        tracing::debug!(environment = %name, "environment released");
    }
}

/// Reject absolute paths and any path that climbs out of the checkout.
pub fn checked_relative(rel: &str) -> Result<&Path> {
    let path = Path::new(rel);
    if rel.trim().is_empty() {
        bail!("empty path");
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => bail!("path '{}' escapes the repository", rel),
        }
    }
    Ok(path)
}

/// Turn a free-form hint into a name safe for directories and containers.
pub fn environment_name(hint: &str) -> String {
    let cleaned: String = hint
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('-');
    let base = if cleaned.is_empty() { "env" } else { cleaned };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("refinery-{}-{}", base, &suffix[..8])
}
