//! Environments as plain directories on the host.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{
    Environment, EnvironmentProvider, ExecOutput, ExecRequest, REPO_DIR, checked_relative,
    environment_name,
};

/// Hands out fresh directories under `root`. No snapshot capability.
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl EnvironmentProvider for LocalProvider {
    async fn acquire(&self, hint: &str) -> Result<Box<dyn Environment>> {
        let name = environment_name(hint);
        let dir = self.root.join(&name);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create environment directory {}", dir.display()))?;
        let dir = dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", dir.display()))?;
        Ok(Box::new(LocalEnvironment { name, dir }))
    }

    async fn release(&self, env: Box<dyn Environment>) -> Result<()> {
        let dir = self.root.join(env.name());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
        }
    }
}

pub struct LocalEnvironment {
    name: String,
    dir: PathBuf,
}

impl LocalEnvironment {
    fn repo(&self) -> PathBuf {
        self.dir.join(REPO_DIR)
    }

    fn repo_path(&self, rel: &str) -> Result<PathBuf> {
        Ok(self.repo().join(checked_relative(rel)?))
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        let cwd = if request.in_repo { self.repo() } else { self.dir.clone() };
        run_command(&request, &cwd).await
    }

    async fn read_file(&self, rel: &str) -> Result<Option<String>> {
        let path = self.repo_path(rel)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.repo_path(rel)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    async fn remove_file(&self, rel: &str) -> Result<()> {
        let path = self.repo_path(rel)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

/// Spawn `request` in `cwd` and collect its output. The child is killed if
/// the returned future is dropped.
pub(crate) async fn run_command(request: &ExecRequest, cwd: &Path) -> Result<ExecOutput> {
    tracing::debug!(cmd = %request.display(), cwd = %cwd.display(), "exec");

    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args)
        .current_dir(cwd)
        .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if request.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", request.program))?;

    // Feed stdin while draining stdout/stderr; writing it all first would
    // block once the child fills its output pipe.
    let stdin = child.stdin.take();
    let feed = async {
        match (stdin, &request.stdin) {
            (Some(mut pipe), Some(input)) => pipe.write_all(input.as_bytes()).await,
            _ => Ok(()),
        }
        // the pipe drops here, so the child sees EOF
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    let output = output.with_context(|| format!("Failed waiting for '{}'", request.program))?;
    if let Err(e) = fed
        && e.kind() != ErrorKind::BrokenPipe
    {
        return Err(e).context("Failed to write to child stdin");
    }

    Ok(ExecOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
