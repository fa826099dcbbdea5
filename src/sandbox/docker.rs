//! Environments as long-lived containers driven through the `docker` CLI.
//!
//! Each environment is a detached container kept alive with `sleep
//! infinity`; commands run through `docker exec`. Snapshots are
//! `docker commit` images, which makes checkpoints available.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use super::local::run_command;
use super::{
    Environment, EnvironmentProvider, ExecOutput, ExecRequest, REPO_DIR, SandboxConfig,
    checked_relative, environment_name,
};

/// Working directory inside every container.
pub const WORKDIR: &str = "/workspace";

/// Image repository used for checkpoint commits.
const SNAPSHOT_REPO: &str = "refinery-checkpoint";

pub struct DockerProvider {
    config: SandboxConfig,
    docker: String,
}

impl DockerProvider {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            docker: "docker".to_string(),
        }
    }

    async fn docker(&self, args: Vec<String>) -> Result<ExecOutput> {
        let request = ExecRequest::new(self.docker.clone(), args);
        run_command(&request, &PathBuf::from(".")).await
    }

    /// `docker run` arguments for a new container named `name`.
    pub fn run_args(&self, name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-w".to_string(),
            WORKDIR.to_string(),
        ];
        args.extend(self.config.run_args());
        args.push(self.config.image.clone());
        args.push("sleep".to_string());
        args.push("infinity".to_string());
        args
    }
}

#[async_trait]
impl EnvironmentProvider for DockerProvider {
    async fn acquire(&self, hint: &str) -> Result<Box<dyn Environment>> {
        let name = environment_name(hint);
        let out = self.docker(self.run_args(&name)).await?;
        if !out.success() {
            bail!("docker run failed for {}: {}", name, out.diagnostic());
        }
        tracing::debug!(container = %name, image = %self.config.image, "container started");
        Ok(Box::new(DockerEnvironment {
            name,
            docker: self.docker.clone(),
        }))
    }

    async fn release(&self, env: Box<dyn Environment>) -> Result<()> {
        let out = self
            .docker(vec!["rm".into(), "-f".into(), env.name().to_string()])
            .await?;
        if !out.success() && !out.stderr.contains("No such container") {
            bail!("docker rm failed for {}: {}", env.name(), out.diagnostic());
        }
        Ok(())
    }

    fn supports_snapshot(&self) -> bool {
        true
    }

    async fn snapshot(&self, env: &dyn Environment, label: &str) -> Result<Option<String>> {
        let tag = format!("{}:{}", SNAPSHOT_REPO, label);
        let out = self
            .docker(vec!["commit".into(), env.name().to_string(), tag.clone()])
            .await
            .context("docker commit failed to start")?;
        if !out.success() {
            bail!("docker commit failed: {}", out.diagnostic());
        }
        Ok(Some(tag))
    }
}

pub struct DockerEnvironment {
    name: String,
    docker: String,
}

impl DockerEnvironment {
    /// Wrap `request` into a `docker exec` invocation.
    pub fn exec_args(&self, request: &ExecRequest) -> Vec<String> {
        let cwd = if request.in_repo {
            format!("{}/{}", WORKDIR, REPO_DIR)
        } else {
            WORKDIR.to_string()
        };
        let mut args = vec!["exec".to_string()];
        if request.stdin.is_some() {
            args.push("-i".to_string());
        }
        args.push("-w".to_string());
        args.push(cwd);
        // Names only: `docker exec -e KEY` copies the value from the docker
        // client's own environment, which keeps secrets out of argv.
        for (key, _) in &request.env {
            args.push("-e".to_string());
            args.push(key.clone());
        }
        args.push(self.name.clone());
        args.push(request.program.clone());
        args.extend(request.args.iter().cloned());
        args
    }
}

#[async_trait]
impl Environment for DockerEnvironment {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        let mut outer = ExecRequest::new(self.docker.clone(), self.exec_args(&request));
        outer.env = request.env;
        outer.stdin = request.stdin;
        run_command(&outer, &PathBuf::from(".")).await
    }

    async fn read_file(&self, rel: &str) -> Result<Option<String>> {
        checked_relative(rel)?;
        let out = self
            .exec(ExecRequest::new("cat", ["--", rel]).in_repo())
            .await?;
        Ok(out.success().then_some(out.stdout))
    }

    async fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        checked_relative(rel)?;
        let script = r#"mkdir -p "$(dirname "$1")" && cat > "$1""#;
        let out = self
            .exec(
                ExecRequest::new("sh", ["-c", script, "sh", rel])
                    .in_repo()
                    .with_stdin(contents),
            )
            .await?;
        if !out.success() {
            bail!("write of {} failed: {}", rel, out.diagnostic());
        }
        Ok(())
    }

    async fn remove_file(&self, rel: &str) -> Result<()> {
        checked_relative(rel)?;
        let out = self
            .exec(ExecRequest::new("rm", ["-f", "--", rel]).in_repo())
            .await?;
        if !out.success() {
            bail!("remove of {} failed: {}", rel, out.diagnostic());
        }
        Ok(())
    }
}
