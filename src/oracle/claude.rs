use async_trait::async_trait;

use crate::config::Credentials;
use crate::errors::OracleError;
use crate::sandbox::{Environment, ExecRequest};

use super::{Oracle, OracleRequest};

/// Runs the Claude CLI inside the environment, prompt on stdin.
pub struct ClaudeCli {
    command: String,
    credentials: Credentials,
}

impl ClaudeCli {
    pub fn new(command: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            command: command.into(),
            credentials,
        }
    }

    pub fn flags(&self, autonomous: bool) -> Vec<String> {
        let mut flags = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "text".to_string(),
        ];
        if autonomous {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags
    }

    pub fn request(&self, request: &OracleRequest) -> ExecRequest {
        ExecRequest::new(self.command.clone(), self.flags(request.autonomous))
            .in_repo()
            .with_env(self.credentials.oracle_env())
            .with_stdin(request.prompt.clone())
    }
}

#[async_trait]
impl Oracle for ClaudeCli {
    async fn propose(
        &self,
        env: &dyn Environment,
        request: &OracleRequest,
    ) -> Result<String, OracleError> {
        tracing::debug!(
            task = ?request.task,
            environment = %env.name(),
            prompt_chars = request.prompt.len(),
            "invoking oracle"
        );
        let out = env
            .exec(self.request(request))
            .await
            .map_err(OracleError::SpawnFailed)?;
        if !out.success() {
            return Err(OracleError::NonZeroExit {
                exit_code: out.status,
                stderr: out.diagnostic(),
            });
        }
        Ok(out.stdout)
    }
}
