//! Deterministic doubles for the oracle and the environment provider.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::errors::OracleError;
use crate::oracle::{Oracle, OracleRequest, OracleTask};
use crate::sandbox::{Environment, EnvironmentProvider, ExecOutput, ExecRequest, checked_relative};

// ── Oracle ────────────────────────────────────────────────────────────

/// Replies from a script instead of a model.
///
/// Analysis calls pop replies in order and answer `[]` once the script runs
/// out. Execute calls succeed (optionally editing files) unless the job id
/// was marked as failing.
pub struct ScriptedOracle {
    analysis: Mutex<Vec<String>>,
    failing_analysis: bool,
    failing_jobs: HashSet<String>,
    panicking_jobs: HashSet<String>,
    job_reply: String,
    edits: HashMap<String, Vec<(String, String)>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(OracleTask, String)>>,
}

impl ScriptedOracle {
    pub fn new(analysis_reply: &str) -> Self {
        Self::with_analysis_replies(vec![analysis_reply])
    }

    pub fn with_analysis_replies(replies: Vec<&str>) -> Self {
        Self {
            analysis: Mutex::new(replies.into_iter().rev().map(str::to_string).collect()),
            failing_analysis: false,
            failing_jobs: HashSet::new(),
            panicking_jobs: HashSet::new(),
            job_reply: "Done.".to_string(),
            edits: HashMap::new(),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_analysis(mut self) -> Self {
        self.failing_analysis = true;
        self
    }

    pub fn failing_job(mut self, job_id: &str) -> Self {
        self.failing_jobs.insert(job_id.to_string());
        self
    }

    /// Panic (instead of returning an error) when executing `job_id`.
    pub fn panicking_job(mut self, job_id: &str) -> Self {
        self.panicking_jobs.insert(job_id.to_string());
        self
    }

    pub fn with_job_reply(mut self, reply: &str) -> Self {
        self.job_reply = reply.to_string();
        self
    }

    /// Write `contents` to `path` in the environment when executing `job_id`.
    pub fn edit(mut self, job_id: &str, path: &str, contents: &str) -> Self {
        self.edits
            .entry(job_id.to_string())
            .or_default()
            .push((path.to_string(), contents.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn analysis_prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(task, _)| matches!(task, OracleTask::Analyze { .. }))
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }

    pub fn analysis_calls(&self) -> usize {
        self.analysis_prompts().len()
    }

    pub fn executed_jobs(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(task, _)| match task {
                OracleTask::Execute { job_id } => Some(job_id.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn propose(
        &self,
        env: &dyn Environment,
        request: &OracleRequest,
    ) -> Result<String, OracleError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.task.clone(), request.prompt.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &request.task {
            OracleTask::Analyze { .. } => {
                if self.failing_analysis {
                    return Err(OracleError::NonZeroExit {
                        exit_code: 1,
                        stderr: "scripted analysis failure".into(),
                    });
                }
                Ok(self
                    .analysis
                    .lock()
                    .unwrap()
                    .pop()
                    .unwrap_or_else(|| "[]".to_string()))
            }
            OracleTask::Execute { job_id } => {
                if self.panicking_jobs.contains(job_id) {
                    panic!("scripted panic for {}", job_id);
                }
                if self.failing_jobs.contains(job_id) {
                    return Err(OracleError::NonZeroExit {
                        exit_code: 2,
                        stderr: format!("scripted failure for {}", job_id),
                    });
                }
                for (path, contents) in self.edits.get(job_id).into_iter().flatten() {
                    env.write_file(path, contents)
                        .await
                        .map_err(OracleError::SpawnFailed)?;
                }
                Ok(self.job_reply.clone())
            }
        }
    }
}

// ── Environment provider ──────────────────────────────────────────────

#[derive(Default)]
struct FakeState {
    log: Vec<String>,
    active: usize,
    max_active: usize,
    released: usize,
    counter: usize,
}

/// In-memory environments that answer git commands with success and record
/// everything they are asked to do.
#[derive(Clone, Default)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeState>>,
    seed: Arc<Mutex<HashMap<String, String>>>,
    fail_acquire: Arc<Mutex<HashSet<String>>>,
    fail_commands: Arc<Mutex<Vec<String>>>,
    snapshots: bool,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshots(mut self) -> Self {
        self.snapshots = true;
        self
    }

    /// Every environment starts with this file in its checkout.
    pub fn seed_file(&self, path: &str, contents: &str) {
        self.seed
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_string());
    }

    /// Fail acquisition for hints containing `needle`.
    pub fn fail_acquire(&self, needle: &str) {
        self.fail_acquire.lock().unwrap().insert(needle.to_string());
    }

    /// Any command whose display line contains `needle` exits with status 1.
    pub fn fail_command(&self, needle: &str) {
        self.fail_commands.lock().unwrap().push(needle.to_string());
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn max_active(&self) -> usize {
        self.state.lock().unwrap().max_active
    }

    pub fn active(&self) -> usize {
        self.state.lock().unwrap().active
    }

    pub fn released(&self) -> usize {
        self.state.lock().unwrap().released
    }

    fn record(&self, line: String) {
        self.state.lock().unwrap().log.push(line);
    }
}

#[async_trait]
impl EnvironmentProvider for FakeProvider {
    async fn acquire(&self, hint: &str) -> Result<Box<dyn Environment>> {
        if self
            .fail_acquire
            .lock()
            .unwrap()
            .iter()
            .any(|needle| hint.contains(needle.as_str()))
        {
            self.record(format!("acquire-failed:{}", hint));
            bail!("scripted acquire failure for {}", hint);
        }
        let name = {
            let mut state = self.state.lock().unwrap();
            state.counter += 1;
            state.active += 1;
            state.max_active = state.max_active.max(state.active);
            let name = format!("{}#{}", hint, state.counter);
            state.log.push(format!("acquire:{}", name));
            name
        };
        Ok(Box::new(FakeEnvironment {
            name,
            provider: self.clone(),
            files: Mutex::new(self.seed.lock().unwrap().clone()),
        }))
    }

    async fn release(&self, env: Box<dyn Environment>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.active -= 1;
        state.released += 1;
        state.log.push(format!("release:{}", env.name()));
        Ok(())
    }

    fn supports_snapshot(&self) -> bool {
        self.snapshots
    }

    async fn snapshot(&self, env: &dyn Environment, label: &str) -> Result<Option<String>> {
        if !self.snapshots {
            return Ok(None);
        }
        self.record(format!("snapshot:{}:{}", env.name(), label));
        Ok(Some(format!("fake-snapshot:{}", label)))
    }
}

pub struct FakeEnvironment {
    name: String,
    provider: FakeProvider,
    files: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl Environment for FakeEnvironment {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        let line = request.display();
        self.provider.record(format!("exec:{}:{}", self.name, line));

        let failing = self
            .provider
            .fail_commands
            .lock()
            .unwrap()
            .iter()
            .any(|needle| line.contains(needle.as_str()));
        if failing {
            return Ok(ExecOutput {
                status: 1,
                stdout: String::new(),
                stderr: format!("scripted failure: {}", line),
            });
        }

        let args: Vec<&str> = request.args.iter().map(String::as_str).collect();
        let stdout = match (request.program.as_str(), args.as_slice()) {
            ("git", ["ls-files"]) => {
                let mut paths: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
                paths.sort();
                paths.join("\n")
            }
            ("git", ["diff", "--cached", "--quiet"]) => {
                return Ok(ExecOutput {
                    status: 1,
                    ..ExecOutput::default()
                });
            }
            ("git", ["rev-parse", "HEAD"]) => "0000000000000000000000000000000000000000\n".into(),
            _ => String::new(),
        };
        Ok(ExecOutput {
            status: 0,
            stdout,
            stderr: String::new(),
        })
    }

    async fn read_file(&self, rel: &str) -> Result<Option<String>> {
        checked_relative(rel)?;
        Ok(self.files.lock().unwrap().get(rel).cloned())
    }

    async fn write_file(&self, rel: &str, contents: &str) -> Result<()> {
        checked_relative(rel)?;
        self.provider
            .record(format!("write:{}:{}", self.name, rel));
        self.files
            .lock()
            .unwrap()
            .insert(rel.to_string(), contents.to_string());
        Ok(())
    }

    async fn remove_file(&self, rel: &str) -> Result<()> {
        checked_relative(rel)?;
        self.provider
            .record(format!("remove:{}:{}", self.name, rel));
        self.files.lock().unwrap().remove(rel);
        Ok(())
    }
}
