//! Analysis stage: ask the oracle for the next set of jobs.
//!
//! The reply is free text; the first JSON array in it is taken as the job
//! list. Nothing here fails upward: a reply that cannot be used becomes
//! [`AnalysisOutcome::Malformed`], which stops the loop just like an
//! explicit empty list does.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::SnapshotMode;
use crate::jobs::Job;
use crate::oracle::prompts::{AnalysisPrompt, CodebaseSnapshot, analysis_prompt};
use crate::oracle::{Oracle, OracleRequest, OracleTask, propose_cancellable};
use crate::sandbox::Environment;
use crate::util::extract_json_array;
use crate::vcs::Git;

/// Files larger than this are left out of a full snapshot.
pub const MAX_SNAPSHOT_FILE_BYTES: usize = 64 * 1024;
/// Total size budget for file contents in a full snapshot.
pub const MAX_SNAPSHOT_TOTAL_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    /// At least one usable job.
    Jobs(Vec<Job>),
    /// The oracle explicitly returned `[]`: nothing left to do.
    Exhausted,
    /// No usable job list could be read from the reply.
    Malformed(String),
}

impl AnalysisOutcome {
    /// The job list, empty for both stopping outcomes.
    pub fn jobs(&self) -> &[Job] {
        match self {
            AnalysisOutcome::Jobs(jobs) => jobs,
            _ => &[],
        }
    }
}

/// Parse the oracle's raw reply into jobs.
pub fn parse_jobs(raw: &str) -> AnalysisOutcome {
    let Some(array) = extract_json_array(raw) else {
        return AnalysisOutcome::Malformed("no JSON array in reply".into());
    };
    let entries: Vec<serde_json::Value> = match serde_json::from_str(array) {
        Ok(entries) => entries,
        Err(e) => return AnalysisOutcome::Malformed(format!("invalid job array: {}", e)),
    };
    if entries.is_empty() {
        return AnalysisOutcome::Exhausted;
    }

    let total = entries.len();
    let mut jobs: Vec<Job> = Vec::with_capacity(total);
    let mut index_by_id: HashMap<String, usize> = HashMap::new();
    for (i, entry) in entries.into_iter().enumerate() {
        let job = match serde_json::from_value::<Job>(entry) {
            Ok(job) => job.normalized(),
            Err(e) => {
                tracing::warn!(index = i, error = %e, "skipping invalid job entry");
                continue;
            }
        };
        if job.id.is_empty() {
            tracing::warn!(index = i, "skipping job entry with empty id");
            continue;
        }
        // later duplicates overwrite earlier ones, as they would in the store
        match index_by_id.get(&job.id) {
            Some(&existing) => jobs[existing] = job,
            None => {
                index_by_id.insert(job.id.clone(), jobs.len());
                jobs.push(job);
            }
        }
    }

    if jobs.is_empty() {
        return AnalysisOutcome::Malformed(format!("none of {} entries were valid jobs", total));
    }
    AnalysisOutcome::Jobs(jobs)
}

/// Read the tracked files of the checkout in `env`.
pub async fn snapshot_codebase(env: &dyn Environment, mode: SnapshotMode) -> CodebaseSnapshot {
    let paths = match Git::new(env).ls_files().await {
        Ok(paths) => paths,
        Err(e) => {
            tracing::warn!(error = %e, "could not list repository files");
            Vec::new()
        }
    };
    if mode == SnapshotMode::Listing {
        return CodebaseSnapshot::Listing(paths);
    }

    let mut files = Vec::new();
    let mut omitted = 0;
    let mut total = 0;
    for path in paths {
        if total >= MAX_SNAPSHOT_TOTAL_BYTES {
            omitted += 1;
            continue;
        }
        match env.read_file(&path).await {
            Ok(Some(contents))
                if contents.len() <= MAX_SNAPSHOT_FILE_BYTES && !contents.contains('\0') =>
            {
                total += contents.len();
                files.push((path, contents));
            }
            Ok(_) => omitted += 1,
            Err(e) => {
                tracing::debug!(path = %path, error = %e, "unreadable file left out of snapshot");
                omitted += 1;
            }
        }
    }
    CodebaseSnapshot::Full { files, omitted }
}

/// Static documents that frame every analysis.
#[derive(Debug, Clone, Default)]
pub struct AnalysisContext {
    pub coordinator: String,
    pub vision: String,
    pub state_report: String,
}

pub struct AnalysisStage {
    oracle: Arc<dyn Oracle>,
    snapshot_mode: SnapshotMode,
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl AnalysisStage {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        snapshot_mode: SnapshotMode,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            oracle,
            snapshot_mode,
            cancel,
            timeout,
        }
    }

    /// Build the prompt from `context` and the checkout in `env`, ask the
    /// oracle, and parse its reply.
    pub async fn run(
        &self,
        env: &dyn Environment,
        iteration: u32,
        context: &AnalysisContext,
    ) -> AnalysisOutcome {
        let snapshot = snapshot_codebase(env, self.snapshot_mode).await;
        let prompt = analysis_prompt(&AnalysisPrompt {
            iteration,
            coordinator: &context.coordinator,
            vision: &context.vision,
            state_report: &context.state_report,
            snapshot: &snapshot,
        });
        let request = OracleRequest {
            task: OracleTask::Analyze { iteration },
            prompt,
            autonomous: false,
        };

        let raw = match propose_cancellable(
            self.oracle.as_ref(),
            env,
            &request,
            &self.cancel,
            self.timeout,
        )
        .await
        {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(iteration, error = %e, "analysis oracle call failed");
                return AnalysisOutcome::Malformed(e.to_string());
            }
        };

        let outcome = parse_jobs(&raw);
        match &outcome {
            AnalysisOutcome::Jobs(jobs) => {
                tracing::info!(iteration, jobs = jobs.len(), "analysis produced jobs")
            }
            AnalysisOutcome::Exhausted => {
                tracing::info!(iteration, "analysis returned an empty job list")
            }
            AnalysisOutcome::Malformed(reason) => {
                tracing::warn!(iteration, reason = %reason, reply_chars = raw.len(), "analysis reply unusable; treating as empty")
            }
        }
        outcome
    }
}
