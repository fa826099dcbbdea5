//! Dispatch & execution stage.
//!
//! Pending jobs run in fixed-size batches. Jobs inside a batch run
//! concurrently, each in its own environment on its own branch; the next
//! batch starts only after every job in the current one has reached
//! `completed` or `failed`. One job failing (or panicking) never affects
//! its siblings.

pub mod apply;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutionMode;
use crate::errors::JobError;
use crate::events::{EventBus, EventKind};
use crate::jobs::{Bucket, Job, JobStore, sort_for_dispatch};
use crate::oracle::prompts::{JobContext, job_prompt};
use crate::oracle::{Oracle, OracleRequest, OracleTask, propose_cancellable};
use crate::sandbox::{Environment, EnvironmentProvider, release_quietly};
use crate::ui::Narrator;
use crate::util::panic_message;
use crate::vcs::{Git, branch_name};

use apply::{apply_file_ops, parse_file_ops};

/// Upper bound on declared files read into a job's context.
pub const MAX_CONTEXT_FILES: usize = 10;

/// Result of one job. On failure the branch is advisory: it may never have
/// been pushed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub job_id: String,
    pub branch: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobOutcome {
    fn ok(job_id: &str, branch: String) -> Self {
        Self {
            job_id: job_id.to_string(),
            branch,
            success: true,
            error: None,
        }
    }

    fn failed(job_id: &str, branch: String, error: impl Into<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            branch,
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_workers: usize,
    pub repo_url: String,
    pub mainline: String,
    pub git_token: Option<String>,
    pub execution_mode: ExecutionMode,
    pub oracle_timeout: Option<Duration>,
}

struct DispatchContext {
    store: JobStore,
    bus: EventBus,
    provider: Arc<dyn EnvironmentProvider>,
    oracle: Arc<dyn Oracle>,
    settings: DispatchSettings,
    narrator: Narrator,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
}

impl Dispatcher {
    pub fn new(
        store: JobStore,
        bus: EventBus,
        provider: Arc<dyn EnvironmentProvider>,
        oracle: Arc<dyn Oracle>,
        settings: DispatchSettings,
        narrator: Narrator,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx: Arc::new(DispatchContext {
                store,
                bus,
                provider,
                oracle,
                settings,
                narrator,
                cancel,
            }),
        }
    }

    /// Dispatch everything currently in `pending`.
    pub async fn dispatch_pending(&self, iteration: u32) -> Vec<JobOutcome> {
        match self.ctx.store.list(Bucket::Pending) {
            Ok(jobs) => self.dispatch(iteration, jobs).await,
            Err(e) => {
                tracing::error!(iteration, error = %e, "could not list pending jobs");
                Vec::new()
            }
        }
    }

    /// Run `jobs` in batches of `max_workers`, in priority order. Outcomes are
    /// returned in completion order.
    pub async fn dispatch(&self, iteration: u32, mut jobs: Vec<Job>) -> Vec<JobOutcome> {
        sort_for_dispatch(&mut jobs);
        let batch_size = self.ctx.settings.max_workers.max(1);
        let batches: Vec<Vec<Job>> = jobs.chunks(batch_size).map(<[Job]>::to_vec).collect();
        let total = batches.len();
        let mut outcomes = Vec::with_capacity(jobs.len());

        for (index, batch) in batches.into_iter().enumerate() {
            if self.ctx.cancel.is_cancelled() {
                tracing::warn!(iteration, remaining_batches = total - index, "cancelled; leaving remaining jobs pending");
                break;
            }
            let ids: Vec<String> = batch.iter().map(|j| j.id.clone()).collect();
            self.ctx.narrator.batch_started(index + 1, total, &ids);
            tracing::info!(iteration, batch = index + 1, of = total, jobs = ?ids, "batch started");

            outcomes.extend(self.run_batch(iteration, batch).await);
        }
        outcomes
    }

    async fn run_batch(&self, iteration: u32, batch: Vec<Job>) -> Vec<JobOutcome> {
        let mut set = JoinSet::new();
        let mut owners = HashMap::new();
        for job in batch {
            let ctx = Arc::clone(&self.ctx);
            let job_id = job.id.clone();
            let handle = set.spawn(async move { run_job(&ctx, iteration, job).await });
            owners.insert(handle.id(), job_id);
        }

        let mut outcomes = Vec::with_capacity(owners.len());
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((_, outcome)) => outcomes.push(outcome),
                Err(join_err) => {
                    let job_id = owners.get(&join_err.id()).cloned().unwrap_or_default();
                    tracing::error!(job_id = %job_id, error = %join_err, "job task panicked");
                    self.fail_orphan(&job_id);
                    outcomes.push(JobOutcome::failed(
                        &job_id,
                        branch_name(iteration, &job_id),
                        format!("worker task aborted: {}", join_err),
                    ));
                }
            }
        }
        outcomes
    }

    /// Put a job whose task died back into a terminal bucket.
    fn fail_orphan(&self, job_id: &str) {
        for from in [Bucket::InProgress, Bucket::Pending] {
            match self.ctx.store.transition(job_id, from, Bucket::Failed) {
                Ok(true) => return,
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "could not mark job failed");
                    return;
                }
            }
        }
    }
}

async fn run_job(ctx: &DispatchContext, iteration: u32, job: Job) -> JobOutcome {
    let branch = branch_name(iteration, &job.id);

    match ctx
        .store
        .transition(&job.id, Bucket::Pending, Bucket::InProgress)
    {
        Ok(true) => {}
        Ok(false) => {
            return JobOutcome::failed(&job.id, branch, "job was no longer pending");
        }
        Err(e) => return JobOutcome::failed(&job.id, branch, e.to_string()),
    }
    ctx.narrator.job_started(&job.id, &job.title);

    let result = match ctx.provider.acquire(&job.id).await {
        Ok(env) => {
            ctx.bus.publish(EventKind::WorkerSpawned {
                job_id: job.id.clone(),
                worker_name: env.name().to_string(),
            });
            let result = AssertUnwindSafe(execute(ctx, env.as_ref(), iteration, &job, &branch))
                .catch_unwind()
                .await;
            release_quietly(ctx.provider.as_ref(), env).await;
            result.unwrap_or_else(|payload| {
                Err(JobError::Panicked(panic_message(payload.as_ref())))
            })
        }
        Err(e) => Err(JobError::Acquire(e)),
    };

    let (to, outcome) = match result {
        Ok(()) => {
            ctx.narrator.job_completed(&job.id, &branch);
            tracing::info!(job_id = %job.id, branch = %branch, "job completed");
            (Bucket::Completed, JobOutcome::ok(&job.id, branch))
        }
        Err(e) => {
            ctx.narrator.job_failed(&job.id, e.step(), &e.to_string());
            tracing::warn!(job_id = %job.id, step = e.step(), error = %e, "job failed");
            (Bucket::Failed, JobOutcome::failed(&job.id, branch, e.to_string()))
        }
    };

    if let Err(e) = ctx.store.transition(&job.id, Bucket::InProgress, to) {
        tracing::error!(job_id = %job.id, error = %e, "could not record job outcome");
        return JobOutcome::failed(&job.id, outcome.branch, e.to_string());
    }
    outcome
}

/// Clone, branch, run the oracle, commit and push inside an acquired environment.
async fn execute(
    ctx: &DispatchContext,
    env: &dyn Environment,
    iteration: u32,
    job: &Job,
    branch: &str,
) -> Result<(), JobError> {
    let settings = &ctx.settings;
    let git = Git::new(env);

    git.clone_repo(
        &settings.repo_url,
        &settings.mainline,
        settings.git_token.as_deref(),
    )
    .await
    .map_err(|e| JobError::CloneRepo(e.to_string()))?;

    git.checkout_new_branch(branch)
        .await
        .map_err(|e| JobError::Branch {
            branch: branch.to_string(),
            message: e.to_string(),
        })?;
    let base = git.head().await?;

    let context = gather_context(env, job).await;
    let autonomous = settings.execution_mode == ExecutionMode::Autonomous;
    let request = OracleRequest {
        task: OracleTask::Execute {
            job_id: job.id.clone(),
        },
        prompt: job_prompt(job, &context, autonomous),
        autonomous,
    };
    let reply = propose_cancellable(
        ctx.oracle.as_ref(),
        env,
        &request,
        &ctx.cancel,
        settings.oracle_timeout,
    )
    .await?;

    if !autonomous {
        let ops = parse_file_ops(&reply).map_err(JobError::Apply)?;
        let applied = apply_file_ops(env, &ops).await.map_err(JobError::Apply)?;
        tracing::debug!(job_id = %job.id, applied, "file operations applied");
    }

    git.add_all()
        .await
        .map_err(|e| JobError::Commit(e.to_string()))?;
    if git
        .has_staged_changes()
        .await
        .map_err(|e| JobError::Commit(e.to_string()))?
    {
        let message = format!(
            "[{}] {}\n\nIteration {} job {}",
            job.id, job.title, iteration, job.id
        );
        git.commit(&message)
            .await
            .map_err(|e| JobError::Commit(e.to_string()))?;
    } else if git.head().await? == base {
        return Err(JobError::Commit("the oracle produced no changes".into()));
    }

    git.push_branch(branch).await.map_err(|e| JobError::Push {
        branch: branch.to_string(),
        message: e.to_string(),
    })?;
    Ok(())
}

/// Declared files (first [`MAX_CONTEXT_FILES`]) or, if none were declared,
/// the repository listing.
async fn gather_context(env: &dyn Environment, job: &Job) -> JobContext {
    if job.files.is_empty() {
        let listing = Git::new(env).ls_files().await.unwrap_or_else(|e| {
            tracing::warn!(job_id = %job.id, error = %e, "could not list repository files");
            Vec::new()
        });
        return JobContext::Listing(listing);
    }

    let mut files = Vec::new();
    for path in job.files.iter().take(MAX_CONTEXT_FILES) {
        match env.read_file(path).await {
            Ok(contents) => files.push((path.clone(), contents)),
            Err(e) => tracing::warn!(job_id = %job.id, path = %path, error = %e, "skipping context file"),
        }
    }
    JobContext::Files(files)
}
