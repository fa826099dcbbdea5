//! Iteration controller: drives the loop until there is nothing left to do.
//!
//! ```text
//! Idle → Running(n) → checkpoint → analyze ─┬─ no jobs ──────────────→ Stopped
//!                                           └─ jobs → persist → dispatch
//!                                              → merge → record → checkpoint
//!                                              → Running(n+1) | Stopped
//! ```
//!
//! The coordinating environment holds the mainline checkout used for
//! analysis and merging. It is released whenever the loop stops, including
//! on error.

pub mod report;

use std::ops::Range;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::analysis::{AnalysisContext, AnalysisOutcome, AnalysisStage};
use crate::config::Config;
use crate::dispatch::{DispatchSettings, Dispatcher};
use crate::errors::{ConfigError, LoopError};
use crate::events::{EventBus, EventKind};
use crate::jobs::JobStore;
use crate::merge::MergeStage;
use crate::oracle::Oracle;
use crate::sandbox::{Environment, EnvironmentProvider, release_quietly};
use crate::ui::Narrator;
use crate::util::panic_message;
use crate::vcs::Git;

use report::{IterationResult, StateReport};

const COORDINATOR_HINT: &str = "coordinator";

#[derive(Debug, Clone, PartialEq)]
pub enum LoopStop {
    /// Analysis returned an explicit empty job list.
    ProductComplete,
    /// Analysis produced nothing usable; the reason is kept for the operator.
    MalformedAnalysis(String),
    MaxIterations,
    Cancelled,
}

impl LoopStop {
    pub fn describe(&self) -> String {
        match self {
            LoopStop::ProductComplete => "no further improvements proposed".to_string(),
            LoopStop::MalformedAnalysis(reason) => format!("unusable analysis output ({})", reason),
            LoopStop::MaxIterations => "iteration limit reached".to_string(),
            LoopStop::Cancelled => "cancelled".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    Idle,
    Running(u32),
    Stopped(LoopStop),
    /// A fatal error ended the run; carries its message.
    Aborted(String),
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub stop: LoopStop,
    /// Results of the iterations completed in this run, oldest first.
    pub history: Vec<IterationResult>,
    /// Number of the last iteration started, zero if none was.
    pub last_iteration: u32,
}

pub struct IterationController {
    config: Config,
    store: JobStore,
    bus: EventBus,
    provider: Arc<dyn EnvironmentProvider>,
    oracle: Arc<dyn Oracle>,
    narrator: Narrator,
    cancel: CancellationToken,
    state: Mutex<LoopState>,
}

impl IterationController {
    pub fn new(
        config: Config,
        store: JobStore,
        bus: EventBus,
        provider: Arc<dyn EnvironmentProvider>,
        oracle: Arc<dyn Oracle>,
        narrator: Narrator,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            provider,
            oracle,
            narrator,
            cancel,
            state: Mutex::new(LoopState::Idle),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_state(&self, state: LoopState) {
        tracing::debug!(?state, "loop state");
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Run iterations until analysis stops the loop, the iteration limit is
    /// reached, or the run is cancelled. Numbering continues after the
    /// report's carried total.
    pub async fn run(&self, report: StateReport) -> Result<LoopOutcome, LoopError> {
        let result = self.run_loop(&report).await;
        self.bus.set_connected(false);

        match &result {
            Ok(outcome) => {
                self.narrator.stopped(&outcome.stop.describe());
                tracing::info!(stop = ?outcome.stop, iterations = outcome.history.len(), "loop stopped");
                self.set_state(LoopState::Stopped(outcome.stop.clone()));
            }
            Err(e) => {
                tracing::error!(error = %e, "loop aborted");
                self.set_state(LoopState::Aborted(e.to_string()));
            }
        }
        result
    }

    async fn run_loop(&self, report: &StateReport) -> Result<LoopOutcome, LoopError> {
        let repo_url = self.config.require_run_settings()?.to_string();
        let iterations = self.iteration_range(report)?;
        self.store.ensure_layout()?;
        let recovered = self.store.recover_interrupted()?;
        if !recovered.is_empty() {
            tracing::warn!(jobs = ?recovered, "moved interrupted jobs to failed");
            self.narrator.warn(&format!(
                "{} job(s) interrupted by a previous run were marked failed",
                recovered.len()
            ));
        }

        self.narrator
            .run_header(&repo_url, self.config.max_iterations, self.config.max_workers);
        self.bus.set_iteration(report.carried_total());
        self.bus.set_connected(true);

        let env = self
            .provider
            .acquire(COORDINATOR_HINT)
            .await
            .map_err(LoopError::CoordinatorProvisioning)?;
        let result = AssertUnwindSafe(self.drive(env.as_ref(), &repo_url, report, iterations))
            .catch_unwind()
            .await;
        release_quietly(self.provider.as_ref(), env).await;
        result.unwrap_or_else(|payload| {
            Err(LoopError::Other(anyhow::anyhow!(
                "coordinator panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
    }

    /// Iteration numbers for this run: `max_iterations` numbers following
    /// the report's carried total.
    fn iteration_range(&self, report: &StateReport) -> Result<Range<u32>, ConfigError> {
        let carried = report.carried_total();
        carried
            .checked_add(1)
            .and_then(|first| Some(first..first.checked_add(self.config.max_iterations)?))
            .ok_or_else(|| ConfigError::Invalid {
                key: "REFINERY_MAX_ITERATIONS",
                value: self.config.max_iterations.to_string(),
                message: format!("iteration numbers after {} would overflow", carried),
            })
    }

    async fn drive(
        &self,
        coordinator: &dyn Environment,
        repo_url: &str,
        report: &StateReport,
        iterations: Range<u32>,
    ) -> Result<LoopOutcome, LoopError> {
        let config = &self.config;
        let git = Git::new(coordinator);
        git.clone_repo(
            repo_url,
            &config.repo_branch,
            config.credentials.github_token.as_deref(),
        )
        .await
        .map_err(|e| LoopError::CoordinatorCheckout(e.to_string()))?;

        let analysis = AnalysisStage::new(
            Arc::clone(&self.oracle),
            config.snapshot_mode,
            self.cancel.clone(),
            config.oracle_timeout,
        );
        let dispatcher = Dispatcher::new(
            self.store.clone(),
            self.bus.clone(),
            Arc::clone(&self.provider),
            Arc::clone(&self.oracle),
            DispatchSettings {
                max_workers: config.max_workers,
                repo_url: repo_url.to_string(),
                mainline: config.repo_branch.clone(),
                git_token: config.credentials.github_token.clone(),
                execution_mode: config.execution_mode,
                oracle_timeout: config.oracle_timeout,
            },
            self.narrator,
            self.cancel.clone(),
        );
        let merge = MergeStage::new(self.bus.clone(), self.narrator, config.repo_branch.clone());

        let first = iterations.start;
        let end = iterations.end;
        let mut history = Vec::new();
        let mut last_iteration = 0;

        for n in iterations {
            if self.cancel.is_cancelled() {
                return Ok(LoopOutcome {
                    stop: LoopStop::Cancelled,
                    history,
                    last_iteration,
                });
            }
            last_iteration = n;
            self.set_state(LoopState::Running(n));
            self.narrator.iteration_header(n - first + 1, config.max_iterations);

            if n > first
                && let Err(e) = git.sync_to_remote(&config.repo_branch).await
            {
                tracing::warn!(iteration = n, error = %e, "could not resync coordinator checkout");
            }
            self.checkpoint(coordinator, &format!("iter-{}-pre", n)).await;
            self.bus.publish(EventKind::IterationStart { iteration: n });

            self.narrator.analysis_started();
            let context = self.analysis_context(report);
            let jobs = match analysis.run(coordinator, n, &context).await {
                AnalysisOutcome::Jobs(jobs) => jobs,
                AnalysisOutcome::Exhausted => {
                    return Ok(LoopOutcome {
                        stop: LoopStop::ProductComplete,
                        history,
                        last_iteration,
                    });
                }
                AnalysisOutcome::Malformed(reason) => {
                    let stop = if self.cancel.is_cancelled() {
                        LoopStop::Cancelled
                    } else {
                        LoopStop::MalformedAnalysis(reason)
                    };
                    return Ok(LoopOutcome {
                        stop,
                        history,
                        last_iteration,
                    });
                }
            };
            self.narrator.jobs_found(jobs.len());

            for job in &jobs {
                if let Err(e) = self.store.create(job) {
                    tracing::warn!(job_id = %job.id, error = %e, "could not persist proposed job");
                }
            }

            let outcomes = dispatcher.dispatch_pending(n).await;
            let result = IterationResult::from_outcomes(n, &outcomes);
            merge.run(coordinator, &result.branches).await;

            self.narrator
                .iteration_complete(n, result.jobs_completed, result.jobs_failed);
            self.bus.publish(EventKind::IterationComplete(result.clone()));
            history.push(result);
            if let Err(e) = report.write(&history) {
                tracing::error!(path = %report.path().display(), error = %e, "could not write state report");
            }
            self.checkpoint(coordinator, &format!("iter-{}-post", n)).await;

            if n + 1 < end && !self.pause().await {
                return Ok(LoopOutcome {
                    stop: LoopStop::Cancelled,
                    history,
                    last_iteration,
                });
            }
        }

        Ok(LoopOutcome {
            stop: LoopStop::MaxIterations,
            history,
            last_iteration,
        })
    }

    async fn checkpoint(&self, env: &dyn Environment, label: &str) {
        if !self.provider.supports_snapshot() {
            tracing::debug!(label, "checkpoint skipped; provider has no snapshot support");
            return;
        }
        match self.provider.snapshot(env, label).await {
            Ok(image) => self.narrator.checkpoint(label, image.as_deref()),
            Err(e) => tracing::warn!(label, error = %e, "checkpoint failed"),
        }
    }

    fn analysis_context(&self, report: &StateReport) -> AnalysisContext {
        AnalysisContext {
            coordinator: read_document(&self.config.coordinator_prompt_path),
            vision: read_document(&self.config.product_vision_path),
            state_report: report.read(),
        }
    }

    /// Wait out the inter-iteration pause. Returns false if cancelled.
    async fn pause(&self) -> bool {
        let pause = self.config.iteration_pause;
        if pause.is_zero() {
            return !self.cancel.is_cancelled();
        }
        self.narrator.pausing(pause.as_secs());
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(pause) => true,
        }
    }
}

fn read_document(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "context document unavailable");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::Bucket;
    use crate::testing::{FakeProvider, ScriptedOracle};
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        config: Config,
        store: JobStore,
        bus: EventBus,
        provider: FakeProvider,
        report: StateReport,
    }

    fn harness(overrides: &[(&str, &str)]) -> Harness {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(root.join("vision.md"), "Make it fast.").unwrap();
        let mut vars: HashMap<String, String> = [
            ("ANTHROPIC_API_KEY", "sk-test"),
            ("REPO_URL", "https://example.com/repo.git"),
            ("REFINERY_ITERATION_PAUSE_SECS", "0"),
            ("REFINERY_MAX_WORKERS", "2"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        vars.insert("PRODUCT_VISION_PATH".into(), root.join("vision.md").display().to_string());
        vars.insert("PRODUCT_STATE_PATH".into(), root.join("STATE.md").display().to_string());
        vars.insert(
            "COORDINATOR_PROMPT_PATH".into(),
            root.join("missing.md").display().to_string(),
        );
        for (k, v) in overrides {
            vars.insert(k.to_string(), v.to_string());
        }
        let config = Config::from_lookup(|k| vars.get(k).cloned()).unwrap();
        let bus = EventBus::new(256);
        let store = JobStore::new(root.join("jobs"), bus.clone());
        let report = StateReport::fresh(&config.product_state_path);
        Harness {
            _dir: dir,
            config,
            store,
            bus,
            provider: FakeProvider::new(),
            report,
        }
    }

    fn controller(h: &Harness, provider: FakeProvider, oracle: ScriptedOracle) -> IterationController {
        IterationController::new(
            h.config.clone(),
            h.store.clone(),
            h.bus.clone(),
            Arc::new(provider),
            Arc::new(oracle),
            Narrator::silent(),
            CancellationToken::new(),
        )
    }

    const TWO_JOBS: &str = r#"[{"id": "j1", "title": "one", "priority": "high"},
                               {"id": "j2", "title": "two", "priority": "low"}]"#;

    #[tokio::test]
    async fn test_empty_analysis_stops_without_dispatch_or_merge() {
        let h = harness(&[]);
        let mut rx = h.bus.subscribe();
        let ctl = controller(&h, h.provider.clone(), ScriptedOracle::new("[]"));

        let outcome = ctl.run(h.report.clone()).await.unwrap();

        assert_eq!(outcome.stop, LoopStop::ProductComplete);
        assert!(outcome.history.is_empty());
        assert_eq!(ctl.state(), LoopState::Stopped(LoopStop::ProductComplete));
        // only the coordinator was ever provisioned, and it was released
        assert_eq!(h.provider.log().iter().filter(|l| l.starts_with("acquire:")).count(), 1);
        assert_eq!(h.provider.released(), 1);
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(
                event.kind,
                EventKind::MergeStart { .. } | EventKind::WorkerSpawned { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_malformed_analysis_has_its_own_stop_reason() {
        let h = harness(&[]);
        let ctl = controller(&h, h.provider.clone(), ScriptedOracle::new("I could not decide."));
        let outcome = ctl.run(h.report.clone()).await.unwrap();
        assert!(matches!(outcome.stop, LoopStop::MalformedAnalysis(_)));
        assert_eq!(h.store.count(Bucket::Pending).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_iteration_runs_all_stages_and_records_result() {
        let h = harness(&[("REFINERY_MAX_ITERATIONS", "1")]);
        let mut rx = h.bus.subscribe();
        let oracle = ScriptedOracle::new(TWO_JOBS)
            .edit("j1", "a.txt", "a")
            .edit("j2", "b.txt", "b");
        let ctl = controller(&h, h.provider.clone(), oracle);

        let outcome = ctl.run(h.report.clone()).await.unwrap();

        assert_eq!(outcome.stop, LoopStop::MaxIterations);
        assert_eq!(outcome.history.len(), 1);
        let result = &outcome.history[0];
        assert_eq!(result.jobs_completed, 2);
        assert_eq!(result.jobs_failed, 0);
        assert_eq!(h.store.count(Bucket::Completed).unwrap(), 2);

        let kinds: Vec<EventKind> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        let start = kinds
            .iter()
            .position(|k| matches!(k, EventKind::IterationStart { iteration: 1 }))
            .unwrap();
        let merge = kinds
            .iter()
            .position(|k| matches!(k, EventKind::MergeStart { branches } if branches.len() == 2))
            .unwrap();
        let done = kinds
            .iter()
            .position(|k| matches!(k, EventKind::IterationComplete(_)))
            .unwrap();
        assert!(start < merge && merge < done);

        let text = h.report.read();
        assert_eq!(report::parse_total_iterations(&text), Some(1));
        assert_eq!(h.provider.active(), 0);
    }

    #[tokio::test]
    async fn test_partial_failure_counts_sum_to_job_count() {
        let h = harness(&[("REFINERY_MAX_ITERATIONS", "1")]);
        let oracle = ScriptedOracle::new(TWO_JOBS)
            .edit("j1", "a.txt", "a")
            .failing_job("j2");
        let ctl = controller(&h, h.provider.clone(), oracle);

        let outcome = ctl.run(h.report.clone()).await.unwrap();

        let result = &outcome.history[0];
        assert_eq!(result.jobs_completed, 1);
        assert_eq!(result.jobs_failed, 1);
        assert_eq!(result.jobs_completed + result.jobs_failed, 2);
        assert_eq!(result.branches, vec!["refinery/iter-1/j1"]);
        assert_eq!(h.store.locate("j2"), Some(Bucket::Failed));
    }

    #[tokio::test]
    async fn test_stops_at_max_iterations() {
        let h = harness(&[("REFINERY_MAX_ITERATIONS", "2")]);
        let oracle = ScriptedOracle::with_analysis_replies(vec![
            r#"[{"id": "a", "title": "a"}]"#,
            r#"[{"id": "b", "title": "b"}]"#,
            r#"[{"id": "c", "title": "c"}]"#,
        ])
        .edit("a", "a.txt", "a")
        .edit("b", "b.txt", "b");
        let oracle = Arc::new(oracle);
        let ctl = IterationController::new(
            h.config.clone(),
            h.store.clone(),
            h.bus.clone(),
            Arc::new(h.provider.clone()),
            oracle.clone(),
            Narrator::silent(),
            CancellationToken::new(),
        );

        let outcome = ctl.run(h.report.clone()).await.unwrap();

        assert_eq!(outcome.stop, LoopStop::MaxIterations);
        assert_eq!(outcome.last_iteration, 2);
        assert_eq!(oracle.analysis_calls(), 2);
        assert_eq!(h.store.locate("c"), None);
    }

    #[tokio::test]
    async fn test_resume_continues_numbering() {
        let h = harness(&[("REFINERY_MAX_ITERATIONS", "1")]);
        std::fs::write(&h.config.product_state_path, "Total iterations: 4\n").unwrap();
        let report = StateReport::resume(&h.config.product_state_path).unwrap();
        let ctl = controller(
            &h,
            h.provider.clone(),
            ScriptedOracle::new(r#"[{"id": "x", "title": "x"}]"#).edit("x", "x.txt", "x"),
        );

        let outcome = ctl.run(report.clone()).await.unwrap();

        assert_eq!(outcome.history[0].iteration, 5);
        assert_eq!(outcome.history[0].branches, vec!["refinery/iter-5/x"]);
        assert_eq!(report::parse_total_iterations(&report.read()), Some(5));
    }

    #[tokio::test]
    async fn test_checkpoints_only_when_supported() {
        let h = harness(&[("REFINERY_MAX_ITERATIONS", "1")]);
        let oracle = || ScriptedOracle::new(r#"[{"id": "x", "title": "x"}]"#).edit("x", "x.txt", "x");

        let plain = FakeProvider::new();
        controller(&h, plain.clone(), oracle())
            .run(h.report.clone())
            .await
            .unwrap();
        assert!(!plain.log().iter().any(|l| l.starts_with("snapshot:")));

        let h = harness(&[("REFINERY_MAX_ITERATIONS", "1")]);
        let snapshotting = FakeProvider::new().with_snapshots();
        controller(&h, snapshotting.clone(), oracle())
            .run(h.report.clone())
            .await
            .unwrap();
        let snapshots: Vec<String> = snapshotting
            .log()
            .into_iter()
            .filter(|l| l.starts_with("snapshot:"))
            .collect();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[0].ends_with("iter-1-pre"));
        assert!(snapshots[1].ends_with("iter-1-post"));
    }

    #[tokio::test]
    async fn test_coordinator_released_when_checkout_fails() {
        let h = harness(&[]);
        h.provider.fail_command("git clone");
        let ctl = controller(&h, h.provider.clone(), ScriptedOracle::new(TWO_JOBS));

        let err = ctl.run(h.report.clone()).await.unwrap_err();

        assert!(matches!(err, LoopError::CoordinatorCheckout(_)));
        assert_eq!(h.provider.released(), 1);
        assert!(!h.bus.status().connected);
        match ctl.state() {
            LoopState::Aborted(message) => assert!(message.contains("checkout")),
            other => panic!("expected aborted state, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_fatal() {
        let h = harness(&[]);
        h.provider.fail_acquire(COORDINATOR_HINT);
        let ctl = controller(&h, h.provider.clone(), ScriptedOracle::new(TWO_JOBS));
        let err = ctl.run(h.report.clone()).await.unwrap_err();
        assert!(matches!(err, LoopError::CoordinatorProvisioning(_)));
        assert!(matches!(ctl.state(), LoopState::Aborted(_)));
    }

    #[tokio::test]
    async fn test_resume_at_numbering_limit_is_rejected() {
        let h = harness(&[("REFINERY_MAX_ITERATIONS", "3")]);
        std::fs::write(
            &h.config.product_state_path,
            format!("Total iterations: {}\n", u32::MAX - 1),
        )
        .unwrap();
        let report = StateReport::resume(&h.config.product_state_path).unwrap();
        let ctl = controller(&h, h.provider.clone(), ScriptedOracle::new(TWO_JOBS));

        let err = ctl.run(report).await.unwrap_err();

        assert!(matches!(
            err,
            LoopError::Config(ConfigError::Invalid { key: "REFINERY_MAX_ITERATIONS", .. })
        ));
        assert!(h.provider.log().is_empty());
        assert!(matches!(ctl.state(), LoopState::Aborted(_)));
    }

    #[tokio::test]
    async fn test_missing_credential_is_fatal() {
        let h = harness(&[]);
        let mut config = h.config.clone();
        config.credentials.anthropic_api_key = None;
        let ctl = IterationController::new(
            config,
            h.store.clone(),
            h.bus.clone(),
            Arc::new(h.provider.clone()),
            Arc::new(ScriptedOracle::new(TWO_JOBS)),
            Narrator::silent(),
            CancellationToken::new(),
        );
        let err = ctl.run(h.report.clone()).await.unwrap_err();
        assert!(matches!(err, LoopError::Config(_)));
        assert!(h.provider.log().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = harness(&[]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctl = IterationController::new(
            h.config.clone(),
            h.store.clone(),
            h.bus.clone(),
            Arc::new(h.provider.clone()),
            Arc::new(ScriptedOracle::new(TWO_JOBS)),
            Narrator::silent(),
            cancel,
        );
        let outcome = ctl.run(h.report.clone()).await.unwrap();
        assert_eq!(outcome.stop, LoopStop::Cancelled);
        assert_eq!(outcome.last_iteration, 0);
        assert_eq!(h.provider.released(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_jobs_recovered_at_start() {
        let h = harness(&[]);
        h.store.ensure_layout().unwrap();
        h.store
            .create(&crate::jobs::Job::new("stale", "left over", Default::default()))
            .unwrap();
        h.store
            .transition("stale", Bucket::Pending, Bucket::InProgress)
            .unwrap();
        let ctl = controller(&h, h.provider.clone(), ScriptedOracle::new("[]"));
        ctl.run(h.report.clone()).await.unwrap();
        assert_eq!(h.store.locate("stale"), Some(Bucket::Failed));
    }
}
