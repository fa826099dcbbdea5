//! Merge stage: fold successful job branches back into the mainline.
//!
//! Branches are merged one at a time in the order dispatch produced them.
//! A conflicting branch is aborted and left out; the rest still merge.
//! The mainline is pushed once at the end.

use serde::Serialize;

use crate::events::{EventBus, EventKind};
use crate::sandbox::Environment;
use crate::ui::Narrator;
use crate::vcs::Git;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub merged: Vec<String>,
    pub skipped: Vec<String>,
    pub pushed: bool,
}

pub struct MergeStage {
    bus: EventBus,
    narrator: Narrator,
    mainline: String,
}

impl MergeStage {
    pub fn new(bus: EventBus, narrator: Narrator, mainline: impl Into<String>) -> Self {
        Self {
            bus,
            narrator,
            mainline: mainline.into(),
        }
    }

    /// Merge `branches` into the mainline checked out in `env`.
    pub async fn run(&self, env: &dyn Environment, branches: &[String]) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        self.bus.publish(EventKind::MergeStart {
            branches: branches.to_vec(),
        });
        if branches.is_empty() {
            self.finish(&outcome);
            return outcome;
        }
        self.narrator.merge_started(branches.len());

        let git = Git::new(env);
        if let Err(e) = git.fetch().await {
            tracing::error!(error = %e, "fetch before merge failed; skipping all branches");
            outcome.skipped = branches.to_vec();
            self.finish(&outcome);
            return outcome;
        }

        for branch in branches {
            match git.merge_remote_branch(branch).await {
                Ok(true) => {
                    tracing::info!(branch = %branch, "merged");
                    outcome.merged.push(branch.clone());
                }
                Ok(false) => {
                    self.narrator.merge_skipped(branch);
                    outcome.skipped.push(branch.clone());
                }
                Err(e) => {
                    tracing::error!(branch = %branch, error = %e, "merge attempt failed");
                    self.narrator.merge_skipped(branch);
                    outcome.skipped.push(branch.clone());
                }
            }
        }

        if !outcome.merged.is_empty() {
            match git.push_mainline(&self.mainline).await {
                Ok(()) => outcome.pushed = true,
                Err(e) => tracing::error!(branch = %self.mainline, error = %e, "mainline push failed"),
            }
        }

        self.finish(&outcome);
        outcome
    }

    fn finish(&self, outcome: &MergeOutcome) {
        self.narrator.merge_finished(
            outcome.merged.len(),
            outcome.skipped.len(),
            outcome.pushed || outcome.merged.is_empty(),
        );
        self.bus.publish(EventKind::MergeComplete {
            success: outcome.skipped.is_empty() && (outcome.pushed || outcome.merged.is_empty()),
            success_count: outcome.merged.len(),
            fail_count: outcome.skipped.len(),
        });
    }
}
