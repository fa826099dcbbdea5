//! Iteration results and the human-readable product state report.
//!
//! The report is rewritten in full after every iteration. The only part read
//! back by machine is the `Total iterations: N` line.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dispatch::JobOutcome;

static TOTAL_ITERATIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Total iterations:\s*(\d+)\s*$").unwrap());

const HISTORY_HEADING: &str = "## History";

/// Immutable summary of one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationResult {
    pub iteration: u32,
    pub jobs_completed: usize,
    pub jobs_failed: usize,
    /// Branches of successful jobs, in completion order.
    pub branches: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl IterationResult {
    pub fn from_outcomes(iteration: u32, outcomes: &[JobOutcome]) -> Self {
        let completed = outcomes.iter().filter(|o| o.success).count();
        Self {
            iteration,
            jobs_completed: completed,
            jobs_failed: outcomes.len() - completed,
            branches: outcomes
                .iter()
                .filter(|o| o.success)
                .map(|o| o.branch.clone())
                .collect(),
            timestamp: Utc::now(),
        }
    }

    fn history_line(&self) -> String {
        let mut line = format!(
            "- Iteration {} ({}): {} completed, {} failed",
            self.iteration,
            self.timestamp.to_rfc3339(),
            self.jobs_completed,
            self.jobs_failed
        );
        if !self.branches.is_empty() {
            line.push_str(&format!(" [{}]", self.branches.join(", ")));
        }
        line
    }
}

/// Extract N from a `Total iterations: N` line.
pub fn parse_total_iterations(text: &str) -> Option<u32> {
    TOTAL_ITERATIONS
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// The on-disk state report plus the history carried over from a resumed run.
#[derive(Debug, Clone)]
pub struct StateReport {
    path: PathBuf,
    carried_total: u32,
    carried_history: Vec<String>,
}

impl StateReport {
    /// Start a fresh report at `path`; any existing file is replaced on the
    /// first write.
    pub fn fresh(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            carried_total: 0,
            carried_history: Vec::new(),
        }
    }

    /// Continue the report at `path`, keeping its history and total.
    pub fn resume(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::fresh(path)),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        let carried_history = text
            .split_once(HISTORY_HEADING)
            .map(|(_, history)| {
                history
                    .lines()
                    .filter(|l| l.starts_with("- "))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            carried_total: parse_total_iterations(&text).unwrap_or(0),
            carried_history,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Iterations completed before this run started.
    pub fn carried_total(&self) -> u32 {
        self.carried_total
    }

    pub fn render(&self, history: &[IterationResult]) -> String {
        let total = history
            .last()
            .map(|r| r.iteration)
            .unwrap_or(self.carried_total);
        let mut out = String::from("# Product State\n\n");
        out.push_str(&format!("Total iterations: {}\n", total));
        out.push_str(&format!("Last updated: {}\n", Utc::now().to_rfc3339()));

        if let Some(latest) = history.last() {
            out.push_str("\n## Latest iteration\n\n");
            out.push_str(&format!(
                "Iteration {}: {} jobs completed, {} failed\n",
                latest.iteration, latest.jobs_completed, latest.jobs_failed
            ));
            if latest.branches.is_empty() {
                out.push_str("No branches produced.\n");
            } else {
                out.push_str("Branches:\n");
                for branch in &latest.branches {
                    out.push_str(&format!("- {}\n", branch));
                }
            }
        }

        out.push('\n');
        out.push_str(HISTORY_HEADING);
        out.push_str("\n\n");
        for line in &self.carried_history {
            out.push_str(line);
            out.push('\n');
        }
        for result in history {
            out.push_str(&result.history_line());
            out.push('\n');
        }
        out
    }

    pub fn write(&self, history: &[IterationResult]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&self.path, self.render(history))
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }

    /// Current text of the report, empty if it has not been written yet.
    pub fn read(&self) -> String {
        std::fs::read_to_string(&self.path).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(iteration: u32, completed: usize, failed: usize) -> IterationResult {
        IterationResult {
            iteration,
            jobs_completed: completed,
            jobs_failed: failed,
            branches: (0..completed)
                .map(|i| format!("refinery/iter-{}/job-{}", iteration, i))
                .collect(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_from_outcomes_counts_and_branches() {
        let outcomes = vec![
            JobOutcome {
                job_id: "a".into(),
                branch: "b/a".into(),
                success: true,
                error: None,
            },
            JobOutcome {
                job_id: "b".into(),
                branch: "b/b".into(),
                success: false,
                error: Some("boom".into()),
            },
        ];
        let result = IterationResult::from_outcomes(4, &outcomes);
        assert_eq!(result.jobs_completed, 1);
        assert_eq!(result.jobs_failed, 1);
        assert_eq!(result.branches, vec!["b/a"]);
    }

    #[test]
    fn test_json_is_camel_case() {
        let json = serde_json::to_string(&result(1, 1, 0)).unwrap();
        assert!(json.contains("\"jobsCompleted\":1"));
        assert!(json.contains("\"jobsFailed\":0"));
    }

    #[test]
    fn test_parse_total_iterations() {
        assert_eq!(parse_total_iterations("x\nTotal iterations: 12\ny"), Some(12));
        assert_eq!(parse_total_iterations("Total iterations:3"), Some(3));
        assert_eq!(parse_total_iterations("no total here"), None);
        assert_eq!(parse_total_iterations("Total iterations: many"), None);
    }

    #[test]
    fn test_render_contains_total_latest_and_history() {
        let report = StateReport::fresh("unused");
        let text = report.render(&[result(1, 2, 0), result(2, 1, 1)]);
        assert_eq!(parse_total_iterations(&text), Some(2));
        assert!(text.contains("Iteration 2: 1 jobs completed, 1 failed"));
        assert!(text.contains("- Iteration 1 ("));
        assert!(text.contains("refinery/iter-2/job-0"));
    }

    #[test]
    fn test_resume_carries_history_and_total() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("PRODUCT_STATE.md");
        StateReport::fresh(&path)
            .write(&[result(1, 1, 0), result(2, 0, 1)])
            .unwrap();

        let resumed = StateReport::resume(&path).unwrap();
        assert_eq!(resumed.carried_total(), 2);
        resumed.write(&[result(3, 1, 0)]).unwrap();

        let text = resumed.read();
        assert_eq!(parse_total_iterations(&text), Some(3));
        assert_eq!(text.matches("- Iteration ").count(), 3);
    }

    #[test]
    fn test_resume_missing_file_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let report = StateReport::resume(dir.path().join("missing.md")).unwrap();
        assert_eq!(report.carried_total(), 0);
        assert_eq!(parse_total_iterations(&report.render(&[])), Some(0));
    }
}
