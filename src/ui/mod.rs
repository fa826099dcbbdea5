//! Console narration of loop progress.
//!
//! One line per stage transition, written to stdout. Diagnostics go through
//! `tracing` instead.

pub mod icons;

use console::style;

use icons::*;

/// Prints human-readable progress lines. A disabled narrator prints nothing.
#[derive(Debug, Clone, Copy)]
pub struct Narrator {
    enabled: bool,
}

impl Default for Narrator {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Narrator {
    pub fn silent() -> Self {
        Self { enabled: false }
    }

    fn line(&self, msg: impl AsRef<str>) {
        if self.enabled {
            println!("{}", msg.as_ref());
        }
    }

    pub fn run_header(&self, repo: &str, max_iterations: u32, max_workers: usize) {
        self.line("");
        self.line(format!("{}", style("═".repeat(70)).cyan()));
        self.line(format!(
            "{} Refining {}",
            style("▶").green().bold(),
            style(repo).yellow().bold()
        ));
        self.line(format!("{}", style("═".repeat(70)).cyan()));
        self.line(format!(
            "{}  {} iterations max, {} workers per batch",
            style("Budget:").dim(),
            max_iterations,
            max_workers
        ));
        self.line("");
    }

    pub fn iteration_header(&self, iteration: u32, max: u32) {
        self.line(format!(
            "\n{} Iteration {}/{}",
            style("▶").green().bold(),
            style(iteration).cyan().bold(),
            max
        ));
    }

    pub fn checkpoint(&self, label: &str, image: Option<&str>) {
        match image {
            Some(image) => self.line(format!("  {}Checkpoint {}: {}", SNAPSHOT, label, style(image).dim())),
            None => self.line(format!("  {}Checkpoint {} skipped (not supported)", SNAPSHOT, label)),
        }
    }

    pub fn analysis_started(&self) {
        self.line(format!("  {}Analyzing codebase...", ANALYZE));
    }

    pub fn jobs_found(&self, count: usize) {
        self.line(format!("  {}{} job(s) proposed", SPARKLE, style(count).bold()));
    }

    pub fn batch_started(&self, index: usize, total: usize, job_ids: &[String]) {
        self.line(format!(
            "  {}Batch {}/{}: {}",
            BATCH,
            index,
            total,
            style(job_ids.join(", ")).dim()
        ));
    }

    pub fn job_started(&self, job_id: &str, title: &str) {
        self.line(format!("    {}{} {}", WORKER, style(job_id).cyan(), title));
    }

    pub fn job_completed(&self, job_id: &str, branch: &str) {
        self.line(format!(
            "    {}{} pushed {}",
            CHECK,
            style(job_id).green(),
            style(branch).dim()
        ));
    }

    pub fn job_failed(&self, job_id: &str, step: &str, reason: &str) {
        self.line(format!(
            "    {}{} failed at {}: {}",
            CROSS,
            style(job_id).red(),
            step,
            reason
        ));
    }

    pub fn merge_started(&self, branches: usize) {
        self.line(format!("  {}Merging {} branch(es)...", MERGE, branches));
    }

    pub fn merge_skipped(&self, branch: &str) {
        self.line(format!("    {}{} conflicts, left unmerged", WARN, style(branch).yellow()));
    }

    pub fn merge_finished(&self, merged: usize, skipped: usize, pushed: bool) {
        let mark = if pushed { CHECK } else { CROSS };
        self.line(format!(
            "  {}{} merged, {} skipped{}",
            mark,
            merged,
            skipped,
            if pushed { "" } else { ", mainline not pushed" }
        ));
    }

    pub fn iteration_complete(&self, iteration: u32, completed: usize, failed: usize) {
        self.line(format!(
            "{} Iteration {} complete: {} completed, {} failed",
            SPARKLE,
            style(iteration).green().bold(),
            completed,
            failed
        ));
    }

    pub fn pausing(&self, secs: u64) {
        if secs > 0 {
            self.line(format!("  {}Pausing {}s", CLOCK, secs));
        }
    }

    pub fn stopped(&self, reason: &str) {
        self.line(format!("\n{} Stopped: {}\n", style("■").bold(), reason));
    }

    pub fn warn(&self, msg: &str) {
        self.line(format!("  {}{}", WARN, msg));
    }
}
