//! Integration tests for the refinery CLI.
//!
//! These run the real binary against scratch job directories; nothing here
//! reaches a repository or the agent.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const CONFIG_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "CLAUDE_CODE_OAUTH_TOKEN",
    "GITHUB_TOKEN",
    "REPO_URL",
    "REFINERY_JOBS_DIR",
    "REFINERY_MAX_WORKERS",
    "REFINERY_LOG_DIR",
    "PRODUCT_STATE_PATH",
];

/// A refinery command running in `dir` with no inherited configuration.
fn refinery(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("refinery");
    cmd.current_dir(dir.path());
    for var in CONFIG_VARS {
        cmd.env_remove(var);
    }
    cmd
}

fn write_job(dir: &TempDir, bucket: &str, id: &str) {
    let bucket_dir = dir.path().join("jobs").join(bucket);
    fs::create_dir_all(&bucket_dir).unwrap();
    fs::write(
        bucket_dir.join(format!("{}.json", id)),
        format!(r#"{{"id": "{}", "title": "job {}", "priority": "high"}}"#, id, id),
    )
    .unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        refinery(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("dashboard"))
            .stdout(predicate::str::contains("status"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        refinery(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("refinery"));
    }

    #[test]
    fn test_unknown_command_fails() {
        let dir = TempDir::new().unwrap();
        refinery(&dir).arg("deploy").assert().failure();
    }
}

// =============================================================================
// Status
// =============================================================================

mod status {
    use super::*;

    #[test]
    fn test_status_on_empty_directory() {
        let dir = TempDir::new().unwrap();
        refinery(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("pending"))
            .stdout(predicate::str::contains("in-progress"))
            .stdout(predicate::str::contains("No iterations recorded"));
    }

    #[test]
    fn test_status_counts_buckets_and_reads_total() {
        let dir = TempDir::new().unwrap();
        write_job(&dir, "pending", "a");
        write_job(&dir, "pending", "b");
        write_job(&dir, "failed", "c");
        fs::write(
            dir.path().join("PRODUCT_STATE.md"),
            "# Product State\n\nTotal iterations: 7\n",
        )
        .unwrap();

        refinery(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::is_match(r"pending\s+2").unwrap())
            .stdout(predicate::str::is_match(r"failed\s+1").unwrap())
            .stdout(predicate::str::is_match(r"total\s+3").unwrap())
            .stdout(predicate::str::contains("Total iterations: 7"));
    }

    #[test]
    fn test_status_honors_jobs_dir() {
        let dir = TempDir::new().unwrap();
        write_job(&dir, "completed", "done");
        fs::rename(dir.path().join("jobs"), dir.path().join("elsewhere")).unwrap();

        refinery(&dir)
            .env("REFINERY_JOBS_DIR", "elsewhere")
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::is_match(r"completed\s+1").unwrap());
    }
}

// =============================================================================
// Configuration errors
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_run_without_credential_fails() {
        let dir = TempDir::new().unwrap();
        refinery(&dir)
            .env("REPO_URL", "https://example.com/repo.git")
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cannot start the improvement loop"));
    }

    #[test]
    fn test_run_without_repo_fails() {
        let dir = TempDir::new().unwrap();
        refinery(&dir)
            .env("ANTHROPIC_API_KEY", "sk-test")
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cannot start the improvement loop"));
    }

    #[test]
    fn test_invalid_worker_count_rejected() {
        let dir = TempDir::new().unwrap();
        refinery(&dir)
            .env("REFINERY_MAX_WORKERS", "0")
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("REFINERY_MAX_WORKERS"));
    }

    #[test]
    fn test_dotenv_file_is_loaded() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".env"), "REFINERY_JOBS_DIR=from-dotenv\n").unwrap();
        let bucket = dir.path().join("from-dotenv").join("pending");
        fs::create_dir_all(&bucket).unwrap();
        fs::write(bucket.join("x.json"), r#"{"id": "x", "title": "x"}"#).unwrap();

        refinery(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("from-dotenv"))
            .stdout(predicate::str::is_match(r"pending\s+1").unwrap());
    }
}
