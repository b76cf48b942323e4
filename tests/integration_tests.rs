//! Integration tests for Conveyor
//!
//! These tests drive the binary end to end with a shell command standing in
//! for the agent.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create a conveyor Command
fn conveyor() -> Command {
    cargo_bin_cmd!("conveyor")
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Write `.conveyor/conveyor.toml` with a fast retry policy and the given agent script.
fn write_config(dir: &Path, agent_script: &str) {
    let conveyor_dir = dir.join(".conveyor");
    fs::create_dir_all(&conveyor_dir).unwrap();
    fs::write(
        conveyor_dir.join("conveyor.toml"),
        format!(
            r#"
[fleet]
max_parallel_issues = 2

[retry]
max_attempts = 1
base_delay_ms = 1
max_delay_ms = 1

[agent]
command = "sh"
args = ["-c", "{}"]
timeout_secs = 30
"#,
            agent_script
        ),
    )
    .unwrap();
}

fn write_issues(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("issues.json");
    fs::write(
        &path,
        r#"{"issues": [
            {"number": 1, "title": "Base"},
            {"number": 2, "title": "Middle", "depends_on": [1]},
            {"number": 3, "title": "Top", "depends_on": [1, 2]}
        ]}"#,
    )
    .unwrap();
    path
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_conveyor_help() {
        conveyor()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("plan"));
    }

    #[test]
    fn test_conveyor_version() {
        conveyor().arg("--version").assert().success();
    }

    #[test]
    fn test_run_requires_issues_file() {
        conveyor()
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("--issues"));
    }

    #[test]
    fn test_invalid_log_format_rejected() {
        conveyor()
            .args(["--log-format", "xml", "status"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Task Plan Tests
// =============================================================================

mod plan {
    use super::*;

    #[test]
    fn test_valid_plan_prints_waves() {
        let dir = create_temp_project();
        let plan = dir.path().join("plan.json");
        fs::write(
            &plan,
            r#"[
                {"id": "schema"},
                {"id": "api", "depends_on": ["schema"]},
                {"id": "ui", "depends_on": ["schema"]},
                {"id": "docs", "depends_on": ["api", "ui"]}
            ]"#,
        )
        .unwrap();

        conveyor()
            .arg("plan")
            .arg(&plan)
            .assert()
            .success()
            .stdout(predicate::str::contains("4 task(s) in 3 wave(s)"))
            .stdout(predicate::str::contains("Wave 1: schema"))
            .stdout(predicate::str::contains("Wave 3: docs"));
    }

    #[test]
    fn test_cyclic_plan_rejected() {
        let dir = create_temp_project();
        let plan = dir.path().join("plan.json");
        fs::write(
            &plan,
            r#"{"tasks": [
                {"id": "a", "depends_on": ["b"]},
                {"id": "b", "depends_on": ["a"]}
            ]}"#,
        )
        .unwrap();

        conveyor()
            .arg("plan")
            .arg(&plan)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid task plan"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let dir = create_temp_project();
        let plan = dir.path().join("plan.json");
        fs::write(&plan, r#"[{"id": "a", "depends_on": ["ghost"]}]"#).unwrap();

        conveyor().arg("plan").arg(&plan).assert().failure();
    }

    #[test]
    fn test_missing_plan_file() {
        conveyor()
            .args(["plan", "/nonexistent/plan.json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read task plan"));
    }
}

// =============================================================================
// Fleet Runs
// =============================================================================

mod fleet_run {
    use super::*;

    #[test]
    fn test_run_completes_chain() {
        let dir = create_temp_project();
        write_config(dir.path(), "cat");
        let issues = write_issues(dir.path());

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("run")
            .arg("--issues")
            .arg(&issues)
            .assert()
            .success()
            .stdout(predicate::str::contains("completed #3"))
            .stdout(predicate::str::contains("Completed: 3"));

        let progress = dir.path().join(".conveyor/state/progress/issue-1");
        assert!(progress.join("01-analysis.md").exists());
        assert!(progress.join("05-publication.md").exists());
        assert!(dir.path().join(".conveyor/state/fleet.json").exists());
        assert!(dir.path().join(".conveyor/state/issues/issue-3.json").exists());
    }

    #[test]
    fn test_review_response_skips_analysis_and_planning() {
        let dir = create_temp_project();
        write_config(dir.path(), "cat");
        let issues = write_issues(dir.path());

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("run")
            .arg("--issues")
            .arg(&issues)
            .arg("--review-response")
            .assert()
            .success()
            .stdout(predicate::str::contains("Completed: 3"));

        let progress = dir.path().join(".conveyor/state/progress/issue-2");
        assert!(progress.join("03-implementation.md").exists());
        assert!(progress.join("05-publication.md").exists());
        assert!(!progress.join("01-analysis.md").exists());
        assert!(!progress.join("02-planning.md").exists());
    }

    #[test]
    fn test_failed_issue_blocks_dependents() {
        let dir = create_temp_project();
        write_config(
            dir.path(),
            r#"if [ \"$CONVEYOR_ISSUE\" = 1 ]; then echo boom >&2; exit 1; fi; cat"#,
        );
        let issues = write_issues(dir.path());

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("run")
            .arg("--issues")
            .arg(&issues)
            .assert()
            .failure()
            .stdout(predicate::str::contains("blocked #2"))
            .stdout(predicate::str::contains("blocked #3"))
            .stdout(predicate::str::contains("Failed:    1"))
            .stdout(predicate::str::contains("Blocked:   2"));

        let fleet = fs::read_to_string(dir.path().join(".conveyor/state/fleet.json")).unwrap();
        let fleet: serde_json::Value = serde_json::from_str(&fleet).unwrap();
        assert_eq!(fleet["issues"]["1"]["status"], "failed");
        assert_eq!(fleet["issues"]["2"]["status"], "not-started");
    }

    #[test]
    fn test_rerun_skips_completed_issues() {
        let dir = create_temp_project();
        write_config(dir.path(), "cat");
        let issues = write_issues(dir.path());

        for _ in 0..2 {
            conveyor()
                .arg("--project-dir")
                .arg(dir.path())
                .arg("run")
                .arg("--issues")
                .arg(&issues)
                .assert()
                .success();
        }

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("run")
            .arg("--issues")
            .arg(&issues)
            .assert()
            .success()
            .stdout(predicate::str::contains("Skipped:   3"));
    }

    #[test]
    fn test_fresh_clears_state() {
        let dir = create_temp_project();
        write_config(dir.path(), "cat");
        let issues = write_issues(dir.path());

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["run", "--issues"])
            .arg(&issues)
            .assert()
            .success();

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["run", "--fresh", "--issues"])
            .arg(&issues)
            .assert()
            .success()
            .stdout(predicate::str::contains("Completed: 3"))
            .stdout(predicate::str::contains("Skipped").not());
    }

    #[test]
    fn test_cyclic_issues_rejected() {
        let dir = create_temp_project();
        write_config(dir.path(), "cat");
        let issues = dir.path().join("issues.json");
        fs::write(
            &issues,
            r#"{"issues": [
                {"number": 1, "title": "A", "depends_on": [2]},
                {"number": 2, "title": "B", "depends_on": [1]}
            ]}"#,
        )
        .unwrap();

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("run")
            .arg("--issues")
            .arg(&issues)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cycle detected"));
    }
}

// =============================================================================
// Status and Reset
// =============================================================================

mod state {
    use super::*;

    #[test]
    fn test_status_without_runs() {
        let dir = create_temp_project();

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No issues recorded yet"));
    }

    #[test]
    fn test_status_after_run() {
        let dir = create_temp_project();
        write_config(dir.path(), "cat");
        let issues = write_issues(dir.path());

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["run", "--issues"])
            .arg(&issues)
            .assert()
            .success();

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Completed: 3"))
            .stdout(predicate::str::contains("Middle"));
    }

    #[test]
    fn test_reset_unknown_issue() {
        let dir = create_temp_project();

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["reset", "42"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to reset for issue #42"));
    }

    #[test]
    fn test_reset_reruns_issue() {
        let dir = create_temp_project();
        write_config(dir.path(), "cat");
        let issues = write_issues(dir.path());

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["run", "--issues"])
            .arg(&issues)
            .assert()
            .success();

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["reset", "3"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Reset issue #3"));

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["run", "--issues"])
            .arg(&issues)
            .assert()
            .success()
            .stdout(predicate::str::contains("Skipped:   2"))
            .stdout(predicate::str::contains("started #3"));
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_invalid_config_reports_path() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".conveyor")).unwrap();
        fs::write(dir.path().join(".conveyor/conveyor.toml"), "[fleet\nbroken").unwrap();

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("conveyor.toml"));
    }

    #[test]
    fn test_invalid_pipeline_rejected() {
        let dir = create_temp_project();
        write_config(dir.path(), "cat");
        fs::write(
            dir.path().join(".conveyor/pipeline.json"),
            r#"{"phases": [
                {"id": 2, "name": "Second", "critical": true},
                {"id": 1, "name": "First", "critical": true}
            ]}"#,
        )
        .unwrap();
        let issues = write_issues(dir.path());

        conveyor()
            .arg("--project-dir")
            .arg(dir.path())
            .args(["run", "--issues"])
            .arg(&issues)
            .assert()
            .failure();
    }
}
