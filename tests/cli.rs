// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

const PIPELINE: &str = r#"
version: "1"
name: "shop"
collaborators:
  ok:
    command: "true"
  image:
    command: 'echo "shop:$DEPLOYFLOW_COMMIT"'
environments:
  - name: staging
    promotion_branch: develop
  - name: production
    promotion_branch: main
    requires_gate: true
stages:
  - name: build
    steps:
      - kind: build
        collaborator: ok
  - name: image
    depends_on: [build]
    steps:
      - kind: build_image
        collaborator: image
        produces: image
      - kind: scan_image
        collaborator: ok
        policy: blocking
        reads: [image]
  - name: deploy-staging
    depends_on: [image]
    environment: staging
    steps:
      - kind: deploy
        collaborator: ok
        reads: [image]
      - kind: smoke_test
        collaborator: ok
  - name: deploy-production
    depends_on: [image]
    environment: production
    steps:
      - kind: deploy
        collaborator: ok
        reads: [image]
      - kind: smoke_test
        collaborator: ok
"#;

/// A deployflow command isolated from the user's settings
fn deployflow(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("deployflow").unwrap();
    cmd.current_dir(dir)
        .env("HOME", dir)
        .env("XDG_CONFIG_HOME", dir.join("config"))
        .env("DEPLOYFLOW_IDENTITY", "tester")
        .env("NO_COLOR", "1")
        .env_remove("DEPLOYFLOW_STATE_DIR");
    cmd
}

fn project() -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join(".deployflow.yaml"), PIPELINE).unwrap();
    temp_dir
}

#[test]
fn help_prints() {
    Command::cargo_bin("deployflow")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("rollback"));
}

#[test]
fn init_creates_valid_pipeline() {
    let temp_dir = TempDir::new().unwrap();

    deployflow(temp_dir.path())
        .args(["init", "shop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created .deployflow.yaml"));

    deployflow(temp_dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pipeline is valid!"));

    // Refuses to overwrite without --force
    deployflow(temp_dir.path()).arg("init").assert().failure();
    deployflow(temp_dir.path())
        .args(["init", "--force"])
        .assert()
        .success();
}

#[test]
fn validate_reports_missing_file() {
    let temp_dir = TempDir::new().unwrap();
    deployflow(temp_dir.path())
        .arg("validate")
        .assert()
        .failure();
}

#[test]
fn validate_rejects_shared_promotion_branch() {
    let temp_dir = TempDir::new().unwrap();
    let pipeline = PIPELINE.replace("promotion_branch: main", "promotion_branch: develop");
    std::fs::write(temp_dir.path().join(".deployflow.yaml"), pipeline).unwrap();

    deployflow(temp_dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stdout(predicate::str::contains("promotes to both"));
}

#[test]
fn graph_formats() {
    let temp_dir = project();

    deployflow(temp_dir.path())
        .arg("graph")
        .assert()
        .success()
        .stdout(predicate::str::contains("deploy-staging → staging"));

    deployflow(temp_dir.path())
        .args(["graph", "--format", "mermaid"])
        .assert()
        .success()
        .stdout(predicate::str::contains("graph"));
}

#[test]
fn dry_run_shows_plan_without_state() {
    let temp_dir = project();

    deployflow(temp_dir.path())
        .args(["run", "--branch", "develop", "--commit", "abc1234", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("deploy-production"))
        .stdout(predicate::str::contains("branch mismatch"));

    assert!(!temp_dir.path().join(".deployflow/state").exists());
}

#[test]
fn develop_run_promotes_staging() {
    let temp_dir = project();

    deployflow(temp_dir.path())
        .args(["run", "--branch", "develop", "--commit", "abc1234"])
        .assert()
        .success()
        .stdout(predicate::str::contains("staging is now at abc1234"));

    // Deploys lock the environment in the shared state directory
    let state = temp_dir.path().join(".deployflow/state");
    assert!(state.join("locks/staging.lock").exists());
    assert!(state.join("environments/staging.lock").exists());

    deployflow(temp_dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("known-good: abc1234"));

    deployflow(temp_dir.path())
        .args(["history", "--environment", "staging"])
        .assert()
        .success()
        .stdout(predicate::str::contains("succeeded"));
}

#[test]
fn rejected_gate_fails_the_run() {
    let temp_dir = project();

    deployflow(temp_dir.path())
        .args([
            "run",
            "--branch",
            "main",
            "--commit",
            "abc1234",
            "--reject",
            "freeze",
        ])
        .assert()
        .failure()
        .stdout(predicate::str::contains("rejected by tester: freeze"));

    deployflow(temp_dir.path())
        .args(["run", "--branch", "main", "--commit", "abc1234", "--approve"])
        .assert()
        .success()
        .stdout(predicate::str::contains("production is now at abc1234"));
}

#[test]
fn emergency_reset_needs_confirmation() {
    if which::which("git").is_err() {
        return;
    }
    let temp_dir = project();

    deployflow(temp_dir.path())
        .args(["run", "--branch", "develop", "--commit", "good1234"])
        .assert()
        .success();

    deployflow(temp_dir.path())
        .args(["rollback", "staging", "--bad", "bad12345", "--critical", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("emergency-reset"))
        .stdout(predicate::str::contains("git reset --hard good1234"));

    deployflow(temp_dir.path())
        .args(["rollback", "staging", "--bad", "bad12345", "--critical"])
        .assert()
        .failure();

    deployflow(temp_dir.path())
        .args([
            "rollback",
            "staging",
            "--bad",
            "bad12345",
            "--critical",
            "--confirm",
            "--reason",
            "outage",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("recorded"));

    deployflow(temp_dir.path())
        .args(["history", "--environment", "staging"])
        .assert()
        .success()
        .stdout(predicate::str::contains("emergency-reset by tester"));
}

#[test]
fn reconcile_with_nothing_pending() {
    let temp_dir = project();

    deployflow(temp_dir.path())
        .arg("reconcile")
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to reconcile"));
}
