use assert_cmd::Command;
use predicates::prelude::*;

fn harness_cmd(config_dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ips-harness").unwrap();
    cmd.arg("--config")
        .arg(config_dir.path().join("config.toml"))
        .env_remove("IPS_HARNESS_PORT")
        .env_remove("IPS_HARNESS_QUEUE_NUM")
        .env_remove("IPS_HARNESS_SUBJECT")
        .env_remove("IPS_HARNESS_LOG_LEVEL")
        .env_remove("IPS_HARNESS_LOG_FORMAT");
    cmd
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("ips-harness").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ips-harness 0.1.0"));
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("ips-harness").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("intrusion-prevention"))
        .stdout(predicate::str::contains("baseline"));
}

#[test]
fn test_cli_show_config_defaults() {
    let dir = tempfile::tempdir().unwrap();
    harness_cmd(&dir)
        .arg("show-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("queue_num = 33"))
        .stdout(predicate::str::contains("port = 2222"));
}

#[test]
fn test_cli_invalid_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.toml"),
        "[rounds]\naccept_timeout_ms = 100\n",
    )
    .unwrap();

    harness_cmd(&dir)
        .arg("show-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Accept timeout"));
}

#[test]
fn test_cli_run_missing_subject_fails() {
    let dir = tempfile::tempdir().unwrap();
    harness_cmd(&dir)
        .args([
            "run",
            "--skip-privilege-check",
            "--subject",
            "/nonexistent/ips",
        ])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_cli_baseline_passes_on_loopback() {
    let dir = tempfile::tempdir().unwrap();
    harness_cmd(&dir)
        .args(["baseline", "--port", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("permitted round 5: delivered as expected"))
        .stdout(predicate::str::contains("5 of 5"));
}
