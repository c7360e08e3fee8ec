use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("keygate").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("keygate 0.1.0"));
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("keygate").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Credential and quota enforcement engine",
        ))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("check-config"))
        .stdout(predicate::str::contains("issue-credential"));
}

#[test]
fn test_cli_no_command() {
    let mut cmd = Command::cargo_bin("keygate").unwrap();
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("No command specified"));
}

#[test]
fn test_check_config_valid_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
[server]
bind = "127.0.0.1:9191"

[rate_limit.default_policy]
policy = "deny_all"
"#,
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("keygate").unwrap();
    cmd.args(["check-config", "--print", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration valid"))
        .stdout(predicate::str::contains("127.0.0.1:9191"))
        .stdout(predicate::str::contains("deny_all"));
}

#[test]
fn test_check_config_rejects_invalid_values() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
[telemetry]
queue_capacity = 0
"#,
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("keygate").unwrap();
    cmd.args(["check-config", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("telemetry"));
}

#[test]
fn test_check_config_rejects_malformed_toml() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "[logging\nlevel = 1").unwrap();

    let mut cmd = Command::cargo_bin("keygate").unwrap();
    cmd.args(["check-config", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[test]
fn test_issue_credential_bootstraps_journal() {
    let dir = TempDir::new().unwrap();
    let credentials = dir.path().join("credentials.jsonl");
    let audit = dir.path().join("audit.jsonl");
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        format!(
            "[credentials]\njournal_path = {:?}\n\n[audit]\njournal_path = {:?}\n",
            credentials.display().to_string(),
            audit.display().to_string()
        ),
    )
    .unwrap();

    let mut cmd = Command::cargo_bin("keygate").unwrap();
    let output = cmd
        .args(["issue-credential", "--owner", "root", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("kg_"))
        .get_output()
        .stdout
        .clone();
    let id = String::from_utf8(output).unwrap().trim().to_string();

    let journal = fs::read_to_string(&credentials).unwrap();
    assert!(journal.contains(&id));
    assert!(journal.contains("root"));
    let trail = fs::read_to_string(&audit).unwrap();
    assert!(trail.contains("credential_issued"));
    assert!(trail.contains("\"cli\""));
}

#[test]
fn test_issue_credential_needs_journal() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "[server]\nbind = \"127.0.0.1:9191\"\n").unwrap();

    let mut cmd = Command::cargo_bin("keygate").unwrap();
    cmd.args(["issue-credential", "--owner", "root", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("journal_path"));
}
