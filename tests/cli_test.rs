//! CLI end-to-end tests for the clipforge binary.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::process::Command;
use tempfile::tempdir;

#[allow(deprecated)]
fn clipforge_cmd() -> Command {
    Command::cargo_bin("clipforge").unwrap()
}

#[test]
fn no_args_shows_usage() {
    clipforge_cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn version_subcommand() {
    clipforge_cmd()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("clipforge"));
}

#[test]
fn start_help_describes_server() {
    clipforge_cmd()
        .args(["start", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Start the HTTP API"));
}

#[test]
fn start_rejects_out_of_range_port() {
    clipforge_cmd()
        .args(["start", "--port", "99999"])
        .assert()
        .failure();
}

#[test]
fn probe_nonexistent_file_fails() {
    clipforge_cmd()
        .args(["probe", "/nonexistent/path/clip.mp4"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn validate_accepts_good_config() {
    let temp = tempdir().unwrap();
    let config_file = temp.path().join("clipforge.toml");
    fs::write(
        &config_file,
        r#"
[server]
host = "127.0.0.1"
port = 8080

[orchestrator]
workers = 3
queue_ceiling = 10
"#,
    )
    .unwrap();

    clipforge_cmd()
        .args(["validate", config_file.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("Workers: 3 (queue ceiling 10)"));
}

#[test]
fn validate_rejects_zero_workers() {
    let temp = tempdir().unwrap();
    let config_file = temp.path().join("clipforge.toml");
    fs::write(&config_file, "[orchestrator]\nworkers = 0\n").unwrap();

    clipforge_cmd()
        .args(["--config", config_file.to_str().unwrap(), "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("workers must be at least 1"));
}

#[test]
fn validate_rejects_malformed_toml() {
    let temp = tempdir().unwrap();
    let config_file = temp.path().join("clipforge.toml");
    fs::write(&config_file, "[server\nport = ").unwrap();

    clipforge_cmd()
        .args(["validate", config_file.to_str().unwrap()])
        .assert()
        .failure();
}

#[cfg(unix)]
#[test]
fn probe_prints_json_from_configured_ffprobe() {
    use std::os::unix::fs::PermissionsExt;

    let temp = tempdir().unwrap();
    let report = temp.path().join("probe.json");
    fs::write(
        &report,
        r#"{"format": {"duration": "20.0"}, "streams": [{"codec_type": "video", "codec_name": "h264"}]}"#,
    )
    .unwrap();
    let ffprobe = temp.path().join("ffprobe");
    fs::write(&ffprobe, format!("#!/bin/sh\ncat '{}'\n", report.display())).unwrap();
    fs::set_permissions(&ffprobe, fs::Permissions::from_mode(0o755)).unwrap();

    let config_file = temp.path().join("clipforge.toml");
    fs::write(
        &config_file,
        format!("[tools]\nffprobe_path = \"{}\"\n", ffprobe.display()),
    )
    .unwrap();
    let media = temp.path().join("clip.mp4");
    fs::write(&media, b"bytes").unwrap();

    clipforge_cmd()
        .args([
            "--config",
            config_file.to_str().unwrap(),
            "probe",
            "--json",
            media.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("h264"));
}

#[test]
fn validate_accepts_config_flag_after_subcommand() {
    let temp = tempdir().unwrap();
    let config_file = temp.path().join("clipforge.toml");
    fs::write(&config_file, "[orchestrator]\nworkers = 4\n").unwrap();

    clipforge_cmd()
        .args(["validate", "--config", config_file.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Workers: 4"));
}
