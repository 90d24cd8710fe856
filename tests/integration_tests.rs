//! Integration tests: CLI smoke tests against the built `safegate` binary,
//! each with its own config and state directory.

mod common;

use serde_json::Value;

use usb_safegate::cleanup::ledger::load_ledger;
use usb_safegate::daemon::status::{ServicePhase, StatusReporter};

fn path_str(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

#[test]
fn help_command_prints_usage() {
    let result = common::run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: safegate [OPTIONS] <COMMAND>"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
}

#[test]
fn version_command_prints_version() {
    let result = common::run_cli_case("version_command_prints_version", &["--version"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(
        result.stdout.contains("safegate") && result.stdout.contains(env!("CARGO_PKG_VERSION")),
        "missing version output; log: {}",
        result.log_path.display()
    );
}

#[test]
fn subcommand_help_flags_work() {
    for sub in ["daemon", "status", "devices", "cleanup", "check", "config", "completions"] {
        let result = common::run_cli_case(&format!("help_{sub}"), &[sub, "--help"]);
        assert!(
            result.status.success(),
            "{sub} --help failed; log: {}",
            result.log_path.display()
        );
    }
}

#[test]
fn completions_generate_bash_script() {
    let result = common::run_cli_case("completions_bash", &["completions", "bash"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(result.stdout.contains("_safegate"), "log: {}", result.log_path.display());
}

#[test]
fn missing_explicit_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    let result = common::run_cli_case("missing_config", &["--config", &path_str(&missing), "config"]);
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(
        result.stderr.contains("safegate: [SG-1002]"),
        "log: {}",
        result.log_path.display()
    );
}

#[test]
fn config_prints_effective_toml_with_masked_password() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_isolated_config(
        dir.path(),
        "[upload]\nbase_url = \"https://cloud.example.org\"\nusername = \"gate\"\npassword = \"hunter2\"\n\n[cleanup]\nretention_days = 3\n",
    );
    let result = common::run_cli_case("config_show", &["--config", &path_str(&config), "config"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(result.stdout.contains("[cleanup]"));
    assert!(result.stdout.contains("retention_days = 3"));
    assert!(result.stdout.contains("********"));
    assert!(!result.stdout.contains("hunter2"), "log: {}", result.log_path.display());
}

#[test]
fn invalid_config_values_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_isolated_config(dir.path(), "[cleanup]\nretention_days = 0\n");
    let result = common::run_cli_case("config_invalid", &["--config", &path_str(&config), "config"]);
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("SG-1001"), "log: {}", result.log_path.display());
}

#[test]
fn status_without_record_reports_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_isolated_config(dir.path(), "");

    let human = common::run_cli_case("status_human", &["--config", &path_str(&config), "status"]);
    assert!(human.status.success(), "log: {}", human.log_path.display());
    assert!(human.stdout.contains("not running"), "log: {}", human.log_path.display());

    let json = common::run_cli_case(
        "status_json",
        &["--config", &path_str(&config), "--json", "status"],
    );
    assert!(json.status.success(), "log: {}", json.log_path.display());
    let payload: Value = serde_json::from_str(json.stdout.trim()).unwrap();
    assert_eq!(payload["running"], Value::Bool(false));
    assert!(payload["status"].is_null());
}

#[test]
fn status_reads_a_stopped_record() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_isolated_config(dir.path(), "");
    let reporter = StatusReporter::new(dir.path().join("status.json"), 10);
    reporter.record_error("Upload failed: connection refused");
    reporter.set(ServicePhase::Stopped, "Service stopped");

    let result = common::run_cli_case(
        "status_stopped_json",
        &["--config", &path_str(&config), "--json", "status"],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload: Value = serde_json::from_str(result.stdout.trim()).unwrap();
    assert_eq!(payload["running"], Value::Bool(false));
    assert_eq!(payload["status"]["phase"], "stopped");
    assert_eq!(
        payload["status"]["errors"][0]["message"],
        "Upload failed: connection refused"
    );
}

#[test]
fn cleanup_add_list_remove_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_isolated_config(dir.path(), "");
    let cfg = path_str(&config);
    let artifact = dir.path().join("usb_transfer_20250101_120000.zip");

    let add = common::run_cli_case(
        "cleanup_add",
        &[
            "--config",
            &cfg,
            "cleanup",
            "add",
            &path_str(&artifact),
            "USB_Transfers/usb_transfer_20250101_120000.zip",
            "--days",
            "3",
        ],
    );
    assert!(add.status.success(), "log: {}", add.log_path.display());
    assert!(add.stdout.contains("in 3 days"), "log: {}", add.log_path.display());

    let ledger = load_ledger(&dir.path().join("ledger.json")).unwrap();
    assert_eq!(ledger.entries.len(), 1);
    assert_eq!(ledger.entries[0].retention_days, 3);

    let list = common::run_cli_case("cleanup_list", &["--config", &cfg, "--json", "cleanup", "list"]);
    assert!(list.status.success(), "log: {}", list.log_path.display());
    let payload: Value = serde_json::from_str(list.stdout.trim()).unwrap();
    assert_eq!(payload["total_scheduled"], 1);
    assert_eq!(payload["pending"], 1);
    assert_eq!(payload["entries"][0]["days_remaining"], 3);

    let remove = common::run_cli_case(
        "cleanup_remove",
        &["--config", &cfg, "cleanup", "remove", "usb_transfer_20250101_120000.zip"],
    );
    assert!(remove.status.success(), "log: {}", remove.log_path.display());
    assert!(load_ledger(&dir.path().join("ledger.json")).unwrap().entries.is_empty());

    let again = common::run_cli_case(
        "cleanup_remove_missing",
        &["--config", &cfg, "cleanup", "remove", "usb_transfer_20250101_120000.zip"],
    );
    assert_eq!(again.status.code(), Some(1), "log: {}", again.log_path.display());
    assert!(again.stderr.contains("no scheduled artifact"));
}

#[test]
fn cleanup_mutations_refuse_while_daemon_is_alive() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_isolated_config(dir.path(), "");
    // This test process stands in for a live daemon.
    let reporter = StatusReporter::new(dir.path().join("status.json"), 10);
    reporter.set(ServicePhase::Idle, "Service started - monitoring for USB drives");

    let result = common::run_cli_case(
        "cleanup_add_refused",
        &["--config", &path_str(&config), "cleanup", "add", "/tmp/a.zip", "USB_Transfers/a.zip"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("owns the cleanup ledger"), "log: {}", result.log_path.display());
    assert!(!dir.path().join("ledger.json").exists());
}

#[test]
fn cleanup_run_requires_an_upload_server() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_isolated_config(dir.path(), "");
    let result = common::run_cli_case(
        "cleanup_run_unconfigured",
        &["--config", &path_str(&config), "cleanup", "run"],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("upload.base_url"), "log: {}", result.log_path.display());
}

#[test]
fn check_reports_failures_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::write_isolated_config(
        dir.path(),
        "[scanner]\ncommand = \"/nonexistent/safegate/clamscan\"\n",
    );
    let result = common::run_cli_case("check_json", &["--config", &path_str(&config), "--json", "check"]);
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    let payload: Value = serde_json::from_str(result.stdout.trim()).unwrap();
    assert_eq!(payload["ok"], Value::Bool(false));
    let checks = payload["checks"].as_array().unwrap();
    let scanner = checks.iter().find(|c| c["name"] == "scanner").unwrap();
    assert_eq!(scanner["ok"], Value::Bool(false));
    let ledger = checks.iter().find(|c| c["name"] == "ledger").unwrap();
    assert_eq!(ledger["ok"], Value::Bool(true));
}
