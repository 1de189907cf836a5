//! Settings and command line tests

use std::path::PathBuf;
use std::time::Duration;

use fwctl::app::options::{Command, EngineOptions};
use fwctl::app::run::{parse_cli_args, parse_options, remote_target};
use fwctl::filesys::file::File;
use fwctl::logs::LogLevel;
use fwctl::models::job::{AuthMode, JobKind};
use fwctl::storage::layout::StorageLayout;
use fwctl::storage::settings::{AuthKind, Settings};

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[test]
fn test_settings_defaults() {
    let settings = Settings::default();
    assert_eq!(settings.connection.host, "172.16.10.161");
    assert_eq!(settings.connection.port, 22);
    assert_eq!(settings.connection.username, "root");
    assert_eq!(settings.connection.auth, AuthKind::Key);
    assert_eq!(settings.remote_dir, "/media/sata/ue_data/");
    assert!(settings.save_connection);
    assert_eq!(settings.timeouts.firmware_secs, 900);
    assert_eq!(settings.pipeline.firmware.device, "/dev/mmcblk0p1");
    assert_eq!(settings.timeouts.command_secs, 120);
    assert!(!settings.auto_clean_logs);
    assert_eq!(settings.log_retention_days, 30);
    assert_eq!(settings.log_retention(), None);
}

#[test]
fn test_log_retention() {
    let settings: Settings =
        serde_json::from_str(r#"{ "auto_clean_logs": true, "log_retention_days": 7 }"#).unwrap();
    assert_eq!(settings.log_retention(), Some(7));

    let settings: Settings = serde_json::from_str(r#"{ "auto_clean_logs": true }"#).unwrap();
    assert_eq!(settings.log_retention(), Some(30));

    // zero days would delete everything, so it means keep all
    let settings: Settings =
        serde_json::from_str(r#"{ "auto_clean_logs": true, "log_retention_days": 0 }"#).unwrap();
    assert_eq!(settings.log_retention(), None);

    let settings: Settings = serde_json::from_str(r#"{ "log_retention_days": 7 }"#).unwrap();
    assert_eq!(settings.log_retention(), None);
}

#[test]
fn test_partial_settings_fill_defaults() {
    let settings: Settings = serde_json::from_str(
        r#"{
            "log_level": "debug",
            "connection": { "host": "10.0.0.7", "auth": "password" },
            "timeouts": { "module_secs": 1200 },
            "pipeline": { "module": { "tool": "flashtool" } }
        }"#,
    )
    .unwrap();

    assert_eq!(settings.log_level, LogLevel::Debug);
    assert_eq!(settings.connection.host, "10.0.0.7");
    assert_eq!(settings.connection.port, 22);
    assert_eq!(settings.connection.auth, AuthKind::Password);
    assert_eq!(settings.timeouts.module_secs, 1200);
    assert_eq!(settings.timeouts.software_secs, 300);
    assert_eq!(settings.pipeline.module.tool, "flashtool");
    assert_eq!(settings.pipeline.module.payload, "ku5p_package.bit");
    assert!(settings.save_connection);
}

#[tokio::test]
async fn test_settings_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new(dir.path());
    layout.setup().await.unwrap();
    let file = layout.settings_file();

    // missing file means defaults
    let mut settings = Settings::load(&file).await.unwrap();
    assert_eq!(settings.connection.host, "172.16.10.161");

    settings.connection.host = "192.168.1.20".to_string();
    settings.timeouts.transfer_secs = 42;
    settings.save(&file).await.unwrap();

    let loaded = Settings::load(&file).await.unwrap();
    assert_eq!(loaded.connection.host, "192.168.1.20");
    assert_eq!(loaded.timeouts.transfer_secs, 42);

    let raw = file.read_string().await.unwrap();
    assert!(!raw.contains("password\":"));
}

#[tokio::test]
async fn test_corrupt_settings_are_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let file = File::new(dir.path().join("settings.json"));
    file.write_string("{ not json").await.unwrap();
    assert!(Settings::load(&file).await.is_err());
}

#[test]
fn test_engine_options_from_settings() {
    let mut settings = Settings::default();
    settings.timeouts.kill_grace_secs = 7;
    settings.remote_dir = "/data/".to_string();

    let options = EngineOptions::from_settings(&settings);
    assert_eq!(options.remote_dir, "/data/");
    assert_eq!(options.supervisor.kill_grace, Duration::from_secs(7));
    assert_eq!(options.budgets.for_kind(JobKind::FirmwareUpgrade), Duration::from_secs(900));
    assert_eq!(options.budgets.connection_test, Duration::from_secs(10));
    assert_eq!(options.budgets.command, Duration::from_secs(120));
}

#[test]
fn test_parse_cli_args() {
    let parsed = parse_cli_args(args(&["--upgrade=firmware", "--dry-run", "--host=10.0.0.9", "stray"]));
    assert_eq!(parsed.get("upgrade").map(String::as_str), Some("firmware"));
    assert_eq!(parsed.get("dry-run").map(String::as_str), Some("true"));
    assert_eq!(parsed.get("host").map(String::as_str), Some("10.0.0.9"));
    assert!(!parsed.contains_key("stray"));
}

#[test]
fn test_parse_options() {
    let parsed = parse_cli_args(args(&[
        "--upload=/tmp/boots.tar.gz",
        "--port=2222",
        "--auth=password",
        "--home=/tmp/fwctl-home",
        "--save-settings",
    ]));
    let options = parse_options(&parsed).unwrap();

    assert_eq!(options.command, Command::Upload(PathBuf::from("/tmp/boots.tar.gz")));
    assert_eq!(options.overrides.port, Some(2222));
    assert_eq!(options.overrides.auth, Some(AuthKind::Password));
    assert_eq!(options.layout.base_dir, PathBuf::from("/tmp/fwctl-home"));
    assert!(options.save_settings);
    assert!(!options.dry_run);

    let mut settings = Settings::default();
    options.overrides.apply(&mut settings);
    assert_eq!(settings.connection.port, 2222);
    assert_eq!(settings.connection.host, "172.16.10.161");
}

#[test]
fn test_parse_exec_keeps_whole_command() {
    let parsed = parse_cli_args(args(&["--exec=grep -c ok=1 /var/log/messages"]));
    let options = parse_options(&parsed).unwrap();
    assert_eq!(
        options.command,
        Command::Exec("grep -c ok=1 /var/log/messages".to_string())
    );

    let both = parse_cli_args(args(&["--exec=uptime", "--test-connection"]));
    assert!(parse_options(&both).is_err());
}

#[test]
fn test_parse_options_rejects_bad_input() {
    let none = parse_cli_args(args(&["--host=10.0.0.9"]));
    assert!(parse_options(&none).is_err());

    let two = parse_cli_args(args(&["--test-connection", "--upgrade=software"]));
    assert!(parse_options(&two).is_err());

    let kind = parse_cli_args(args(&["--upgrade=kernel"]));
    assert!(parse_options(&kind).is_err());

    let transfer = parse_cli_args(args(&["--upgrade=transfer"]));
    assert!(parse_options(&transfer).is_err());

    let port = parse_cli_args(args(&["--test-connection", "--port=ssh"]));
    assert!(parse_options(&port).is_err());
}

#[test]
fn test_remote_target_auth() {
    let mut settings = Settings::default();
    let target = remote_target(&settings.connection, None).unwrap();
    assert!(matches!(target.auth, AuthMode::Key));
    assert_eq!(target.destination(), "root@172.16.10.161");

    settings.connection.auth = AuthKind::Password;
    assert!(remote_target(&settings.connection, None).is_err());
    assert!(remote_target(&settings.connection, Some(String::new())).is_err());

    let target = remote_target(&settings.connection, Some("pw".to_string())).unwrap();
    assert_eq!(target.auth.name(), "password");
}
