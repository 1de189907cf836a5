//! Settings file management

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::UpgradeError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::upgrade::pipeline::PipelineParams;

/// Operator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Rotate the diagnostic log daily and delete expired days
    #[serde(default)]
    pub auto_clean_logs: bool,

    /// Days of diagnostic log kept when `auto_clean_logs` is set
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: usize,

    /// Device connection
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Whether connection overrides from the command line are written back
    #[serde(default = "default_true")]
    pub save_connection: bool,

    /// Package and upload directory on the device
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,

    /// Per-kind package names and extraction paths
    #[serde(default)]
    pub pipeline: PipelineParams,

    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

fn default_true() -> bool {
    true
}

fn default_log_retention_days() -> usize {
    30
}

fn default_remote_dir() -> String {
    "/media/sata/ue_data/".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            auto_clean_logs: false,
            log_retention_days: default_log_retention_days(),
            connection: ConnectionSettings::default(),
            save_connection: true,
            remote_dir: default_remote_dir(),
            pipeline: PipelineParams::default(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

impl Settings {
    /// Read settings, falling back to defaults when the file does not exist yet
    pub async fn load(file: &File) -> Result<Self, UpgradeError> {
        if !file.exists().await {
            info!("No settings at {}, using defaults", file.path().display());
            return Ok(Self::default());
        }
        file.read_json().await
    }

    pub async fn save(&self, file: &File) -> Result<(), UpgradeError> {
        file.write_json(self).await
    }

    /// Days of diagnostic log to keep, `None` when nothing is ever deleted
    pub fn log_retention(&self) -> Option<usize> {
        match self.auto_clean_logs && self.log_retention_days > 0 {
            true => Some(self.log_retention_days),
            false => None,
        }
    }
}

/// How to authenticate against the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    #[default]
    Key,
    Password,
}

impl std::str::FromStr for AuthKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "key" | "publickey" => Ok(AuthKind::Key),
            "password" => Ok(AuthKind::Password),
            _ => Err(format!("Invalid auth mode: {}", s)),
        }
    }
}

/// Device connection settings. Passwords are never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default)]
    pub auth: AuthKind,
}

fn default_host() -> String {
    "172.16.10.161".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_username() -> String {
    "root".to_string()
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_username(),
            auth: AuthKind::Key,
        }
    }
}

/// Time budgets, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_software_secs")]
    pub software_secs: u64,

    #[serde(default = "default_firmware_secs")]
    pub firmware_secs: u64,

    #[serde(default = "default_module_secs")]
    pub module_secs: u64,

    #[serde(default = "default_transfer_secs")]
    pub transfer_secs: u64,

    #[serde(default = "default_connection_test_secs")]
    pub connection_test_secs: u64,

    /// Operator commands from `--exec`
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,

    /// ssh `ConnectTimeout`
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    #[serde(default = "default_startup_secs")]
    pub startup_secs: u64,
}

fn default_software_secs() -> u64 {
    300
}

fn default_firmware_secs() -> u64 {
    900
}

fn default_module_secs() -> u64 {
    600
}

fn default_transfer_secs() -> u64 {
    300
}

fn default_connection_test_secs() -> u64 {
    10
}

fn default_command_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_kill_grace_secs() -> u64 {
    3
}

fn default_startup_secs() -> u64 {
    5
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            software_secs: default_software_secs(),
            firmware_secs: default_firmware_secs(),
            module_secs: default_module_secs(),
            transfer_secs: default_transfer_secs(),
            connection_test_secs: default_connection_test_secs(),
            command_secs: default_command_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            startup_secs: default_startup_secs(),
        }
    }
}
