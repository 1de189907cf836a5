//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::models::job::JobKind;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{AuthKind, Settings, TimeoutSettings};
use crate::upgrade::pipeline::PipelineParams;
use crate::upgrade::supervisor::SupervisorOptions;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Package and upload directory on the device
    pub remote_dir: String,

    /// Builder input
    pub pipeline: PipelineParams,

    /// Time budgets per job kind
    pub budgets: JobBudgets,

    /// Kill grace and startup deadline
    pub supervisor: SupervisorOptions,

    /// ssh `ConnectTimeout` in seconds
    pub connect_timeout_secs: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            remote_dir: "/media/sata/ue_data/".to_string(),
            pipeline: PipelineParams::default(),
            budgets: JobBudgets::default(),
            supervisor: SupervisorOptions::default(),
            connect_timeout_secs: 30,
        }
    }
}

impl EngineOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let timeouts = &settings.timeouts;
        Self {
            remote_dir: settings.remote_dir.clone(),
            pipeline: settings.pipeline.clone(),
            budgets: JobBudgets::from(timeouts),
            supervisor: SupervisorOptions {
                kill_grace: Duration::from_secs(timeouts.kill_grace_secs),
                startup_deadline: Duration::from_secs(timeouts.startup_secs),
            },
            connect_timeout_secs: timeouts.connect_timeout_secs,
        }
    }
}

/// Budget covering every process-running phase of a job
#[derive(Debug, Clone)]
pub struct JobBudgets {
    pub software: Duration,
    pub firmware: Duration,
    pub module: Duration,
    pub transfer: Duration,
    pub connection_test: Duration,
    pub command: Duration,
}

impl Default for JobBudgets {
    fn default() -> Self {
        Self::from(&TimeoutSettings::default())
    }
}

impl From<&TimeoutSettings> for JobBudgets {
    fn from(timeouts: &TimeoutSettings) -> Self {
        Self {
            software: Duration::from_secs(timeouts.software_secs),
            firmware: Duration::from_secs(timeouts.firmware_secs),
            module: Duration::from_secs(timeouts.module_secs),
            transfer: Duration::from_secs(timeouts.transfer_secs),
            connection_test: Duration::from_secs(timeouts.connection_test_secs),
            command: Duration::from_secs(timeouts.command_secs),
        }
    }
}

impl JobBudgets {
    pub fn for_kind(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::SoftwareUpgrade => self.software,
            JobKind::FirmwareUpgrade => self.firmware,
            JobKind::ModuleUpgrade => self.module,
            JobKind::FileTransfer => self.transfer,
        }
    }
}

/// What the operator asked the CLI to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    TestConnection,
    Upgrade(JobKind),
    Upload(PathBuf),
    /// Shell command to run on the device
    Exec(String),
}

/// Connection values given on the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub auth: Option<AuthKind>,
    pub remote_dir: Option<String>,
}

impl ConnectionOverrides {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Write the given values into `settings`
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(host) = &self.host {
            settings.connection.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.connection.port = port;
        }
        if let Some(username) = &self.username {
            settings.connection.username = username.clone();
        }
        if let Some(auth) = self.auth {
            settings.connection.auth = auth;
        }
        if let Some(remote_dir) = &self.remote_dir {
            settings.remote_dir = remote_dir.clone();
        }
    }
}

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub command: Command,

    /// Storage layout paths
    pub layout: StorageLayout,

    pub overrides: ConnectionOverrides,

    /// Replace the process launcher with canned output
    pub dry_run: bool,

    /// Write connection overrides back to the settings file
    pub save_settings: bool,
}
