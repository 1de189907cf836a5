//! Job models

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::UpgradeError;
use crate::upgrade::classifier::Classification;
use crate::upgrade::fsm::JobPhase;
use crate::utils::generate_uuid;

/// Unique job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(generate_uuid())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of operator action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Extract an application archive into its install path
    SoftwareUpgrade,
    /// Write a boot archive onto the device's block partition
    FirmwareUpgrade,
    /// Run a packaged upgrade tool against its binary payload
    ModuleUpgrade,
    /// Copy a local file to the device and verify it
    FileTransfer,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SoftwareUpgrade => "software_upgrade",
            JobKind::FirmwareUpgrade => "firmware_upgrade",
            JobKind::ModuleUpgrade => "module_upgrade",
            JobKind::FileTransfer => "file_transfer",
        }
    }

    pub fn is_upgrade(&self) -> bool {
        !matches!(self, JobKind::FileTransfer)
    }

    /// Whether a read-only pre-check runs before the mutating stage
    pub fn has_precheck(&self) -> bool {
        matches!(self, JobKind::FirmwareUpgrade)
    }

    /// Whether a checksum verification runs after the mutating stage
    pub fn has_verify(&self) -> bool {
        matches!(self, JobKind::FileTransfer)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "software" | "software_upgrade" => Ok(JobKind::SoftwareUpgrade),
            "firmware" | "firmware_upgrade" => Ok(JobKind::FirmwareUpgrade),
            "module" | "module_upgrade" => Ok(JobKind::ModuleUpgrade),
            "transfer" | "file_transfer" | "upload" => Ok(JobKind::FileTransfer),
            _ => Err(format!("Invalid job kind: {}", s)),
        }
    }
}

/// How the transport authenticates against the device
#[derive(Debug, Default)]
pub enum AuthMode {
    /// Public key from the operator's ~/.ssh
    #[default]
    Key,
    /// Password handed to the transport only
    Password(SecretString),
}

impl AuthMode {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMode::Key => "key",
            AuthMode::Password(_) => "password",
        }
    }
}

/// The device a job talks to. Immutable for the duration of a job.
#[derive(Debug)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMode,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>, auth: AuthMode) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth,
        }
    }

    /// `user@host` form used by ssh and scp
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    /// Check that the target carries everything needed to connect
    pub fn validate(&self) -> Result<(), UpgradeError> {
        if self.host.trim().is_empty() {
            return Err(UpgradeError::ValidationError("Device host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(UpgradeError::ValidationError("Device port is 0".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(UpgradeError::ValidationError("Username is empty".to_string()));
        }
        if self.host.chars().any(char::is_whitespace) || self.username.chars().any(char::is_whitespace) {
            return Err(UpgradeError::ValidationError(
                "Host and username must not contain whitespace".to_string(),
            ));
        }
        Ok(())
    }
}

/// A single classified output line, kept for the final report
#[derive(Debug, Clone)]
pub struct ClassifiedEvent {
    pub at: DateTime<Utc>,
    pub phase: JobPhase,
    pub line: String,
    pub classification: Classification,
}

/// An operator-initiated upgrade or transfer
#[derive(Debug, Clone)]
pub struct UpgradeJob {
    pub id: JobId,
    pub kind: JobKind,

    /// Local file for transfers
    pub source_path: Option<PathBuf>,

    /// Package or upload location on the device
    pub remote_path: String,

    pub started_at: DateTime<Utc>,

    /// Budget shared by every process-running phase of the job
    pub timeout_budget: Duration,

    pub last_exit_code: Option<i32>,

    pub classified_events: Vec<ClassifiedEvent>,

    /// Local content hash, transfers only
    pub local_checksum: Option<String>,

    /// Hash reported by the device, transfers only
    pub remote_checksum: Option<String>,
}

impl UpgradeJob {
    pub fn new(id: JobId, kind: JobKind, remote_path: String, timeout_budget: Duration) -> Self {
        Self {
            id,
            kind,
            source_path: None,
            remote_path,
            started_at: Utc::now(),
            timeout_budget,
            last_exit_code: None,
            classified_events: Vec::new(),
            local_checksum: None,
            remote_checksum: None,
        }
    }
}
