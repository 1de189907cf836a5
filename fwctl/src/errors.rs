//! Error types for fwctl

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the orchestration engine
#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Another job is already active: {0}")]
    Busy(String),

    #[error("Failed to start remote process: {0}")]
    SpawnError(String),

    #[error("Process supervisor error: {0}")]
    SupervisorError(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for UpgradeError {
    fn from(err: anyhow::Error) -> Self {
        UpgradeError::Internal(err.to_string())
    }
}

impl UpgradeError {
    /// Category reported to the operator for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            UpgradeError::ValidationError(_) => ErrorCategory::Validation,
            UpgradeError::Busy(_) => ErrorCategory::Busy,
            UpgradeError::SpawnError(_) => ErrorCategory::Connection,
            _ => ErrorCategory::RemoteCommand,
        }
    }
}

/// Failure taxonomy surfaced with every terminal job failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Missing connection info or local file; no process was spawned
    Validation,
    /// Remote file or device absent
    Precondition,
    /// Copy to the device failed
    Transfer,
    /// Checksum mismatch after a successful copy
    IntegrityMismatch,
    /// Device busy or mount failure
    Mount,
    /// Archive corrupt or extraction permission problem
    Extraction,
    /// I/O error, read-only filesystem, device vanished
    HardwareFault,
    Timeout,
    UserCancel,
    Busy,
    /// ssh/scp could not reach or authenticate against the device
    Connection,
    /// Non-zero exit without a recognised diagnostic
    RemoteCommand,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation_error",
            ErrorCategory::Precondition => "precondition_error",
            ErrorCategory::Transfer => "transfer_error",
            ErrorCategory::IntegrityMismatch => "integrity_mismatch",
            ErrorCategory::Mount => "mount_error",
            ErrorCategory::Extraction => "extraction_error",
            ErrorCategory::HardwareFault => "hardware_fault",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::UserCancel => "user_cancel",
            ErrorCategory::Busy => "busy",
            ErrorCategory::Connection => "connection_error",
            ErrorCategory::RemoteCommand => "remote_command_error",
        }
    }

    /// Generic remediation used when no signature-specific text applies.
    ///
    /// `{source}` and `{host}` are substituted by the report builder.
    pub fn remediation(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => {
                "Connection settings or the local file are incomplete.\n\
                 1. Fill in host, port and username\n\
                 2. Select an existing local file before transferring"
            }
            ErrorCategory::Precondition => {
                "A required file or device is missing on the device.\n\
                 1. Upload the package to {source} first\n\
                 2. Check the file name (case sensitive) and that it is complete\n\
                 3. Run the upgrade again"
            }
            ErrorCategory::Transfer => {
                "The file could not be copied to the device.\n\
                 1. Check that the remote directory exists and is writable\n\
                 2. Check free space on the device\n\
                 3. Retry the transfer"
            }
            ErrorCategory::IntegrityMismatch => {
                "The uploaded file does not match the local file.\n\
                 1. Upload the file again\n\
                 2. Do not start an upgrade from this copy"
            }
            ErrorCategory::Mount => {
                "The target partition could not be mounted.\n\
                 1. Check whether another program or upgrade is using the partition\n\
                 2. Unmount it manually on the device\n\
                 3. Reboot the device and retry"
            }
            ErrorCategory::Extraction => {
                "The package could not be extracted.\n\
                 1. Check that {source} is a valid, complete tar.gz archive\n\
                 2. Check free space on the target partition\n\
                 3. Rebuild or download the package again"
            }
            ErrorCategory::HardwareFault => {
                "A hardware I/O fault was detected and the upgrade was stopped immediately.\n\
                 Do NOT retry before the hardware has been inspected.\n\
                 1. Check the device power supply\n\
                 2. Check the storage device and its connection\n\
                 3. Contact technical support for a hardware check"
            }
            ErrorCategory::Timeout => {
                "The operation exceeded its time budget and was stopped.\n\
                 1. Check the network connection to {host}\n\
                 2. Check whether the device is responsive\n\
                 3. Reboot the device before trying again"
            }
            ErrorCategory::UserCancel => {
                "The operation was cancelled by the operator.\n\
                 1. Inspect the device state before starting another upgrade"
            }
            ErrorCategory::Busy => {
                "Another upgrade or transfer is still running.\n\
                 1. Wait for it to finish or cancel it first"
            }
            ErrorCategory::Connection => {
                "The device could not be reached or refused authentication.\n\
                 1. Check the address and port of {host}\n\
                 2. Check that the SSH service is running and not firewalled\n\
                 3. Make sure the public key is installed in ~/.ssh/authorized_keys (chmod 600)"
            }
            ErrorCategory::RemoteCommand => {
                "The remote command failed.\n\
                 1. Check the connection to {host}\n\
                 2. Check that {source} exists and the target directory is writable\n\
                 3. Review the diagnostic log for the full output"
            }
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
