//! On-disk layout of the workstation state

use std::path::PathBuf;

use crate::errors::UpgradeError;
use crate::filesys::file::File;
use crate::logs::DIAGNOSTICS_FILE;

/// Environment variable overriding the base directory
pub const HOME_ENV: &str = "FWCTL_HOME";

/// Where settings, the license key and logs live
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// `settings.json`
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// License key issued for this workstation's machine code
    pub fn license_file(&self) -> File {
        File::new(self.base_dir.join("machine_auth.key"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Append-only record of every remote process
    pub fn diagnostics_log(&self) -> PathBuf {
        self.logs_dir().join(DIAGNOSTICS_FILE)
    }

    /// Create the base and log directories
    pub async fn setup(&self) -> Result<(), UpgradeError> {
        tokio::fs::create_dir_all(self.logs_dir()).await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    /// `$FWCTL_HOME`, else `~/.fwctl`
    fn default() -> Self {
        let base_dir = std::env::var_os(HOME_ENV)
            .map(PathBuf::from)
            .or_else(|| home_dir().map(|home| home.join(".fwctl")))
            .unwrap_or_else(|| PathBuf::from(".fwctl"));
        Self::new(base_dir)
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
