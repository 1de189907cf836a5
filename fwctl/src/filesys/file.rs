//! Workstation files: settings, license key and upload payloads

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::UpgradeError;

const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Path to a file that may not exist yet
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        matches!(fs::try_exists(&self.path).await, Ok(true))
    }

    pub async fn read_string(&self) -> Result<String, UpgradeError> {
        Ok(fs::read_to_string(&self.path).await?)
    }

    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, UpgradeError> {
        let raw = fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Replace the contents through a sibling `.tmp` file so readers never see a partial write.
    /// Missing parent directories are created.
    pub async fn write_string(&self, contents: &str) -> Result<(), UpgradeError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let staging = self.path.with_extension("tmp");
        {
            let mut out = fs::File::create(&staging).await?;
            out.write_all(contents.as_bytes()).await?;
            out.sync_all().await?;
        }
        fs::rename(&staging, &self.path).await?;
        Ok(())
    }

    /// Pretty-printed JSON
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), UpgradeError> {
        self.write_string(&serde_json::to_string_pretty(value)?).await
    }

    /// SHA-256 of the contents as lowercase hex, read in 64 KiB chunks
    pub async fn sha256(&self) -> Result<String, UpgradeError> {
        let mut input = fs::File::open(&self.path).await?;
        let mut hasher = Sha256::new();
        let mut chunk = vec![0u8; HASH_CHUNK_SIZE];
        loop {
            match input.read(&mut chunk).await? {
                0 => break,
                n => hasher.update(&chunk[..n]),
            }
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}
