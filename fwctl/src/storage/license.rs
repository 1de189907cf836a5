//! License key management
//!
//! The workstation is identified by a machine code derived from its CPU architecture,
//! hostname and first hardware address. A license key file holds an encoded copy of that
//! code; the engine only starts when the decoded key equals the local code.

use sysinfo::{Networks, System};
use tracing::debug;

use crate::errors::UpgradeError;
use crate::filesys::file::File;
use crate::utils::sha256_hash;

/// Turns the stored key into the machine code it was issued for
pub trait CodeDecoder: Send + Sync {
    fn decode(&self, encoded: &str) -> Result<String, UpgradeError>;
}

/// Keys stored as the plain machine code
#[derive(Debug, Clone, Default)]
pub struct PlainDecoder;

impl CodeDecoder for PlainDecoder {
    fn decode(&self, encoded: &str) -> Result<String, UpgradeError> {
        Ok(encoded.trim().to_string())
    }
}

/// Proof that the license check passed
#[derive(Debug, Clone)]
pub struct Authorization {
    machine_code: String,
}

impl Authorization {
    pub fn machine_code(&self) -> &str {
        &self.machine_code
    }
}

/// First hardware address of a non-loopback interface, by interface name
fn primary_mac_address() -> String {
    let networks = Networks::new_with_refreshed_list();
    let mut interfaces: Vec<(&String, String)> = networks
        .list()
        .iter()
        .filter(|(_, data)| !data.mac_address().is_unspecified())
        .map(|(name, data)| (name, data.mac_address().to_string()))
        .collect();
    interfaces.sort();
    interfaces
        .into_iter()
        .map(|(_, mac)| mac.to_uppercase())
        .next()
        .unwrap_or_else(|| "00:00:00:00:00:00".to_string())
}

/// Raw identity string the machine code is derived from
pub fn machine_identity() -> String {
    let hostname = System::host_name().unwrap_or_else(|| "unknown".to_string());
    format!(
        "{}-{}-{}",
        std::env::consts::ARCH,
        hostname,
        primary_mac_address()
    )
}

/// Machine code of this workstation, uppercase hex
pub fn machine_code() -> String {
    sha256_hash(machine_identity().as_bytes()).to_uppercase()
}

/// Assert that the license key matches this workstation
pub async fn assert_authorized(
    license_file: &File,
    decoder: &dyn CodeDecoder,
) -> Result<Authorization, UpgradeError> {
    assert_authorized_for(license_file, decoder, &machine_code()).await
}

/// Assert that the license key matches `machine_code`
pub async fn assert_authorized_for(
    license_file: &File,
    decoder: &dyn CodeDecoder,
    machine_code: &str,
) -> Result<Authorization, UpgradeError> {
    if !license_file.exists().await {
        return Err(UpgradeError::Unauthorized(format!(
            "License file {} does not exist",
            license_file.path().display()
        )));
    }

    let encoded = license_file.read_string().await.map_err(|e| {
        UpgradeError::Unauthorized(format!("Failed to read license file: {}", e))
    })?;
    if encoded.trim().is_empty() {
        return Err(UpgradeError::Unauthorized("License file is empty".to_string()));
    }

    let decoded = decoder.decode(&encoded)?;
    if decoded != machine_code {
        debug!("License key does not match machine code {}", machine_code);
        return Err(UpgradeError::Unauthorized(
            "License key was issued for another machine".to_string(),
        ));
    }

    Ok(Authorization {
        machine_code: machine_code.to_string(),
    })
}
