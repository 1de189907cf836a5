//! Transfer integrity checks

use std::path::Path;

use crate::errors::UpgradeError;
use crate::filesys::file::File;

/// Local content hash of `path`, lowercase hex
pub async fn local_checksum(path: &Path) -> Result<String, UpgradeError> {
    File::new(path).sha256().await
}

/// Hash from `sha256sum` output: first token of the first non-empty line
pub fn parse_checksum_output(output: &str) -> Option<String> {
    let line = output.lines().find(|line| !line.trim().is_empty())?;
    let token = line.split_whitespace().next()?;
    if token.is_empty() || !token.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(token.to_ascii_lowercase())
}

/// Case-insensitive hex comparison
pub fn checksums_match(local: &str, remote: &str) -> bool {
    !local.is_empty() && local.trim().eq_ignore_ascii_case(remote.trim())
}
