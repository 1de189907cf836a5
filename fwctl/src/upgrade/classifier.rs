//! Output classification
//!
//! Every line a remote process prints goes through [`OutputClassifier::classify`]. Error
//! recognition is a first-match scan over the static [`SIGNATURES`] table; progress recognition
//! is delegated to the [`ProgressMatcher`]s registered for the job kind.

use regex::Regex;

use crate::errors::{ErrorCategory, UpgradeError};
use crate::models::job::JobKind;

/// How a recognised signature affects the running process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Terminate the process immediately
    Fatal,
    /// Recorded and used to diagnose a non-zero exit
    Error,
    /// Tolerated, reported as informational output
    Warning,
}

/// Job kinds a signature applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScope {
    Any,
    Upgrade,
    Transfer,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ErrorSignature {
    pub pattern: &'static str,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub scope: SignatureScope,
    /// Replaces the category remediation when present
    pub remediation: Option<&'static str>,
}

impl ErrorSignature {
    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    pub fn applies_to(&self, kind: JobKind) -> bool {
        match self.scope {
            SignatureScope::Any => true,
            SignatureScope::Upgrade => kind.is_upgrade(),
            SignatureScope::Transfer => !kind.is_upgrade(),
        }
    }

    pub fn matches(&self, line: &str) -> bool {
        line.contains(self.pattern)
    }

    pub fn remediation(&self) -> &'static str {
        self.remediation.unwrap_or_else(|| self.category.remediation())
    }
}

const fn sig(
    pattern: &'static str,
    category: ErrorCategory,
    severity: Severity,
    scope: SignatureScope,
    remediation: Option<&'static str>,
) -> ErrorSignature {
    ErrorSignature {
        pattern,
        category,
        severity,
        scope,
        remediation,
    }
}

const AUTH_REMEDIATION: &str = "The device rejected the SSH credentials.\n\
     1. Make sure the public key is in ~/.ssh/authorized_keys on {host}\n\
     2. Check that ~/.ssh is 700 and authorized_keys is 600 on the device\n\
     3. Or switch to password authentication";

const UNREACHABLE_REMEDIATION: &str = "The device could not be reached.\n\
     1. Check the network cable and that {host} answers ping\n\
     2. Check the configured address and port\n\
     3. Check that the SSH service is running on the device";

const BUSY_REMEDIATION: &str = "The target partition is in use.\n\
     1. Stop any program that uses the partition on the device\n\
     2. Unmount it manually\n\
     3. Reboot the device and retry";

const FIRMWARE_MISSING_REMEDIATION: &str = "The firmware archive is not on the device.\n\
     1. Upload the firmware archive to {source}\n\
     2. Check the file name (case sensitive)\n\
     3. Run the firmware upgrade again";

const TOOL_MISSING_REMEDIATION: &str = "The module package does not contain the upgrade tool.\n\
     1. Check that the package ships the upgrade tool next to its payload\n\
     2. Rebuild the package and upload it again to {source}\n\
     3. Run the module upgrade again";

const PAYLOAD_MISSING_REMEDIATION: &str = "The module package does not contain the binary payload.\n\
     1. Check that the package ships the payload file\n\
     2. Rebuild the package and upload it again to {source}";

const NO_SPACE_REMEDIATION: &str = "The device ran out of space.\n\
     1. Free space on the target partition\n\
     2. Remove old packages from {source}\n\
     3. Retry";

use ErrorCategory as C;
use Severity::{Error as E, Fatal as F, Warning as W};
use SignatureScope::{Any, Transfer, Upgrade};

/// Recognised output, in match order
pub static SIGNATURES: &[ErrorSignature] = &[
    // ssh/scp could not reach or authenticate; must precede the bare "Permission denied"
    sig("Permission denied (publickey", C::Connection, E, Any, Some(AUTH_REMEDIATION)),
    sig("Permission denied, please try again", C::Connection, E, Any, Some(AUTH_REMEDIATION)),
    sig("Host key verification failed", C::Connection, E, Any, Some(AUTH_REMEDIATION)),
    sig("Connection refused", C::Connection, E, Any, Some(UNREACHABLE_REMEDIATION)),
    sig("No route to host", C::Connection, E, Any, Some(UNREACHABLE_REMEDIATION)),
    sig("Connection timed out", C::Connection, E, Any, Some(UNREACHABLE_REMEDIATION)),
    sig("Could not resolve hostname", C::Connection, E, Any, Some(UNREACHABLE_REMEDIATION)),
    // tar metadata warnings on FAT partitions
    sig("Cannot change ownership", C::Extraction, W, Upgrade, None),
    sig("Cannot change mode", C::Extraction, W, Upgrade, None),
    // hardware and filesystem faults
    sig("Input/output error", C::HardwareFault, F, Upgrade, None),
    sig("I/O error", C::HardwareFault, F, Upgrade, None),
    sig("Read-only file system", C::HardwareFault, F, Upgrade, None),
    sig("No such device", C::HardwareFault, F, Upgrade, None),
    sig("Device or resource busy", C::Mount, F, Upgrade, Some(BUSY_REMEDIATION)),
    sig("Operation not permitted", C::Extraction, F, Upgrade, None),
    sig("Permission denied", C::Extraction, F, Upgrade, None),
    // missing remote inputs
    sig("Firmware file not found", C::Precondition, E, Upgrade, Some(FIRMWARE_MISSING_REMEDIATION)),
    sig("ERROR: upgrade tool", C::Precondition, E, Upgrade, Some(TOOL_MISSING_REMEDIATION)),
    sig("ERROR: payload", C::Precondition, E, Upgrade, Some(PAYLOAD_MISSING_REMEDIATION)),
    sig("ERROR: device", C::Precondition, E, Upgrade, None),
    sig("not found in", C::Precondition, E, Upgrade, None),
    // mount and extraction failures
    sig("mount:", C::Mount, E, Upgrade, None),
    sig("No space left on device", C::Extraction, E, Any, Some(NO_SPACE_REMEDIATION)),
    sig("tar:", C::Extraction, E, Upgrade, None),
    sig("gzip:", C::Extraction, E, Upgrade, None),
    // copy failures
    sig("No such file or directory", C::Transfer, E, Transfer, None),
    sig("Permission denied", C::Transfer, E, Transfer, None),
    sig("lost connection", C::Transfer, E, Transfer, None),
];

/// First signature matching `line` for the given job kind
pub fn lookup(kind: JobKind, line: &str) -> Option<&'static ErrorSignature> {
    SIGNATURES
        .iter()
        .find(|signature| signature.applies_to(kind) && signature.matches(line))
}

/// Result of classifying one output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    None,
    Progress { percent: u8, label: String },
    Fatal(&'static ErrorSignature),
    Diagnostic(&'static ErrorSignature),
    /// Tolerated warning
    Informational(&'static ErrorSignature),
}

impl Classification {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Classification::Fatal(_))
    }
}

/// A progress grammar
pub trait ProgressMatcher: Send + Sync {
    /// Percentage and label found in `line`, if any
    fn extract(&self, line: &str) -> Option<(u8, String)>;
}

/// `label: current/total (percent%)`, as printed by flash tools
pub struct RatioProgressMatcher {
    pattern: Regex,
}

impl RatioProgressMatcher {
    pub fn new() -> Result<Self, UpgradeError> {
        let pattern = Regex::new(r"([A-Za-z][A-Za-z0-9 _-]*):\s*(\d+)/(\d+)\s*\((\d{1,3})%\)")
            .map_err(|e| UpgradeError::Internal(format!("invalid progress pattern: {e}")))?;
        Ok(Self { pattern })
    }
}

impl ProgressMatcher for RatioProgressMatcher {
    fn extract(&self, line: &str) -> Option<(u8, String)> {
        let captures = self.pattern.captures(line)?;
        let percent: u32 = captures.get(4)?.as_str().parse().ok()?;
        let label = captures.get(1)?.as_str().trim().to_string();
        Some((percent.min(100) as u8, label))
    }
}

/// `Step N/M: label`, as echoed by the rendered pipelines
pub struct StepProgressMatcher {
    pattern: Regex,
}

impl StepProgressMatcher {
    pub fn new() -> Result<Self, UpgradeError> {
        let pattern = Regex::new(r"^Step (\d+)/(\d+):\s*(.*)$")
            .map_err(|e| UpgradeError::Internal(format!("invalid step pattern: {e}")))?;
        Ok(Self { pattern })
    }
}

impl ProgressMatcher for StepProgressMatcher {
    fn extract(&self, line: &str) -> Option<(u8, String)> {
        let captures = self.pattern.captures(line.trim())?;
        let current: u64 = captures.get(1)?.as_str().parse().ok()?;
        let total: u64 = captures.get(2)?.as_str().parse().ok()?;
        if total == 0 || current > total {
            return None;
        }
        let label = captures.get(3)?.as_str().to_string();
        // current <= total, so this is at most 100
        let percent = u8::try_from(u128::from(current) * 100 / u128::from(total)).ok()?;
        Some((percent, label))
    }
}

/// Stateful per-job classifier
pub struct OutputClassifier {
    kind: JobKind,
    matchers: Vec<Box<dyn ProgressMatcher>>,
    last_bucket: Vec<Option<u8>>,
}

impl OutputClassifier {
    pub fn new(kind: JobKind, matchers: Vec<Box<dyn ProgressMatcher>>) -> Self {
        let last_bucket = vec![None; matchers.len()];
        Self {
            kind,
            matchers,
            last_bucket,
        }
    }

    /// Classifier with the progress grammars registered for `kind`
    pub fn for_kind(kind: JobKind) -> Result<Self, UpgradeError> {
        let mut matchers: Vec<Box<dyn ProgressMatcher>> = Vec::new();
        if kind == JobKind::ModuleUpgrade {
            matchers.push(Box::new(RatioProgressMatcher::new()?));
        }
        if kind.is_upgrade() {
            matchers.push(Box::new(StepProgressMatcher::new()?));
        }
        Ok(Self::new(kind, matchers))
    }

    /// Forget reported progress, called when a new phase starts
    pub fn reset(&mut self) {
        self.last_bucket.iter_mut().for_each(|bucket| *bucket = None);
    }

    pub fn classify(&mut self, line: &str) -> Classification {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return Classification::None;
        }

        if let Some(signature) = lookup(self.kind, line) {
            return match signature.severity {
                Severity::Fatal => Classification::Fatal(signature),
                Severity::Error => Classification::Diagnostic(signature),
                Severity::Warning => Classification::Informational(signature),
            };
        }

        for (index, matcher) in self.matchers.iter().enumerate() {
            if let Some((percent, label)) = matcher.extract(line) {
                // surfaced at 10% granularity per grammar
                let bucket = percent / 10 * 10;
                let last = &mut self.last_bucket[index];
                if last.is_some_and(|previous| bucket <= previous) {
                    return Classification::None;
                }
                *last = Some(bucket);
                return Classification::Progress { percent, label };
            }
        }

        Classification::None
    }
}
