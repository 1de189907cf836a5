//! Finite State Machine for upgrade jobs

use serde::{Deserialize, Serialize};

use crate::errors::ErrorCategory;
use crate::models::job::JobKind;
use crate::upgrade::classifier::{Classification, ErrorSignature};

/// Job phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "category")]
pub enum JobPhase {
    /// Created, guard held, nothing checked yet
    Idle,

    /// Local checks before any remote call
    Validating,

    /// Read-only remote checks
    PreChecking,

    /// Mutating remote stage
    Executing,

    /// Remote checksum of an uploaded file
    Verifying,

    Done,
    Failed(ErrorCategory),
    TimedOut,
    Cancelled,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobPhase::Done | JobPhase::Failed(_) | JobPhase::TimedOut | JobPhase::Cancelled
        )
    }

    /// Whether a remote process runs in this phase
    pub fn runs_process(&self) -> bool {
        matches!(
            self,
            JobPhase::PreChecking | JobPhase::Executing | JobPhase::Verifying
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Idle => "idle",
            JobPhase::Validating => "validating",
            JobPhase::PreChecking => "pre_checking",
            JobPhase::Executing => "executing",
            JobPhase::Verifying => "verifying",
            JobPhase::Done => "done",
            JobPhase::Failed(_) => "failed",
            JobPhase::TimedOut => "timed_out",
            JobPhase::Cancelled => "cancelled",
        }
    }

    /// Category reported for a terminal phase
    pub fn failure_category(&self) -> Option<ErrorCategory> {
        match self {
            JobPhase::Failed(category) => Some(*category),
            JobPhase::TimedOut => Some(ErrorCategory::Timeout),
            JobPhase::Cancelled => Some(ErrorCategory::UserCancel),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Failed(category) => write!(f, "failed({})", category),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Why the supervisor terminated a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    Timeout,
    UserCancel,
    FatalOutput,
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminatedBy {
    Natural,
    Killed(KillReason),
}

/// Upgrade event
#[derive(Debug, Clone)]
pub enum UpgradeEvent {
    /// Guard acquired, start validating
    Begin,

    /// Local checks passed
    Validated,

    /// Local checks failed
    Rejected(ErrorCategory),

    /// Classified output line of the running process
    Output(Classification),

    /// The process could not be started
    LaunchFailed(ErrorCategory),

    /// The running process ended
    Exited {
        code: Option<i32>,
        terminated_by: TerminatedBy,
    },

    /// Operator asked to cancel
    CancelRequested,

    /// Cancellation took effect without a live process
    CancelConfirmed,

    /// Remote checksum compared against the local one
    ChecksumVerified { matched: bool },
}

/// What the driver must do after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    None,
    Kill(KillReason),
}

/// Upgrade FSM
#[derive(Debug, Clone)]
pub struct UpgradeFsm {
    kind: JobKind,
    phase: JobPhase,
    history: Vec<JobPhase>,
    previous_exit_code: Option<i32>,

    // reset when a process phase starts
    fatal: Option<&'static ErrorSignature>,
    first_diagnostic: Option<&'static ErrorSignature>,
    kill_issued: bool,
    awaiting_checksum: bool,

    cancel_requested: bool,
}

impl UpgradeFsm {
    /// Create a new FSM in idle state
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            phase: JobPhase::Idle,
            history: vec![JobPhase::Idle],
            previous_exit_code: None,
            fatal: None,
            first_diagnostic: None,
            kill_issued: false,
            awaiting_checksum: false,
            cancel_requested: false,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Get current phase
    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    /// Every phase entered so far, in order
    pub fn history(&self) -> &[JobPhase] {
        &self.history
    }

    /// Exit code of the last process that ran
    pub fn previous_exit_code(&self) -> Option<i32> {
        self.previous_exit_code
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Whether the current phase already exited and waits for a checksum comparison
    pub fn awaiting_checksum(&self) -> bool {
        self.awaiting_checksum
    }

    /// Signature that explains the terminal failure, if one was seen
    pub fn failure_signature(&self) -> Option<&'static ErrorSignature> {
        match self.phase {
            JobPhase::Failed(category) => self
                .fatal
                .or(self.first_diagnostic)
                .filter(|signature| signature.category == category),
            _ => None,
        }
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: UpgradeEvent) -> Result<Directive, String> {
        if self.phase.is_terminal() {
            return Err(format!(
                "Job already finished in phase {}, ignoring {:?}",
                self.phase, event
            ));
        }

        let mut directive = Directive::None;
        let next = match (self.phase, event) {
            (JobPhase::Idle, UpgradeEvent::Begin) => JobPhase::Validating,

            (JobPhase::Validating, UpgradeEvent::Validated) => {
                if self.kind.has_precheck() {
                    JobPhase::PreChecking
                } else {
                    JobPhase::Executing
                }
            }
            (JobPhase::Validating, UpgradeEvent::Rejected(category)) => JobPhase::Failed(category),
            (JobPhase::Validating, UpgradeEvent::CancelConfirmed) => JobPhase::Cancelled,

            (phase, UpgradeEvent::Output(classification))
                if phase.runs_process() && !self.awaiting_checksum =>
            {
                match classification {
                    Classification::Fatal(signature) => {
                        if self.fatal.is_none() {
                            self.fatal = Some(signature);
                        }
                        if !self.kill_issued {
                            self.kill_issued = true;
                            directive = Directive::Kill(KillReason::FatalOutput);
                        }
                    }
                    Classification::Diagnostic(signature) => {
                        if self.first_diagnostic.is_none() {
                            self.first_diagnostic = Some(signature);
                        }
                    }
                    _ => {}
                }
                phase
            }

            (phase, UpgradeEvent::CancelRequested) if phase.runs_process() => {
                self.cancel_requested = true;
                if !self.kill_issued && !self.awaiting_checksum {
                    self.kill_issued = true;
                    directive = Directive::Kill(KillReason::UserCancel);
                }
                phase
            }

            (phase, UpgradeEvent::CancelConfirmed) if phase.runs_process() => JobPhase::Cancelled,

            (phase, UpgradeEvent::LaunchFailed(category)) if phase.runs_process() => {
                if self.cancel_requested {
                    JobPhase::Cancelled
                } else {
                    JobPhase::Failed(category)
                }
            }

            (
                phase,
                UpgradeEvent::Exited {
                    code,
                    terminated_by,
                },
            ) if phase.runs_process() && !self.awaiting_checksum => {
                self.previous_exit_code = code;
                self.resolve_exit(phase, code, terminated_by)
            }

            (JobPhase::Verifying, UpgradeEvent::ChecksumVerified { matched })
                if self.awaiting_checksum =>
            {
                if self.cancel_requested {
                    JobPhase::Cancelled
                } else if matched {
                    JobPhase::Done
                } else {
                    JobPhase::Failed(ErrorCategory::IntegrityMismatch)
                }
            }

            (phase, event) => {
                return Err(format!(
                    "Invalid event {:?} in phase {}",
                    event, phase
                ));
            }
        };

        if next != self.phase {
            self.enter(next);
        }
        Ok(directive)
    }

    fn resolve_exit(&mut self, phase: JobPhase, code: Option<i32>, terminated_by: TerminatedBy) -> JobPhase {
        if self.cancel_requested || terminated_by == TerminatedBy::Killed(KillReason::UserCancel) {
            return JobPhase::Cancelled;
        }
        if let Some(signature) = self.fatal {
            return JobPhase::Failed(signature.category);
        }
        if terminated_by == TerminatedBy::Killed(KillReason::Timeout) {
            return JobPhase::TimedOut;
        }
        if code == Some(0) {
            return match phase {
                JobPhase::PreChecking => JobPhase::Executing,
                JobPhase::Executing if self.kind.has_verify() => JobPhase::Verifying,
                JobPhase::Executing => JobPhase::Done,
                _ => {
                    self.awaiting_checksum = true;
                    phase
                }
            };
        }

        let category = self
            .first_diagnostic
            .map(|signature| signature.category)
            .unwrap_or_else(|| self.default_failure(phase));
        JobPhase::Failed(category)
    }

    fn default_failure(&self, phase: JobPhase) -> ErrorCategory {
        match phase {
            JobPhase::PreChecking => ErrorCategory::Precondition,
            JobPhase::Executing if self.kind.has_verify() => ErrorCategory::Transfer,
            JobPhase::Verifying => ErrorCategory::IntegrityMismatch,
            _ => ErrorCategory::RemoteCommand,
        }
    }

    fn enter(&mut self, phase: JobPhase) {
        if phase.runs_process() {
            self.fatal = None;
            self.first_diagnostic = None;
            self.kill_issued = false;
            self.awaiting_checksum = false;
        }
        self.phase = phase;
        self.history.push(phase);
    }
}
