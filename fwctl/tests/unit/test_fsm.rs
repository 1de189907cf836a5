//! FSM unit tests

use fwctl::errors::ErrorCategory;
use fwctl::models::job::JobKind;
use fwctl::upgrade::classifier::{lookup, Classification};
use fwctl::upgrade::fsm::{Directive, JobPhase, KillReason, TerminatedBy, UpgradeEvent, UpgradeFsm};

fn exited(code: i32) -> UpgradeEvent {
    UpgradeEvent::Exited {
        code: Some(code),
        terminated_by: TerminatedBy::Natural,
    }
}

fn killed(reason: KillReason) -> UpgradeEvent {
    UpgradeEvent::Exited {
        code: None,
        terminated_by: TerminatedBy::Killed(reason),
    }
}

fn output(kind: JobKind, line: &str) -> UpgradeEvent {
    let signature = lookup(kind, line).expect("line should match a signature");
    if signature.is_fatal() {
        UpgradeEvent::Output(Classification::Fatal(signature))
    } else {
        UpgradeEvent::Output(Classification::Diagnostic(signature))
    }
}

fn started(kind: JobKind) -> UpgradeFsm {
    let mut fsm = UpgradeFsm::new(kind);
    fsm.process(UpgradeEvent::Begin).unwrap();
    fsm.process(UpgradeEvent::Validated).unwrap();
    fsm
}

#[test]
fn test_fsm_initial_state() {
    let fsm = UpgradeFsm::new(JobKind::FirmwareUpgrade);
    assert_eq!(fsm.phase(), JobPhase::Idle);
    assert_eq!(fsm.kind(), JobKind::FirmwareUpgrade);
    assert_eq!(fsm.previous_exit_code(), None);
    assert!(!fsm.cancel_requested());
}

#[test]
fn test_fsm_validation_routes_by_kind() {
    assert_eq!(started(JobKind::FirmwareUpgrade).phase(), JobPhase::PreChecking);
    assert_eq!(started(JobKind::SoftwareUpgrade).phase(), JobPhase::Executing);
    assert_eq!(started(JobKind::ModuleUpgrade).phase(), JobPhase::Executing);
    assert_eq!(started(JobKind::FileTransfer).phase(), JobPhase::Executing);
}

#[test]
fn test_fsm_rejected_validation() {
    let mut fsm = UpgradeFsm::new(JobKind::FileTransfer);
    fsm.process(UpgradeEvent::Begin).unwrap();
    fsm.process(UpgradeEvent::Rejected(ErrorCategory::Validation))
        .unwrap();
    assert_eq!(fsm.phase(), JobPhase::Failed(ErrorCategory::Validation));
    assert_eq!(fsm.previous_exit_code(), None);
}

#[test]
fn test_fsm_executing_follows_successful_precheck() {
    let mut fsm = started(JobKind::FirmwareUpgrade);
    fsm.process(exited(0)).unwrap();

    assert_eq!(fsm.phase(), JobPhase::Executing);
    assert_eq!(fsm.previous_exit_code(), Some(0));
}

#[test]
fn test_fsm_precheck_failure_skips_execute() {
    let mut fsm = started(JobKind::FirmwareUpgrade);
    fsm.process(output(JobKind::FirmwareUpgrade, "ERROR: Firmware file not found"))
        .unwrap();
    fsm.process(exited(1)).unwrap();

    assert_eq!(fsm.phase(), JobPhase::Failed(ErrorCategory::Precondition));
    assert!(!fsm.history().contains(&JobPhase::Executing));
    assert_eq!(
        fsm.failure_signature().map(|signature| signature.pattern),
        Some("Firmware file not found")
    );
}

#[test]
fn test_fsm_precheck_failure_without_diagnostic() {
    let mut fsm = started(JobKind::FirmwareUpgrade);
    fsm.process(exited(2)).unwrap();
    assert_eq!(fsm.phase(), JobPhase::Failed(ErrorCategory::Precondition));
}

#[test]
fn test_fsm_fatal_output_wins_over_exit_code() {
    let mut fsm = started(JobKind::SoftwareUpgrade);

    let directive = fsm
        .process(output(JobKind::SoftwareUpgrade, "tar: write error: Input/output error"))
        .unwrap();
    assert_eq!(directive, Directive::Kill(KillReason::FatalOutput));
    assert_eq!(fsm.phase(), JobPhase::Executing);

    // the supervisor may only report the exit after the kill deadline
    fsm.process(killed(KillReason::Timeout)).unwrap();
    assert_eq!(fsm.phase(), JobPhase::Failed(ErrorCategory::HardwareFault));
}

#[test]
fn test_fsm_diagnostic_does_not_kill() {
    let mut fsm = started(JobKind::SoftwareUpgrade);
    let directive = fsm
        .process(output(JobKind::SoftwareUpgrade, "tar: Unexpected EOF in archive"))
        .unwrap();
    assert_eq!(directive, Directive::None);

    // a clean exit after a diagnostic is still a success
    fsm.process(exited(0)).unwrap();
    assert_eq!(fsm.phase(), JobPhase::Done);
}

#[test]
fn test_fsm_nonzero_exit_uses_first_diagnostic() {
    let mut fsm = started(JobKind::ModuleUpgrade);
    fsm.process(output(JobKind::ModuleUpgrade, "mount: /mnt/x: wrong fs type"))
        .unwrap();
    fsm.process(output(JobKind::ModuleUpgrade, "tar: Error is not recoverable"))
        .unwrap();
    fsm.process(exited(1)).unwrap();
    assert_eq!(fsm.phase(), JobPhase::Failed(ErrorCategory::Mount));
}

#[test]
fn test_fsm_nonzero_exit_defaults() {
    let mut upgrade = started(JobKind::SoftwareUpgrade);
    upgrade.process(exited(1)).unwrap();
    assert_eq!(upgrade.phase(), JobPhase::Failed(ErrorCategory::RemoteCommand));

    let mut transfer = started(JobKind::FileTransfer);
    transfer.process(exited(1)).unwrap();
    assert_eq!(transfer.phase(), JobPhase::Failed(ErrorCategory::Transfer));
}

#[test]
fn test_fsm_timeout() {
    let mut fsm = started(JobKind::FirmwareUpgrade);
    fsm.process(exited(0)).unwrap();
    fsm.process(killed(KillReason::Timeout)).unwrap();
    assert_eq!(fsm.phase(), JobPhase::TimedOut);
}

#[test]
fn test_fsm_cancel_mid_execute() {
    let mut fsm = started(JobKind::SoftwareUpgrade);

    let directive = fsm.process(UpgradeEvent::CancelRequested).unwrap();
    assert_eq!(directive, Directive::Kill(KillReason::UserCancel));
    // still executing until the termination is observed
    assert_eq!(fsm.phase(), JobPhase::Executing);

    // a second request does not kill twice
    assert_eq!(
        fsm.process(UpgradeEvent::CancelRequested).unwrap(),
        Directive::None
    );

    fsm.process(killed(KillReason::UserCancel)).unwrap();
    assert_eq!(fsm.phase(), JobPhase::Cancelled);
}

#[test]
fn test_fsm_cancel_beats_fatal_and_exit_code() {
    let mut fsm = started(JobKind::SoftwareUpgrade);
    fsm.process(UpgradeEvent::CancelRequested).unwrap();
    fsm.process(output(JobKind::SoftwareUpgrade, "Input/output error"))
        .unwrap();
    fsm.process(exited(0)).unwrap();
    assert_eq!(fsm.phase(), JobPhase::Cancelled);
}

#[test]
fn test_fsm_cancel_without_process() {
    let mut fsm = started(JobKind::FirmwareUpgrade);
    fsm.process(UpgradeEvent::CancelRequested).unwrap();
    fsm.process(UpgradeEvent::CancelConfirmed).unwrap();
    assert_eq!(fsm.phase(), JobPhase::Cancelled);
}

#[test]
fn test_fsm_launch_failure() {
    let mut fsm = started(JobKind::FileTransfer);
    fsm.process(UpgradeEvent::LaunchFailed(ErrorCategory::Connection))
        .unwrap();
    assert_eq!(fsm.phase(), JobPhase::Failed(ErrorCategory::Connection));
}

#[test]
fn test_fsm_transfer_verify_match() {
    let mut fsm = started(JobKind::FileTransfer);
    fsm.process(exited(0)).unwrap();
    assert_eq!(fsm.phase(), JobPhase::Verifying);

    fsm.process(exited(0)).unwrap();
    assert!(fsm.awaiting_checksum());
    assert_eq!(fsm.phase(), JobPhase::Verifying);

    fsm.process(UpgradeEvent::ChecksumVerified { matched: true })
        .unwrap();
    assert_eq!(fsm.phase(), JobPhase::Done);
}

#[test]
fn test_fsm_transfer_verify_mismatch() {
    let mut fsm = started(JobKind::FileTransfer);
    fsm.process(exited(0)).unwrap();
    fsm.process(exited(0)).unwrap();
    fsm.process(UpgradeEvent::ChecksumVerified { matched: false })
        .unwrap();
    assert_eq!(fsm.phase(), JobPhase::Failed(ErrorCategory::IntegrityMismatch));
}

#[test]
fn test_fsm_checksum_requires_finished_verify() {
    let mut fsm = started(JobKind::FileTransfer);
    fsm.process(exited(0)).unwrap();

    let result = fsm.process(UpgradeEvent::ChecksumVerified { matched: true });
    assert!(result.is_err());
    assert_eq!(fsm.phase(), JobPhase::Verifying);
}

#[test]
fn test_fsm_verify_command_failure() {
    let mut fsm = started(JobKind::FileTransfer);
    fsm.process(exited(0)).unwrap();
    fsm.process(exited(1)).unwrap();
    assert_eq!(fsm.phase(), JobPhase::Failed(ErrorCategory::IntegrityMismatch));
}

#[test]
fn test_fsm_phases_never_revisited() {
    let mut fsm = started(JobKind::FirmwareUpgrade);
    fsm.process(exited(0)).unwrap();
    fsm.process(exited(0)).unwrap();

    let history = fsm.history();
    for (index, phase) in history.iter().enumerate() {
        assert!(!history[index + 1..].contains(phase), "{} revisited", phase);
    }
}
