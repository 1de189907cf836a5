//! Upgrade engine
//!
//! Entry point for upgrades, transfers, connection tests and operator commands. [`UpgradeEngine::start`] performs
//! the synchronous part of a job (guard, validation, pipeline rendering) and hands the rest to
//! one tokio task that owns the job's state machine, supervisor and guard token.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::app::options::EngineOptions;
use crate::errors::{ErrorCategory, UpgradeError};
use crate::models::job::{ClassifiedEvent, JobId, JobKind, RemoteTarget, UpgradeJob};
use crate::storage::license::Authorization;
use crate::upgrade::classifier::{self, Classification, OutputClassifier};
use crate::upgrade::diagnostics::DiagnosticSink;
use crate::upgrade::fsm::{Directive, JobPhase, TerminatedBy, UpgradeEvent, UpgradeFsm};
use crate::upgrade::guard::{ConcurrencyGuard, GuardToken};
use crate::upgrade::launcher::{OutputLine, ProcessLauncher};
use crate::upgrade::pipeline::{self, CommandStep, Stage};
use crate::upgrade::registry::{JobRegistry, JobSnapshot};
use crate::upgrade::report::{render_remediation, JobReport};
use crate::upgrade::supervisor::{ProcessSupervisor, SupervisorEvent};
use crate::upgrade::transfer;
use crate::upgrade::transport::SshTransport;

const OUTPUT_TAIL_LINES: usize = 20;
const CONNECTION_MARKER: &str = "fwctl-connection-ok";

/// An operator action to run
#[derive(Debug)]
pub struct UpgradeRequest {
    pub kind: JobKind,
    pub target: RemoteTarget,

    /// Local file, transfers only
    pub source: Option<PathBuf>,
}

impl UpgradeRequest {
    pub fn upgrade(kind: JobKind, target: RemoteTarget) -> Self {
        Self {
            kind,
            target,
            source: None,
        }
    }

    pub fn transfer(source: impl Into<PathBuf>, target: RemoteTarget) -> Self {
        Self {
            kind: JobKind::FileTransfer,
            target,
            source: Some(source.into()),
        }
    }
}

/// Progress of a running job, for an outer UI
#[derive(Debug, Clone)]
pub enum JobNotice {
    Phase(JobPhase),
    Progress { percent: u8, label: String },
    Output(OutputLine),
    Finished(JobReport),
}

/// Handle to a started job
pub struct JobHandle {
    pub id: JobId,
    cancel: Arc<watch::Sender<bool>>,
    notices: mpsc::UnboundedReceiver<JobNotice>,
    task: JoinHandle<JobReport>,
}

impl JobHandle {
    /// Request cancellation. The job ends in `Cancelled` once the process is gone.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Next notice. `None` once the job finished and all notices were read.
    pub async fn next_notice(&mut self) -> Option<JobNotice> {
        self.notices.recv().await
    }

    /// Wait for the terminal report
    pub async fn wait(self) -> Result<JobReport, UpgradeError> {
        self.task
            .await
            .map_err(|e| UpgradeError::Internal(format!("job task failed: {}", e)))
    }
}

/// Result of a connection test
#[derive(Debug, Clone)]
pub struct ConnectionReport {
    pub reachable: bool,
    pub category: Option<ErrorCategory>,
    pub remediation: Option<String>,
    pub detail: Option<String>,
    pub elapsed: Duration,
}

/// Result of an operator command
#[derive(Debug, Clone)]
pub struct CommandReport {
    /// Key of the command's diagnostic records
    pub id: JobId,
    pub exit_code: Option<i32>,
    pub terminated_by: TerminatedBy,
    /// `None` when the command exited with 0
    pub category: Option<ErrorCategory>,
    pub elapsed: Duration,
}

impl CommandReport {
    pub fn succeeded(&self) -> bool {
        self.category.is_none()
    }
}

/// Orchestrates upgrade and transfer jobs, one at a time
pub struct UpgradeEngine {
    options: EngineOptions,
    launcher: Arc<dyn ProcessLauncher>,
    sink: Arc<dyn DiagnosticSink>,
    transport: SshTransport,
    guard: ConcurrencyGuard,
    registry: JobRegistry,
    authorization: Authorization,
}

impl UpgradeEngine {
    /// Create an engine. Requires a passed authorization check.
    pub fn new(
        authorization: Authorization,
        options: EngineOptions,
        launcher: Arc<dyn ProcessLauncher>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let transport = SshTransport::new(options.connect_timeout_secs);
        Self {
            options,
            launcher,
            sink,
            transport,
            guard: ConcurrencyGuard::new(),
            registry: JobRegistry::new(),
            authorization,
        }
    }

    pub fn authorization(&self) -> &Authorization {
        &self.authorization
    }

    /// Validate and start a job.
    ///
    /// `Busy` and `Validation` failures are returned here, before any process is spawned.
    /// Everything else is reported by the job's [`JobReport`].
    pub async fn start(&self, request: UpgradeRequest) -> Result<JobHandle, UpgradeError> {
        let id = JobId::new();
        let token = self.guard.try_acquire(&id).inspect_err(|e| {
            warn!("Rejected {} job: {}", request.kind, e);
        })?;

        let kind = request.kind;
        let mut fsm = UpgradeFsm::new(kind);
        fsm.process(UpgradeEvent::Begin)
            .map_err(UpgradeError::InvalidTransition)?;

        let budget = self.options.budgets.for_kind(kind);
        let mut job = UpgradeJob::new(id.clone(), kind, self.options.remote_dir.clone(), budget);

        let prepared = match self.validate(&request, &mut job).await {
            Ok(()) => pipeline::build(&job, &self.options.pipeline)
                .and_then(|steps| Ok((steps, OutputClassifier::for_kind(kind)?))),
            Err(e) => Err(e),
        };
        let (steps, classifier) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                let _ = fsm.process(UpgradeEvent::Rejected(e.category()));
                warn!("Job {} failed validation: {}", id, e);
                return Err(e);
            }
        };
        fsm.process(UpgradeEvent::Validated)
            .map_err(UpgradeError::InvalidTransition)?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel = Arc::new(cancel_tx);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        self.registry
            .insert(
                JobSnapshot {
                    id: id.clone(),
                    kind,
                    phase: fsm.phase(),
                    progress: None,
                    progress_label: None,
                    started_at: job.started_at,
                },
                cancel.clone(),
            )
            .await;

        info!(
            "Starting {} job {} on {} with a {:?} budget",
            kind,
            id,
            request.target.destination(),
            budget
        );

        let runner = JobRunner {
            deadline: Instant::now() + budget,
            job,
            fsm,
            target: request.target,
            steps,
            supervisor: ProcessSupervisor::new(
                self.launcher.clone(),
                self.sink.clone(),
                self.options.supervisor.clone(),
            ),
            classifier,
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            notices: notice_tx,
            cancel: cancel_rx,
            output_tail: VecDeque::with_capacity(OUTPUT_TAIL_LINES),
            _token: token,
        };
        let task = tokio::spawn(runner.run());

        Ok(JobHandle {
            id,
            cancel,
            notices: notice_rx,
            task,
        })
    }

    async fn validate(&self, request: &UpgradeRequest, job: &mut UpgradeJob) -> Result<(), UpgradeError> {
        request.target.validate()?;
        if self.options.remote_dir.trim().is_empty() {
            return Err(UpgradeError::ValidationError("Remote directory is empty".to_string()));
        }
        if request.kind != JobKind::FileTransfer {
            return Ok(());
        }

        let source = request
            .source
            .as_ref()
            .ok_or_else(|| UpgradeError::ValidationError("No local file selected".to_string()))?;
        let metadata = tokio::fs::metadata(source).await.map_err(|e| {
            UpgradeError::ValidationError(format!("{}: {}", source.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(UpgradeError::ValidationError(format!(
                "{} is not a regular file",
                source.display()
            )));
        }
        let name = source
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                UpgradeError::ValidationError(format!("{} has no usable file name", source.display()))
            })?;

        let checksum = transfer::local_checksum(source).await.map_err(|e| {
            UpgradeError::ValidationError(format!("Failed to hash {}: {}", source.display(), e))
        })?;
        debug!("Local checksum of {}: {}", source.display(), checksum);

        job.remote_path = pipeline::remote_join(&self.options.remote_dir, name);
        job.source_path = Some(source.clone());
        job.local_checksum = Some(checksum);
        Ok(())
    }

    /// Live snapshot of a registered job
    pub async fn status(&self, id: &JobId) -> Option<JobSnapshot> {
        self.registry.get(id).await
    }

    /// Snapshot of the job holding the guard
    pub async fn active(&self) -> Option<JobSnapshot> {
        let id = self.guard.holder()?;
        self.registry.get(&id).await
    }

    pub async fn cancel(&self, id: &JobId) -> Result<(), UpgradeError> {
        info!("Cancellation requested for job {}", id);
        self.registry.cancel(id).await
    }

    /// Check that the device accepts a trivial remote command
    pub async fn test_connection(&self, target: &RemoteTarget) -> Result<ConnectionReport, UpgradeError> {
        let id = JobId::new();
        let _token = self.guard.try_acquire(&id)?;
        target.validate()?;

        let started = Instant::now();
        let budget = self.options.budgets.connection_test;
        let transport = SshTransport::new(self.options.connect_timeout_secs.min(budget.as_secs().max(1)));
        let spec = transport.remote_shell(target, &format!("echo {}", CONNECTION_MARKER));

        let mut supervisor = ProcessSupervisor::new(
            self.launcher.clone(),
            self.sink.clone(),
            self.options.supervisor.clone(),
        );
        info!("Testing connection to {}", target.destination());

        let mut marker_seen = false;
        let mut failure: Option<(&'static classifier::ErrorSignature, String)> = None;
        let mut last_line: Option<String> = None;

        let exit = match supervisor.start(&id, &spec, budget).await {
            Err(e) => Err(e),
            Ok(()) => loop {
                match supervisor.next_event().await {
                    Some(SupervisorEvent::Output(line)) => {
                        if line.text.trim() == CONNECTION_MARKER {
                            marker_seen = true;
                        } else if failure.is_none() {
                            failure = classifier::lookup(JobKind::FileTransfer, &line.text)
                                .filter(|signature| signature.category == ErrorCategory::Connection)
                                .map(|signature| (signature, line.text.clone()));
                        }
                        last_line = Some(line.text);
                    }
                    Some(SupervisorEvent::Exited {
                        code,
                        terminated_by,
                    }) => break Ok((code, terminated_by)),
                    None => break Err(UpgradeError::SupervisorError("process vanished".to_string())),
                }
            },
        };

        let elapsed = started.elapsed();
        let reachable = matches!(exit, Ok((Some(0), TerminatedBy::Natural))) && marker_seen;
        if reachable {
            info!("Connection to {} succeeded in {:?}", target.destination(), elapsed);
            return Ok(ConnectionReport {
                reachable,
                category: None,
                remediation: None,
                detail: None,
                elapsed,
            });
        }

        let template = failure
            .as_ref()
            .map(|(signature, _)| signature.remediation())
            .unwrap_or_else(|| ErrorCategory::Connection.remediation());
        let detail = match (&exit, failure) {
            (Err(e), _) => Some(e.to_string()),
            (Ok((_, TerminatedBy::Killed(_))), _) => {
                Some(format!("no answer within {:?}", budget))
            }
            (_, Some((_, line))) => Some(line),
            _ => last_line,
        };
        warn!(
            "Connection to {} failed: {}",
            target.destination(),
            detail.as_deref().unwrap_or("unknown error")
        );

        Ok(ConnectionReport {
            reachable,
            category: Some(ErrorCategory::Connection),
            remediation: Some(render_remediation(template, &self.options.remote_dir, &target.host)),
            detail,
            elapsed,
        })
    }

    /// Run an operator shell command on the device.
    ///
    /// Holds the guard like any job, so it is `Busy` while an upgrade runs. Every output line
    /// is sent to `notices` as [`JobNotice::Output`] as soon as it arrives.
    pub async fn run_command(
        &self,
        target: &RemoteTarget,
        command: &str,
        notices: mpsc::UnboundedSender<JobNotice>,
    ) -> Result<CommandReport, UpgradeError> {
        let id = JobId::new();
        let _token = self.guard.try_acquire(&id)?;
        target.validate()?;
        if command.trim().is_empty() {
            return Err(UpgradeError::ValidationError("Command is empty".to_string()));
        }

        let started = Instant::now();
        let budget = self.options.budgets.command;
        let spec = self.transport.remote_shell(target, command);
        let mut supervisor = ProcessSupervisor::new(
            self.launcher.clone(),
            self.sink.clone(),
            self.options.supervisor.clone(),
        );
        info!("Running on {}: {}", target.destination(), command);
        supervisor.start(&id, &spec, budget).await?;

        let mut connection_failure = false;
        let (exit_code, terminated_by) = loop {
            match supervisor.next_event().await {
                Some(SupervisorEvent::Output(line)) => {
                    connection_failure |= classifier::lookup(JobKind::FileTransfer, &line.text)
                        .is_some_and(|signature| signature.category == ErrorCategory::Connection);
                    let _ = notices.send(JobNotice::Output(line));
                }
                Some(SupervisorEvent::Exited {
                    code,
                    terminated_by,
                }) => break (code, terminated_by),
                None => return Err(UpgradeError::SupervisorError("process vanished".to_string())),
            }
        };

        let category = match (terminated_by, exit_code) {
            (TerminatedBy::Killed(_), _) => Some(ErrorCategory::Timeout),
            (TerminatedBy::Natural, Some(0)) => None,
            // ssh reports its own failures as 255
            (TerminatedBy::Natural, Some(255)) if connection_failure => Some(ErrorCategory::Connection),
            _ => Some(ErrorCategory::RemoteCommand),
        };
        let elapsed = started.elapsed();
        match category {
            None => info!("Command on {} finished in {:?}", target.destination(), elapsed),
            Some(category) => warn!(
                "Command on {} ended with {:?} ({})",
                target.destination(),
                exit_code,
                category
            ),
        }

        Ok(CommandReport {
            id,
            exit_code,
            terminated_by,
            category,
            elapsed,
        })
    }
}

enum Wake {
    Cancel(bool),
    CancelClosed,
    Event(Option<SupervisorEvent>),
}

/// Control loop of one job
struct JobRunner {
    job: UpgradeJob,
    fsm: UpgradeFsm,
    target: RemoteTarget,
    steps: Vec<CommandStep>,
    supervisor: ProcessSupervisor,
    classifier: OutputClassifier,
    transport: SshTransport,
    registry: JobRegistry,
    notices: mpsc::UnboundedSender<JobNotice>,
    cancel: watch::Receiver<bool>,
    deadline: Instant,
    output_tail: VecDeque<String>,
    _token: GuardToken,
}

impl JobRunner {
    async fn run(mut self) -> JobReport {
        self.notify(JobNotice::Phase(self.fsm.phase()));

        while self.fsm.phase().runs_process() {
            let phase = self.fsm.phase();
            self.run_phase(phase).await;
            if self.fsm.phase() == phase && !self.fsm.phase().is_terminal() {
                // the phase must always advance, bail out instead of spinning
                error!("Job {} stalled in phase {}", self.job.id, phase);
                let _ = self
                    .apply(UpgradeEvent::LaunchFailed(ErrorCategory::RemoteCommand))
                    .await;
            }
        }

        let tail = self.output_tail.iter().cloned().collect();
        let report = JobReport::new(&self.job, &self.fsm, &self.target.host, tail);
        match report.category {
            None => info!("Job {} finished in {:?}", self.job.id, report.elapsed()),
            Some(category) => warn!(
                "Job {} ended as {} ({})",
                self.job.id, report.phase, category
            ),
        }

        self.registry.remove(&self.job.id).await;
        self.notify(JobNotice::Finished(report.clone()));
        report
    }

    async fn run_phase(&mut self, phase: JobPhase) {
        let step = Stage::for_phase(phase)
            .and_then(|stage| self.steps.iter().find(|step| step.stage == stage).cloned());
        let Some(step) = step else {
            error!("No command step for phase {} of job {}", phase, self.job.id);
            self.apply(UpgradeEvent::LaunchFailed(ErrorCategory::RemoteCommand))
                .await;
            return;
        };

        if *self.cancel.borrow() {
            self.apply(UpgradeEvent::CancelRequested).await;
            self.apply(UpgradeEvent::CancelConfirmed).await;
            return;
        }

        let remaining = self.deadline.saturating_duration_since(Instant::now());
        let spec = self.transport.render(&self.target, &step.action);
        self.classifier.reset();

        info!("Job {} {}: {}", self.job.id, phase, spec.display());
        if let Err(e) = self.supervisor.start(&self.job.id, &spec, remaining).await {
            warn!("Failed to launch {} for job {}: {}", spec.program, self.job.id, e);
            self.apply(UpgradeEvent::LaunchFailed(e.category())).await;
            return;
        }

        let mut cancel_open = true;
        let mut captured = String::new();
        loop {
            let wake = tokio::select! {
                changed = self.cancel.changed(), if cancel_open => match changed {
                    Ok(()) => Wake::Cancel(*self.cancel.borrow_and_update()),
                    Err(_) => Wake::CancelClosed,
                },
                event = self.supervisor.next_event() => Wake::Event(event),
            };

            match wake {
                Wake::Cancel(false) => {}
                Wake::Cancel(true) => {
                    info!("Cancelling job {}", self.job.id);
                    if let Directive::Kill(reason) = self.apply(UpgradeEvent::CancelRequested).await {
                        self.supervisor.kill(reason).await;
                    }
                }
                Wake::CancelClosed => cancel_open = false,
                Wake::Event(Some(SupervisorEvent::Output(line))) => {
                    if phase == JobPhase::Verifying {
                        captured.push_str(&line.text);
                        captured.push('\n');
                    }
                    self.on_output(phase, line).await;
                }
                Wake::Event(Some(SupervisorEvent::Exited {
                    code,
                    terminated_by,
                })) => {
                    self.job.last_exit_code = code;
                    self.apply(UpgradeEvent::Exited {
                        code,
                        terminated_by,
                    })
                    .await;
                    if self.fsm.awaiting_checksum() {
                        self.verify_checksum(&captured).await;
                    }
                    return;
                }
                Wake::Event(None) => {
                    error!("Supervisor of job {} lost its process", self.job.id);
                    self.apply(UpgradeEvent::LaunchFailed(ErrorCategory::RemoteCommand))
                        .await;
                    return;
                }
            }
        }
    }

    async fn on_output(&mut self, phase: JobPhase, line: OutputLine) {
        push_tail(&mut self.output_tail, &line.text);
        let classification = self.classifier.classify(&line.text);
        self.notify(JobNotice::Output(line.clone()));

        match &classification {
            Classification::None => {}
            Classification::Progress { percent, label } => {
                let (percent, label) = (*percent, label.clone());
                self.registry
                    .update(&self.job.id, |snapshot| {
                        snapshot.progress = Some(percent);
                        snapshot.progress_label = Some(label.clone());
                    })
                    .await;
                self.notify(JobNotice::Progress { percent, label });
            }
            Classification::Fatal(signature) => {
                error!(
                    "Fatal output in job {}: {} ({})",
                    self.job.id, line.text, signature.category
                );
            }
            Classification::Diagnostic(signature) => {
                warn!("Job {}: {} ({})", self.job.id, line.text, signature.category);
            }
            Classification::Informational(_) => {
                debug!("Job {}: tolerated warning: {}", self.job.id, line.text);
            }
        }

        if classification != Classification::None {
            self.job.classified_events.push(ClassifiedEvent {
                at: Utc::now(),
                phase,
                line: line.text,
                classification: classification.clone(),
            });
        }

        if let Directive::Kill(reason) = self.apply(UpgradeEvent::Output(classification)).await {
            self.supervisor.kill(reason).await;
        }
    }

    async fn verify_checksum(&mut self, output: &str) {
        let remote = transfer::parse_checksum_output(output);
        let matched = match (&self.job.local_checksum, &remote) {
            (Some(local), Some(remote)) => transfer::checksums_match(local, remote),
            _ => false,
        };
        info!(
            "Job {} checksum local={:?} remote={:?} matched={}",
            self.job.id, self.job.local_checksum, remote, matched
        );
        self.job.remote_checksum = remote;
        self.apply(UpgradeEvent::ChecksumVerified { matched }).await;
    }

    /// Feed `event` to the state machine and publish phase changes
    async fn apply(&mut self, event: UpgradeEvent) -> Directive {
        let before = self.fsm.phase();
        let directive = match self.fsm.process(event) {
            Ok(directive) => directive,
            Err(e) => {
                warn!("Job {}: {}", self.job.id, e);
                return Directive::None;
            }
        };

        let after = self.fsm.phase();
        if after != before {
            info!("Job {} phase {} -> {}", self.job.id, before, after);
            self.registry
                .update(&self.job.id, |snapshot| {
                    snapshot.phase = after;
                    snapshot.progress = None;
                    snapshot.progress_label = None;
                })
                .await;
            self.notify(JobNotice::Phase(after));
        }
        directive
    }

    fn notify(&self, notice: JobNotice) {
        // nobody listening is fine
        let _ = self.notices.send(notice);
    }
}

fn push_tail(tail: &mut VecDeque<String>, line: &str) {
    if tail.len() == OUTPUT_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line.to_string());
}
