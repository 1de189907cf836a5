//! Process supervisor
//!
//! Owns the single process of a job. Output and exit are pulled through
//! [`ProcessSupervisor::next_event`] by the job's control loop, which also decides when to call
//! [`ProcessSupervisor::kill`]. The timeout timer lives here: it is armed by `start` and dies
//! with the process, so it can never fire against a later one.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::errors::UpgradeError;
use crate::models::job::JobId;
use crate::upgrade::diagnostics::{DiagnosticEvent, DiagnosticSink};
use crate::upgrade::fsm::{KillReason, TerminatedBy};
use crate::upgrade::launcher::{OutputLine, ProcessLauncher, RunningProcess};
use crate::upgrade::transport::CommandSpec;

/// Supervisor tunables
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Time between the graceful and the forced termination
    pub kill_grace: Duration,

    /// Deadline for the launcher to confirm a process started
    pub startup_deadline: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(3),
            startup_deadline: Duration::from_secs(5),
        }
    }
}

/// Something the supervised process did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Output(OutputLine),
    /// Reported exactly once per process
    Exited {
        code: Option<i32>,
        terminated_by: TerminatedBy,
    },
}

struct ActiveProcess {
    job_id: JobId,
    process: Box<dyn RunningProcess>,
    deadline: Instant,
    kill_reason: Option<KillReason>,
    output_closed: bool,
    /// Exit code collected by `kill`
    reaped: Option<Option<i32>>,
}

enum Wake {
    Line(Option<OutputLine>),
    Exit(Result<Option<i32>, UpgradeError>),
    Deadline,
}

pub struct ProcessSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    sink: Arc<dyn DiagnosticSink>,
    options: SupervisorOptions,
    active: Option<ActiveProcess>,
}

impl ProcessSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        sink: Arc<dyn DiagnosticSink>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            launcher,
            sink,
            options,
            active: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Start `spec` for `job_id` with a hard `timeout`
    pub async fn start(
        &mut self,
        job_id: &JobId,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<(), UpgradeError> {
        if let Some(active) = &self.active {
            return Err(UpgradeError::SupervisorError(format!(
                "a process for job {} is still running",
                active.job_id
            )));
        }

        let process = tokio::time::timeout(self.options.startup_deadline, self.launcher.launch(spec))
            .await
            .map_err(|_| {
                UpgradeError::SpawnError(format!(
                    "{} did not start within {:?}",
                    spec.program, self.options.startup_deadline
                ))
            })??;

        self.sink.record(
            job_id,
            DiagnosticEvent::Started {
                command: spec.display(),
                pid: process.pid(),
                timeout,
            },
        );

        self.active = Some(ActiveProcess {
            job_id: job_id.clone(),
            process,
            deadline: Instant::now() + timeout,
            kill_reason: None,
            output_closed: false,
            reaped: None,
        });
        Ok(())
    }

    /// Next output line or the exit. `None` when nothing is running.
    pub async fn next_event(&mut self) -> Option<SupervisorEvent> {
        loop {
            let wake = {
                let active = self.active.as_mut()?;
                let armed = active.kill_reason.is_none();
                let deadline = active.deadline;

                if !active.output_closed {
                    tokio::select! {
                        line = active.process.next_line() => Wake::Line(line),
                        _ = sleep_until(deadline), if armed => Wake::Deadline,
                    }
                } else if let Some(code) = active.reaped {
                    Wake::Exit(Ok(code))
                } else {
                    tokio::select! {
                        code = active.process.wait() => Wake::Exit(code),
                        _ = sleep_until(deadline), if armed => Wake::Deadline,
                    }
                }
            };

            match wake {
                Wake::Line(Some(line)) => {
                    if let Some(active) = &self.active {
                        self.sink.record(
                            &active.job_id,
                            DiagnosticEvent::Output {
                                stream: line.stream,
                                line: line.text.clone(),
                            },
                        );
                    }
                    return Some(SupervisorEvent::Output(line));
                }
                Wake::Line(None) => {
                    if let Some(active) = self.active.as_mut() {
                        active.output_closed = true;
                    }
                }
                Wake::Deadline => {
                    debug!("Process deadline reached");
                    self.kill(KillReason::Timeout).await;
                }
                Wake::Exit(result) => {
                    let active = self.active.take()?;
                    let code = result.unwrap_or_else(|e| {
                        warn!("Failed to collect exit status: {}", e);
                        None
                    });
                    let terminated_by = match active.kill_reason {
                        Some(reason) => TerminatedBy::Killed(reason),
                        None => TerminatedBy::Natural,
                    };
                    self.sink.record(
                        &active.job_id,
                        DiagnosticEvent::Exited {
                            code,
                            terminated_by,
                        },
                    );
                    return Some(SupervisorEvent::Exited {
                        code,
                        terminated_by,
                    });
                }
            }
        }
    }

    /// Terminate the running process: graceful signal, grace period, then force.
    ///
    /// The first reason sticks. A later call only repeats the termination when an earlier
    /// one was interrupted before the process was reaped. The exit is still reported through
    /// [`ProcessSupervisor::next_event`].
    pub async fn kill(&mut self, reason: KillReason) {
        let grace = self.options.kill_grace;
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.reaped.is_some() {
            return;
        }

        if active.kill_reason.is_none() {
            active.kill_reason = Some(reason);
            self.sink
                .record(&active.job_id, DiagnosticEvent::KillRequested { reason });
        }

        let code = match active.process.terminate(grace).await {
            Ok(code) => code,
            Err(e) => {
                warn!("Failed to terminate process of job {}: {}", active.job_id, e);
                None
            }
        };
        active.reaped = Some(code);
    }
}
