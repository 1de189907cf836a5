//! Diagnostic log sink

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::models::job::JobId;
use crate::upgrade::fsm::{KillReason, TerminatedBy};
use crate::upgrade::launcher::OutputStream;

/// Tracing target routed to the append-only diagnostics file
pub const DIAGNOSTICS_TARGET: &str = "fwctl::diagnostics";

/// A supervisor transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticEvent {
    Started {
        command: String,
        pid: Option<u32>,
        timeout: Duration,
    },
    Output {
        stream: OutputStream,
        line: String,
    },
    KillRequested {
        reason: KillReason,
    },
    Exited {
        code: Option<i32>,
        terminated_by: TerminatedBy,
    },
}

/// Append-only mirror of supervisor transitions
pub trait DiagnosticSink: Send + Sync {
    fn record(&self, job_id: &JobId, event: DiagnosticEvent);
}

/// Writes transitions as tracing events under [`DIAGNOSTICS_TARGET`]
#[derive(Debug, Clone, Default)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn record(&self, job_id: &JobId, event: DiagnosticEvent) {
        match event {
            DiagnosticEvent::Started {
                command,
                pid,
                timeout,
            } => {
                info!(target: DIAGNOSTICS_TARGET, job_id = %job_id, ?pid, timeout_secs = timeout.as_secs(), "start: {}", command);
            }
            DiagnosticEvent::Output { stream, line } => {
                info!(target: DIAGNOSTICS_TARGET, job_id = %job_id, stream = stream.as_str(), "{}", line);
            }
            DiagnosticEvent::KillRequested { reason } => {
                info!(target: DIAGNOSTICS_TARGET, job_id = %job_id, ?reason, "kill requested");
            }
            DiagnosticEvent::Exited {
                code,
                terminated_by,
            } => {
                info!(target: DIAGNOSTICS_TARGET, job_id = %job_id, ?code, ?terminated_by, "exit");
            }
        }
    }
}

/// Keeps transitions in memory
#[derive(Debug, Default)]
pub struct MemoryDiagnostics {
    records: Mutex<Vec<(DateTime<Utc>, JobId, DiagnosticEvent)>>,
}

impl MemoryDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, _, event)| event.clone())
            .collect()
    }

    pub fn events_for(&self, job_id: &JobId) -> Vec<DiagnosticEvent> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(_, id, _)| id == job_id)
            .map(|(_, _, event)| event.clone())
            .collect()
    }
}

impl DiagnosticSink for MemoryDiagnostics {
    fn record(&self, job_id: &JobId, event: DiagnosticEvent) {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((Utc::now(), job_id.clone(), event));
    }
}
