//! Terminal job reports

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::ErrorCategory;
use crate::models::job::{JobId, JobKind, UpgradeJob};
use crate::upgrade::classifier::Classification;
use crate::upgrade::fsm::{JobPhase, UpgradeFsm};

/// Fill the `{source}` and `{host}` placeholders of a remediation template
pub fn render_remediation(template: &str, source: &str, host: &str) -> String {
    template.replace("{source}", source).replace("{host}", host)
}

/// Outcome of a job, produced once it reached a terminal phase
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub kind: JobKind,
    pub phase: JobPhase,
    pub history: Vec<JobPhase>,
    pub category: Option<ErrorCategory>,
    pub remediation: Option<String>,

    /// Output line that identified the failure
    pub diagnostic_line: Option<String>,

    pub last_exit_code: Option<i32>,
    pub local_checksum: Option<String>,
    pub remote_checksum: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Last lines printed by the remote side
    pub output_tail: Vec<String>,
}

impl JobReport {
    pub fn new(job: &UpgradeJob, fsm: &UpgradeFsm, host: &str, output_tail: Vec<String>) -> Self {
        let phase = fsm.phase();
        let category = phase.failure_category();
        let signature = fsm.failure_signature();

        let remediation = category.map(|category| {
            let template = signature
                .map(|signature| signature.remediation())
                .unwrap_or_else(|| category.remediation());
            render_remediation(template, &job.remote_path, host)
        });

        let diagnostic_line = signature.and_then(|signature| {
            job.classified_events
                .iter()
                .find(|event| match &event.classification {
                    Classification::Fatal(seen) | Classification::Diagnostic(seen) => {
                        std::ptr::eq(*seen, signature)
                    }
                    _ => false,
                })
                .map(|event| event.line.clone())
        });

        Self {
            job_id: job.id.clone(),
            kind: job.kind,
            phase,
            history: fsm.history().to_vec(),
            category,
            remediation,
            diagnostic_line,
            last_exit_code: job.last_exit_code,
            local_checksum: job.local_checksum.clone(),
            remote_checksum: job.remote_checksum.clone(),
            started_at: job.started_at,
            finished_at: Utc::now(),
            output_tail,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.phase == JobPhase::Done
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
