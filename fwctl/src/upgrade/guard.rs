//! Single-flight concurrency guard

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::errors::UpgradeError;
use crate::models::job::JobId;

/// At most one job holds the guard at any time
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGuard {
    holder: Arc<Mutex<Option<JobId>>>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard for `job_id`, or fail with `Busy` without waiting
    pub fn try_acquire(&self, job_id: &JobId) -> Result<GuardToken, UpgradeError> {
        let mut holder = self.holder.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(active) = holder.as_ref() {
            return Err(UpgradeError::Busy(format!("job {} is running", active)));
        }
        *holder = Some(job_id.clone());
        Ok(GuardToken {
            holder: self.holder.clone(),
            job_id: job_id.clone(),
        })
    }

    /// Job currently holding the guard
    pub fn holder(&self) -> Option<JobId> {
        self.holder
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_held(&self) -> bool {
        self.holder().is_some()
    }
}

/// Releases the guard when dropped
#[derive(Debug)]
pub struct GuardToken {
    holder: Arc<Mutex<Option<JobId>>>,
    job_id: JobId,
}

impl GuardToken {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        let mut holder = self.holder.lock().unwrap_or_else(|p| p.into_inner());
        if holder.as_ref() == Some(&self.job_id) {
            *holder = None;
            debug!("Released concurrency guard held by job {}", self.job_id);
        }
    }
}
