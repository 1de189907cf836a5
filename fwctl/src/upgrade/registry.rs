//! Job registry

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, RwLock};

use crate::errors::UpgradeError;
use crate::models::job::{JobId, JobKind};
use crate::upgrade::fsm::JobPhase;

/// Live view of a running job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub phase: JobPhase,
    pub progress: Option<u8>,
    pub progress_label: Option<String>,
    pub started_at: DateTime<Utc>,
}

struct JobEntry {
    snapshot: JobSnapshot,
    cancel: Arc<watch::Sender<bool>>,
}

/// Registered jobs by id
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<JobId, JobEntry>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, snapshot: JobSnapshot, cancel: Arc<watch::Sender<bool>>) {
        let mut jobs = self.jobs.write().await;
        jobs.insert(snapshot.id.clone(), JobEntry { snapshot, cancel });
    }

    pub async fn update<F>(&self, id: &JobId, f: F)
    where
        F: FnOnce(&mut JobSnapshot),
    {
        let mut jobs = self.jobs.write().await;
        if let Some(entry) = jobs.get_mut(id) {
            f(&mut entry.snapshot);
        }
    }

    pub async fn get(&self, id: &JobId) -> Option<JobSnapshot> {
        let jobs = self.jobs.read().await;
        jobs.get(id).map(|entry| entry.snapshot.clone())
    }

    /// Flip the cancel switch of `id`
    pub async fn cancel(&self, id: &JobId) -> Result<(), UpgradeError> {
        let jobs = self.jobs.read().await;
        let entry = jobs
            .get(id)
            .ok_or_else(|| UpgradeError::NotFound(format!("job {}", id)))?;
        entry.cancel.send_replace(true);
        Ok(())
    }

    pub async fn remove(&self, id: &JobId) -> Option<JobSnapshot> {
        let mut jobs = self.jobs.write().await;
        jobs.remove(id).map(|entry| entry.snapshot)
    }

    pub async fn list(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.read().await;
        jobs.values().map(|entry| entry.snapshot.clone()).collect()
    }
}
