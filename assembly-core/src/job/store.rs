use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::error::ValidationError;
use super::models::{CancelOutcome, Job, JobHandle, JobSnapshot};

/// Live state of one job: the latest published snapshot and its cancel token.
#[derive(Debug)]
pub(crate) struct JobEntry {
    state: watch::Sender<Arc<Job>>,
    cancel: CancellationToken,
}

impl JobEntry {
    fn new(job: &Job) -> Self {
        let (state, _) = watch::channel(Arc::new(job.clone()));
        Self {
            state,
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn current(&self) -> Arc<Job> {
        self.state.borrow().clone()
    }

    pub(crate) fn publish(&self, job: &Job) {
        self.state.send_replace(Arc::new(job.clone()));
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Job>> {
        self.state.subscribe()
    }
}

pub(crate) enum Admission {
    Existing(JobHandle),
    Created { entry: Arc<JobEntry>, job: Job },
}

/// In-memory index of jobs by id.
#[derive(Debug, Default)]
pub(crate) struct JobStore {
    jobs: RwLock<HashMap<String, Arc<JobEntry>>>,
}

impl JobStore {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<JobEntry>>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<JobEntry>>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the live job for `job_id`, or builds and inserts a new one.
    /// Both happen under the write lock so two submitters cannot race.
    pub(crate) fn admit<F>(&self, job_id: &str, build: F) -> Result<Admission, ValidationError>
    where
        F: FnOnce() -> Result<Job, ValidationError>,
    {
        let mut jobs = self.write();
        if let Some(existing) = jobs.get(job_id) {
            let current = existing.current();
            if !current.status.terminal() {
                return Ok(Admission::Existing(JobHandle {
                    job_id: current.id.clone(),
                    status: current.status,
                    deduplicated: true,
                }));
            }
        }
        let job = build()?;
        let entry = Arc::new(JobEntry::new(&job));
        jobs.insert(job.id.clone(), entry.clone());
        Ok(Admission::Created { entry, job })
    }

    pub(crate) fn get(&self, job_id: &str) -> Option<Arc<JobEntry>> {
        self.read().get(job_id).cloned()
    }

    pub(crate) fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.read().get(job_id).map(|entry| entry.current().snapshot())
    }

    pub(crate) fn snapshots(&self) -> Vec<JobSnapshot> {
        let mut snapshots: Vec<JobSnapshot> = self
            .read()
            .values()
            .map(|entry| entry.current().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.job_id.cmp(&b.job_id)));
        snapshots
    }

    pub(crate) fn cancel(&self, job_id: &str) -> CancelOutcome {
        let jobs = self.write();
        let Some(entry) = jobs.get(job_id) else {
            return CancelOutcome::NotFound;
        };
        let status = entry.current().status;
        if status.terminal() {
            return CancelOutcome::AlreadyTerminal;
        }
        entry.cancel.cancel();
        if status.cancellable() {
            CancelOutcome::Cancelled
        } else {
            CancelOutcome::Deferred
        }
    }

    /// Publishes `job` unless a cancel has been requested. Runs under the
    /// write lock so it is ordered with respect to [`JobStore::cancel`].
    pub(crate) fn publish_unless_cancelled(&self, entry: &JobEntry, job: &Job) -> bool {
        let _jobs = self.write();
        if entry.cancel.is_cancelled() {
            return false;
        }
        entry.publish(job);
        true
    }
}
