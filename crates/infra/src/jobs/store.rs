//! Job status storage.
//!
//! The durable store is an external collaborator; this module defines the
//! queries the job subsystem needs from it and an in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use entitle_core::JobId;

use super::types::{JobQuery, JobRecord, JobState};

/// Non-terminal states in which a job still holds a uniqueness claim.
const UNFINISHED: [JobState; 5] = [
    JobState::Created,
    JobState::Waiting,
    JobState::Queued,
    JobState::Running,
    JobState::FailedWithRetry,
];

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Persist a new record.
    fn create(&self, record: JobRecord) -> Result<JobId, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Overwrite an existing record.
    fn update(&self, record: &JobRecord) -> Result<(), JobStoreError>;

    /// Records matching `query`, oldest first.
    fn find_jobs(&self, query: &JobQuery) -> Result<Vec<JobRecord>, JobStoreError>;

    /// IDs of jobs with `job_key` currently queued, running or awaiting retry.
    fn find_active_by_key(&self, job_key: &str) -> Result<Vec<JobId>, JobStoreError> {
        let query = JobQuery::new()
            .with_job_key(job_key)
            .with_states(JobState::ACTIVE);
        Ok(self.find_jobs(&query)?.iter().map(JobRecord::id).collect())
    }

    /// Unfinished jobs with `job_key` whose raw arguments match, oldest first.
    fn find_by_arguments(
        &self,
        job_key: &str,
        arguments: &[(String, Option<String>)],
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let query = arguments.iter().fold(
            JobQuery::new().with_job_key(job_key).with_states(UNFINISHED),
            |query, (name, value)| query.with_argument(name.clone(), value.clone()),
        );
        self.find_jobs(&query)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub created: usize,
    pub waiting: usize,
    pub queued: usize,
    pub running: usize,
    pub failed_with_retry: usize,
    pub finished: usize,
    pub failed: usize,
    pub canceled: usize,
    pub aborted: usize,
}

impl JobStats {
    fn count(&mut self, state: JobState) {
        let slot = match state {
            JobState::Created => &mut self.created,
            JobState::Waiting => &mut self.waiting,
            JobState::Queued => &mut self.queued,
            JobState::Running => &mut self.running,
            JobState::FailedWithRetry => &mut self.failed_with_retry,
            JobState::Finished => &mut self.finished,
            JobState::Failed => &mut self.failed,
            JobState::Canceled => &mut self.canceled,
            JobState::Aborted => &mut self.aborted,
        };
        *slot += 1;
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, record: JobRecord) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&record.id()) {
            return Err(JobStoreError::AlreadyExists(record.id()));
        }
        let id = record.id();
        jobs.insert(id, record);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.get(&job_id).cloned())
    }

    fn update(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        match jobs.get_mut(&record.id()) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(record.id())),
        }
    }

    fn find_jobs(&self, query: &JobQuery) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut result: Vec<_> = jobs.values().filter(|j| query.matches(j)).cloned().collect();

        // Sort by created_at (then id) to keep results FIFO and deterministic
        result.sort_by_key(|j| (j.created_at(), j.id()));
        if let Some(limit) = query.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.count(job.state());
        }
        Ok(stats)
    }
}
