//! Persisted job records and the per-job lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use entitle_core::{CorrelationId, JobId};

use super::arguments::JobArguments;
use super::config::JobConfig;
use super::error::JobError;

/// Lifecycle state of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Persisted, admission not yet decided
    Created,
    /// Blocked by a constraint, re-evaluated as other jobs finish
    Waiting,
    /// Admitted and handed (or about to be handed) to the bus
    Queued,
    /// Currently being executed by a worker
    Running,
    /// Failed, will be queued again
    FailedWithRetry,
    /// Completed successfully
    Finished,
    /// Failed permanently
    Failed,
    /// Withdrawn before it ran
    Canceled,
    /// Refused at admission because of a constraint conflict
    Aborted,
}

impl JobState {
    pub const ALL: [JobState; 9] = [
        JobState::Created,
        JobState::Waiting,
        JobState::Queued,
        JobState::Running,
        JobState::FailedWithRetry,
        JobState::Finished,
        JobState::Failed,
        JobState::Canceled,
        JobState::Aborted,
    ];

    /// States a constraint still counts as occupying a slot.
    pub const ACTIVE: [JobState; 3] = [JobState::Queued, JobState::Running, JobState::FailedWithRetry];

    pub fn transitions(self) -> &'static [JobState] {
        use JobState::*;

        match self {
            Created => &[Queued, Waiting, Aborted, Failed, Canceled],
            Waiting => &[Queued, Aborted, Canceled],
            Queued => &[Running, Failed, Canceled],
            Running => &[Finished, Failed, FailedWithRetry],
            FailedWithRetry => &[Queued, Failed],
            Finished | Failed | Canceled | Aborted => &[],
        }
    }

    pub fn is_valid_transition(self, target: JobState) -> bool {
        self.transitions().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        self.transitions().is_empty()
    }

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::Waiting => "WAITING",
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::FailedWithRetry => "FAILED_WITH_RETRY",
            JobState::Finished => "FINISHED",
            JobState::Failed => "FAILED",
            JobState::Canceled => "CANCELED",
            JobState::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted status of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    id: JobId,
    job_key: String,
    name: Option<String>,
    group: Option<String>,
    owner: Option<String>,
    /// Identity that scheduled the job (not necessarily whoever runs it)
    principal: String,
    correlation_id: CorrelationId,
    state: JobState,
    previous_state: Option<JobState>,
    arguments: JobArguments,
    retries_remaining: u32,
    attempts: u32,
    max_attempts: u32,
    log_level: Option<String>,
    log_execution_details: bool,
    result: Option<String>,
    conflicts: Vec<JobId>,
    /// Node that last executed the job
    executor: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Build a fresh `CREATED` record from a validated configuration.
    pub fn from_config(config: &JobConfig, principal: impl Into<String>) -> Self {
        let now = Utc::now();
        let retries = config.retry_count();

        Self {
            id: JobId::new(),
            job_key: config.job_key().unwrap_or_default().to_string(),
            name: config.job_name().map(str::to_string),
            group: config.job_group().map(str::to_string),
            owner: config.context_owner().map(str::to_string),
            principal: principal.into(),
            correlation_id: CorrelationId::new(),
            state: JobState::Created,
            previous_state: None,
            arguments: config.job_arguments(),
            retries_remaining: retries,
            attempts: 0,
            max_attempts: retries.saturating_add(1),
            log_level: config.log_level().map(str::to_string),
            log_execution_details: config.logs_execution_details(),
            result: None,
            conflicts: Vec::new(),
            executor: None,
            created_at: now,
            updated_at: now,
            start_time: None,
            end_time: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn job_key(&self) -> &str {
        &self.job_key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn previous_state(&self) -> Option<JobState> {
        self.previous_state
    }

    pub fn arguments(&self) -> &JobArguments {
        &self.arguments
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn log_level(&self) -> Option<&str> {
        self.log_level.as_deref()
    }

    pub fn logs_execution_details(&self) -> bool {
        self.log_execution_details
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn conflicts(&self) -> &[JobId] {
        &self.conflicts
    }

    pub fn executor(&self) -> Option<&str> {
        self.executor.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Move the job to `target`, refusing transitions the lifecycle forbids.
    pub fn set_state(&mut self, target: JobState) -> Result<(), JobError> {
        if !self.state.is_valid_transition(target) {
            return Err(JobError::InvalidJobState {
                job_id: self.id,
                from: self.state,
                to: target,
            });
        }

        let now = Utc::now();
        self.previous_state = Some(std::mem::replace(&mut self.state, target));
        self.updated_at = now;

        if target == JobState::Running {
            self.start_time = Some(now);
            self.end_time = None;
        } else if target.is_terminal() {
            self.end_time = Some(now);
        }
        Ok(())
    }

    pub fn set_result(&mut self, result: impl Into<String>) {
        self.result = Some(result.into());
        self.updated_at = Utc::now();
    }

    pub fn set_conflicts(&mut self, conflicts: Vec<JobId>) {
        self.conflicts = conflicts;
    }

    /// Record the start of an execution attempt on `executor`.
    pub fn begin_attempt(&mut self, executor: &str) {
        self.attempts += 1;
        self.executor = Some(executor.to_string());
    }

    /// Spend one retry. Returns `false` if none were left.
    pub fn consume_retry(&mut self) -> bool {
        match self.retries_remaining.checked_sub(1) {
            Some(left) => {
                self.retries_remaining = left;
                true
            }
            None => false,
        }
    }

    /// The message a worker needs to find this record again.
    pub fn message(&self) -> JobMessage {
        JobMessage {
            job_id: self.id,
            job_key: self.job_key.clone(),
            correlation_id: self.correlation_id,
        }
    }
}

/// Body of the message dispatched for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    job_id: JobId,
    job_key: String,
    correlation_id: CorrelationId,
}

impl JobMessage {
    pub fn new(job_id: JobId, job_key: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self {
            job_id,
            job_key: job_key.into(),
            correlation_id,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_key(&self) -> &str {
        &self.job_key
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}

/// Filter for [`JobStore::find_jobs`](super::store::JobStore::find_jobs).
///
/// Empty lists mean "any". Argument filters compare raw serialized values;
/// `None` matches records that do not carry the argument at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub job_ids: Vec<JobId>,
    pub job_keys: Vec<String>,
    pub states: Vec<JobState>,
    pub owner: Option<String>,
    pub arguments: Vec<(String, Option<String>)>,
    pub limit: Option<usize>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_key(mut self, key: impl Into<String>) -> Self {
        self.job_keys.push(key.into());
        self
    }

    pub fn with_states(mut self, states: impl IntoIterator<Item = JobState>) -> Self {
        self.states.extend(states);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_argument(mut self, name: impl Into<String>, raw_value: Option<String>) -> Self {
        self.arguments.push((name.into(), raw_value));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        (self.job_ids.is_empty() || self.job_ids.contains(&record.id))
            && (self.job_keys.is_empty() || self.job_keys.iter().any(|k| k == &record.job_key))
            && (self.states.is_empty() || self.states.contains(&record.state))
            && self
                .owner
                .as_deref()
                .is_none_or(|owner| record.owner() == Some(owner))
            && self.arguments.iter().all(|(name, value)| {
                record.arguments.get_serialized_value(name) == value.as_deref()
            })
    }
}
