//! Admission-control predicates.
//!
//! A constraint inspects the job store and reports which existing jobs the
//! inbound job would conflict with. It never mutates the store and never
//! decides what happens to the inbound job; the manager's
//! [`ConflictPolicy`](crate::settings::ConflictPolicy) does that.

use std::fmt;
use std::sync::Arc;

use entitle_core::JobId;

use super::store::{JobStore, JobStoreError};
use super::types::{JobRecord, JobState};

/// Read-only admission predicate.
pub trait JobConstraint: Send + Sync + fmt::Debug {
    /// IDs of existing jobs the inbound job conflicts with (empty if none).
    fn test(&self, store: &dyn JobStore, inbound: &JobRecord) -> Result<Vec<JobId>, JobStoreError>;

    /// Stable identity of the constraint and its parameters.
    fn describe(&self) -> String;
}

/// Factory for the canonical constraints.
#[derive(Debug)]
pub struct JobConstraints;

impl JobConstraints {
    /// Conflict with any other unfinished job of the same key whose listed
    /// arguments all carry the inbound job's raw values.
    pub fn unique_by_arguments<I, S>(names: I) -> Arc<dyn JobConstraint>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        Arc::new(UniqueByArguments { names })
    }

    /// Conflict when admitting another `job_key` job would put more than
    /// `limit` of them in flight at once.
    pub fn throttled_by_job_key(job_key: impl Into<String>, limit: usize) -> Arc<dyn JobConstraint> {
        Arc::new(ThrottledByJobKey {
            job_key: job_key.into(),
            limit,
        })
    }

    /// Wrap an arbitrary predicate.
    pub fn custom<F>(name: impl Into<String>, predicate: F) -> Arc<dyn JobConstraint>
    where
        F: Fn(&dyn JobStore, &JobRecord) -> Result<Vec<JobId>, JobStoreError> + Send + Sync + 'static,
    {
        Arc::new(FnConstraint {
            name: name.into(),
            predicate,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueByArguments {
    names: Vec<String>,
}

impl JobConstraint for UniqueByArguments {
    fn test(&self, store: &dyn JobStore, inbound: &JobRecord) -> Result<Vec<JobId>, JobStoreError> {
        let arguments: Vec<(String, Option<String>)> = self
            .names
            .iter()
            .map(|name| {
                let raw = inbound.arguments().get_serialized_value(name).map(str::to_string);
                (name.clone(), raw)
            })
            .collect();

        // A job not yet admitted only blocks jobs submitted after it, so the
        // oldest of several deferred duplicates goes first.
        let inbound_age = (inbound.created_at(), inbound.id());
        let conflicts = store
            .find_by_arguments(inbound.job_key(), &arguments)?
            .into_iter()
            .filter(|other| other.id() != inbound.id())
            .filter(|other| {
                !matches!(other.state(), JobState::Created | JobState::Waiting)
                    || (other.created_at(), other.id()) < inbound_age
            })
            .map(|other| other.id())
            .collect();
        Ok(conflicts)
    }

    fn describe(&self) -> String {
        format!("unique_by_arguments({})", self.names.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottledByJobKey {
    job_key: String,
    limit: usize,
}

impl JobConstraint for ThrottledByJobKey {
    fn test(&self, store: &dyn JobStore, inbound: &JobRecord) -> Result<Vec<JobId>, JobStoreError> {
        if inbound.job_key() != self.job_key {
            return Ok(Vec::new());
        }

        let active: Vec<JobId> = store
            .find_active_by_key(&self.job_key)?
            .into_iter()
            .filter(|id| *id != inbound.id())
            .collect();

        if active.len() >= self.limit {
            Ok(active)
        } else {
            Ok(Vec::new())
        }
    }

    fn describe(&self) -> String {
        format!("throttled_by_job_key({},{})", self.job_key, self.limit)
    }
}

struct FnConstraint<F> {
    name: String,
    predicate: F,
}

impl<F> fmt::Debug for FnConstraint<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnConstraint").field("name", &self.name).finish()
    }
}

impl<F> JobConstraint for FnConstraint<F>
where
    F: Fn(&dyn JobStore, &JobRecord) -> Result<Vec<JobId>, JobStoreError> + Send + Sync,
{
    fn test(&self, store: &dyn JobStore, inbound: &JobRecord) -> Result<Vec<JobId>, JobStoreError> {
        (self.predicate)(store, inbound)
    }

    fn describe(&self) -> String {
        format!("custom({})", self.name)
    }
}
