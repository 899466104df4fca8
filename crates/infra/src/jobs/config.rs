//! Fluent builders describing a job to schedule.
//!
//! The chaining methods live on the [`ConfigureJob`] trait so specialised
//! builders (see [`OwnerJobConfig`]) keep returning their own type while
//! sharing the base behaviour, and can override individual steps.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use super::arguments::JobArguments;
use super::constraints::JobConstraint;
use super::error::{ArgumentConversionError, InvalidArgumentError, JobConfigValidationError};

/// Argument under which [`OwnerJobConfig`] mirrors the owning organization.
pub const OWNER_KEY_ARGUMENT: &str = "owner_key";

/// Schedulable description of a job.
///
/// Built once per scheduling request and discarded after the job is queued.
#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    key: Option<String>,
    name: Option<String>,
    group: Option<String>,
    owner: Option<String>,
    arguments: BTreeMap<String, String>,
    constraints: Vec<Arc<dyn JobConstraint>>,
    retry_count: u32,
    log_level: Option<String>,
    log_execution_details: bool,
}

impl JobConfig {
    /// A builder without a job key; `validate` fails until one is set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_job(key: impl Into<String>) -> Result<Self, InvalidArgumentError> {
        Self::new().set_job_key(key)
    }

    pub fn job_key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn job_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// `None` means ungrouped.
    pub fn job_group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn context_owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn job_arguments(&self) -> JobArguments {
        JobArguments::new(self.arguments.clone())
    }

    pub fn constraints(&self) -> &[Arc<dyn JobConstraint>] {
        &self.constraints
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn log_level(&self) -> Option<&str> {
        self.log_level.as_deref()
    }

    pub fn logs_execution_details(&self) -> bool {
        self.log_execution_details
    }

    fn insert_serialized<V>(&mut self, name: String, value: &V) -> Result<(), ArgumentConversionError>
    where
        V: Serialize + ?Sized,
    {
        let raw = serde_json::to_string(value)
            .map_err(|e| ArgumentConversionError::new(name.clone(), std::any::type_name::<V>(), e))?;
        self.arguments.insert(name, raw);
        Ok(())
    }
}

/// Chaining operations shared by every job builder.
pub trait ConfigureJob: Sized {
    fn job_config(&self) -> &JobConfig;

    fn job_config_mut(&mut self) -> &mut JobConfig;

    fn set_job_key(mut self, key: impl Into<String>) -> Result<Self, InvalidArgumentError> {
        let key = key.into();
        if key.is_empty() {
            return Err(InvalidArgumentError::new("job key is null or empty"));
        }
        self.job_config_mut().key = Some(key);
        Ok(self)
    }

    fn set_job_name(mut self, name: impl Into<String>) -> Self {
        self.job_config_mut().name = Some(name.into());
        self
    }

    /// An empty group clears any previous one (ungrouped).
    fn set_job_group(mut self, group: impl Into<String>) -> Self {
        let group = group.into();
        self.job_config_mut().group = (!group.is_empty()).then_some(group);
        self
    }

    fn set_context_owner(mut self, owner: impl Into<String>) -> Self {
        self.job_config_mut().owner = Some(owner.into());
        self
    }

    fn set_owner(self, owner: impl Into<String>) -> Self {
        self.set_context_owner(owner)
    }

    fn set_job_argument<V>(mut self, name: impl Into<String>, value: V) -> Result<Self, ArgumentConversionError>
    where
        V: Serialize,
    {
        self.job_config_mut().insert_serialized(name.into(), &value)?;
        Ok(self)
    }

    /// Constraints form a set keyed by their description; re-adding is a no-op.
    fn add_constraint(mut self, constraint: Arc<dyn JobConstraint>) -> Self {
        let constraints = &mut self.job_config_mut().constraints;
        let id = constraint.describe();
        if !constraints.iter().any(|c| c.describe() == id) {
            constraints.push(constraint);
        }
        self
    }

    /// Negative counts are clamped to zero.
    fn set_retry_count(mut self, count: i32) -> Self {
        self.job_config_mut().retry_count = count.max(0).unsigned_abs();
        self
    }

    /// An empty level clears any previously set one.
    fn set_log_level(mut self, level: impl Into<String>) -> Self {
        let level = level.into();
        self.job_config_mut().log_level = (!level.is_empty()).then_some(level);
        self
    }

    fn log_execution_details(mut self, enabled: bool) -> Self {
        self.job_config_mut().log_execution_details = enabled;
        self
    }

    /// Reject configurations that cannot be scheduled.
    ///
    /// The base rule only requires a job key; builders may add stricter checks.
    fn validate(&self) -> Result<(), JobConfigValidationError> {
        match self.job_config().job_key() {
            Some(key) if !key.is_empty() => Ok(()),
            _ => Err(JobConfigValidationError::new("job key is not set")),
        }
    }
}

impl ConfigureJob for JobConfig {
    fn job_config(&self) -> &JobConfig {
        self
    }

    fn job_config_mut(&mut self) -> &mut JobConfig {
        self
    }
}

/// Builder for jobs that always run on behalf of one organization.
///
/// `set_owner` also records the owner key as the `owner_key` argument, and
/// validation refuses a configuration without an owner.
#[derive(Debug, Clone, Default)]
pub struct OwnerJobConfig {
    inner: JobConfig,
}

impl OwnerJobConfig {
    pub fn for_job(key: impl Into<String>) -> Result<Self, InvalidArgumentError> {
        Self::default().set_job_key(key)
    }

    pub fn into_inner(self) -> JobConfig {
        self.inner
    }
}

impl ConfigureJob for OwnerJobConfig {
    fn job_config(&self) -> &JobConfig {
        &self.inner
    }

    fn job_config_mut(&mut self) -> &mut JobConfig {
        &mut self.inner
    }

    fn set_owner(mut self, owner: impl Into<String>) -> Self {
        let owner = owner.into();
        let raw = serde_json::Value::from(owner.as_str()).to_string();
        self.inner.arguments.insert(OWNER_KEY_ARGUMENT.to_string(), raw);
        self.set_context_owner(owner)
    }

    fn validate(&self) -> Result<(), JobConfigValidationError> {
        match self.inner.job_key() {
            Some(key) if !key.is_empty() => {}
            _ => return Err(JobConfigValidationError::new("job key is not set")),
        }
        if self.inner.context_owner().is_none_or(str::is_empty) {
            return Err(JobConfigValidationError::new("owner is not set"));
        }
        Ok(())
    }
}
