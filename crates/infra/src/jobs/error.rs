//! Error taxonomy of the job subsystem.
//!
//! - [`StateManagementError`]: control plane, illegal manager lifecycle move
//! - [`JobError`]: job execution, tagged [`Disposition::Terminal`] or
//!   [`Disposition::Retryable`] at the point where it is raised
//! - [`ArgumentConversionError`], [`JobConfigValidationError`],
//!   [`InvalidArgumentError`], [`JobMessageDispatchError`]: narrowly scoped
//!   failures of argument encoding, config validation and dispatch
//! - [`JobManagerError`]: what the manager's public operations return

use serde::{Deserialize, Serialize};
use thiserror::Error;

use entitle_core::JobId;
use entitle_messaging::TransportError;

use super::state::ManagerState;
use super::store::JobStoreError;
use super::types::JobState;

/// Whether retrying a failed job can possibly help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// The job fails permanently, whatever retry budget remains.
    Terminal,
    /// The job may be re-queued while it has retries left.
    Retryable,
}

/// A job argument could not be converted to or from its serialized form.
#[derive(Debug, Error)]
#[error("unable to convert job argument \"{key}\" as {type_name}: {source}")]
pub struct ArgumentConversionError {
    key: String,
    type_name: &'static str,
    #[source]
    source: serde_json::Error,
}

impl ArgumentConversionError {
    pub fn new(key: impl Into<String>, type_name: &'static str, source: serde_json::Error) -> Self {
        Self {
            key: key.into(),
            type_name,
            source,
        }
    }

    /// Name of the offending argument.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Rust type the value was converted from or into.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// A builder input was rejected outright (e.g. an empty job key).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid argument: {0}")]
pub struct InvalidArgumentError(String);

impl InvalidArgumentError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A job configuration failed validation before admission.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("job configuration is invalid: {0}")]
pub struct JobConfigValidationError(String);

impl JobConfigValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// The job manager was asked to make a lifecycle transition its current state forbids.
///
/// The manager's state is left untouched when this is raised.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("invalid job manager state transition: {initial} -> {intended}")]
pub struct StateManagementError {
    initial: ManagerState,
    intended: ManagerState,
}

impl StateManagementError {
    pub fn new(initial: ManagerState, intended: ManagerState) -> Self {
        Self { initial, intended }
    }

    pub fn initial_state(&self) -> ManagerState {
        self.initial
    }

    pub fn intended_state(&self) -> ManagerState {
        self.intended
    }
}

/// Failure raised by job logic or by the runner around it.
#[derive(Debug, Error)]
pub enum JobError {
    /// Raised by job logic.
    #[error("{message}")]
    Execution {
        message: String,
        disposition: Disposition,
    },

    /// Argument payloads never change between attempts, so this is always terminal.
    #[error(transparent)]
    ArgumentConversion(#[from] ArgumentConversionError),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidJobState {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("no job logic registered for key \"{0}\"")]
    UnknownJobKey(String),

    #[error("failed to close {failures} message session(s) on shutdown: {source}")]
    Shutdown {
        failures: usize,
        #[source]
        source: TransportError,
    },
}

impl JobError {
    /// A failure retrying cannot fix.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            disposition: Disposition::Terminal,
        }
    }

    /// A transient failure; the job is re-queued while retries remain.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            disposition: Disposition::Retryable,
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            JobError::Execution { disposition, .. } => *disposition,
            JobError::ArgumentConversion(_)
            | JobError::InvalidJobState { .. }
            | JobError::UnknownJobKey(_)
            | JobError::Shutdown { .. } => Disposition::Terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.disposition() == Disposition::Terminal
    }
}

/// Failure while handing a job message to the transport.
///
/// Whether the scheduling attempt is retried is up to the caller.
#[derive(Debug, Error)]
pub enum JobMessageDispatchError {
    #[error("job message dispatch address is not configured")]
    MissingAddress,

    #[error("unable to create message session: {0}")]
    Session(#[source] TransportError),

    #[error("unable to create message producer: {0}")]
    Producer(#[source] TransportError),

    #[error("unable to serialize job message for \"{job_key}\": {source}")]
    Serialization {
        job_key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unable to send job message for \"{job_key}\": {source}")]
    Send {
        job_key: String,
        #[source]
        source: TransportError,
    },

    #[error("unable to commit job messages: {0}")]
    Commit(#[source] TransportError),

    #[error("unable to roll back job messages: {0}")]
    Rollback(#[source] TransportError),
}

/// Error returned by [`JobManager`](super::manager::JobManager) operations.
#[derive(Debug, Error)]
pub enum JobManagerError {
    #[error(transparent)]
    Validation(#[from] JobConfigValidationError),

    #[error(transparent)]
    State(#[from] StateManagementError),

    #[error(transparent)]
    Dispatch(#[from] JobMessageDispatchError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("job not found: {0}")]
    UnknownJob(JobId),

    #[error("job manager is not accepting jobs while {0}")]
    NotAccepting(ManagerState),

    #[error("job {job_id} cannot be canceled while {state}")]
    NotCancelable { job_id: JobId, state: JobState },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversion_error() -> ArgumentConversionError {
        let source = serde_json::from_str::<i32>("\"nope\"").unwrap_err();
        ArgumentConversionError::new("count", "i32", source)
    }

    #[test]
    fn argument_conversion_is_always_terminal() {
        let err: JobError = conversion_error().into();
        assert!(err.is_terminal());
    }

    #[test]
    fn disposition_is_decided_where_the_error_is_raised() {
        assert!(JobError::terminal("bad owner").is_terminal());
        assert_eq!(
            JobError::retryable("db busy").disposition(),
            Disposition::Retryable
        );
    }

    #[test]
    fn conversion_error_names_key_and_type() {
        let err = conversion_error();
        let msg = err.to_string();
        assert!(msg.contains("\"count\""));
        assert!(msg.contains("i32"));
    }

    #[test]
    fn state_error_exposes_both_states() {
        let err = StateManagementError::new(ManagerState::Shutdown, ManagerState::Running);
        assert_eq!(err.initial_state(), ManagerState::Shutdown);
        assert_eq!(err.intended_state(), ManagerState::Running);
        assert_eq!(
            err.to_string(),
            "invalid job manager state transition: SHUTDOWN -> RUNNING"
        );
    }
}
