//! Asynchronous job subsystem.
//!
//! ## Flow
//!
//! ```text
//! JobConfig ──queue_job──▶ JobManager ──constraints──▶ QUEUED / WAITING / ABORTED
//!                              │
//!                              ▼ post + commit
//!                   JobMessageDispatcher ──▶ transport ──▶ JobWorker ──▶ execute_job
//! ```
//!
//! ## Components
//!
//! - `JobConfig` / `ConfigureJob`: fluent, validated job description
//! - `JobArguments`: JSON-encoded named arguments with typed accessors
//! - `JobConstraint`: admission checks against the job store
//! - `JobManager`: manager lifecycle, admission, dispatch and retry policy
//! - `JobMessageDispatcher`: per-thread session/producer pool for publishing
//! - `JobWorker`: background consumer that runs dispatched jobs
//! - `JobStore`: persistence for job records (in-memory or durable)

pub mod arguments;
pub mod config;
pub mod constraints;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod principal;
pub mod state;
pub mod store;
pub mod types;
pub mod worker;

pub use arguments::JobArguments;
pub use config::{ConfigureJob, JobConfig, OWNER_KEY_ARGUMENT, OwnerJobConfig};
pub use constraints::{JobConstraint, JobConstraints};
pub use context::JobExecutionContext;
pub use dispatcher::{JOB_KEY_PROPERTY, JobMessageDispatcher, SessionStore, SharedSessionStore};
pub use error::{
    ArgumentConversionError, Disposition, InvalidArgumentError, JobConfigValidationError, JobError,
    JobManagerError, JobMessageDispatchError, StateManagementError,
};
pub use manager::{AsyncJob, JobManager};
pub use principal::{FixedPrincipal, PrincipalProvider, SYSTEM_PRINCIPAL};
pub use state::ManagerState;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{JobMessage, JobQuery, JobRecord, JobState};
pub use worker::{JobWorker, JobWorkerConfig, WorkerHandle};
