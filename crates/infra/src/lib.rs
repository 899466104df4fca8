//! Infrastructure layer: job management, dispatch and transports.

pub mod jobs;
pub mod settings;
pub mod transport;

pub use settings::{ConfigError, ConflictPolicy, JobSettings};
