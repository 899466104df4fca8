//! `entitle-core`: shared building blocks for the entitlement server.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! strongly-typed identifiers and the error they raise on parse failure.

pub mod error;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use id::{CorrelationId, JobId};
