//! Infrastructure-backed message transports.
//!
//! The in-memory broker lives in `entitle-messaging`; transports here talk to
//! real brokers and are feature-gated.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsProducer, RedisStreamsSession, RedisStreamsTransport};
