//! Transport/session/producer contracts.
//!
//! The shape follows the classic broker client model:
//!
//! ```text
//! MessageTransport ──create_session──▶ TransportSession ──create_producer──▶ MessageProducer
//!                                          │ commit / rollback                 │ send(address, msg)
//! ```
//!
//! Sessions are transactional: messages sent through a session's producers are
//! only visible to consumers once the session commits. Every call here may
//! block on network I/O; none of them are async.

use std::sync::Arc;

use thiserror::Error;

use crate::message::OutboundMessage;

/// Failure reported by a transport implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("session is closed")]
    SessionClosed,

    #[error("producer is closed")]
    ProducerClosed,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("transaction failed: {0}")]
    Transaction(String),
}

/// Factory for sessions (one connection to the broker).
pub trait MessageTransport: Send + Sync {
    type Session: TransportSession;

    fn create_session(&self) -> Result<Self::Session, TransportError>;
}

/// A transactional, single-threaded conversation with the broker.
pub trait TransportSession: Send {
    type Producer: MessageProducer;

    fn create_producer(&mut self) -> Result<Self::Producer, TransportError>;

    /// Make every message sent since the last commit/rollback visible.
    fn commit(&mut self) -> Result<(), TransportError>;

    /// Discard every message sent since the last commit/rollback.
    fn rollback(&mut self) -> Result<(), TransportError>;

    /// Close the session. Closing an already-closed session is a no-op.
    fn close(&mut self) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;
}

/// Send-capable handle bound to the session that created it.
pub trait MessageProducer: Send {
    fn send(&mut self, address: &str, message: OutboundMessage) -> Result<(), TransportError>;

    /// Close the producer. Closing an already-closed producer is a no-op.
    fn close(&mut self) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;
}

impl<T> MessageTransport for Arc<T>
where
    T: MessageTransport + ?Sized,
{
    type Session = T::Session;

    fn create_session(&self) -> Result<Self::Session, TransportError> {
        (**self).create_session()
    }
}
