//! `entitle-messaging`: message transport abstraction (mechanics only).
//!
//! The job subsystem hands work to remote workers over a message bus. This
//! crate describes that bus as three small traits (transport → session →
//! producer) and ships a transactional in-memory broker for tests/dev.
//! Infrastructure-backed transports live in `entitle-infra`.

pub mod in_memory;
pub mod message;
pub mod subscription;
pub mod transport;

pub use in_memory::{BrokerStats, InMemoryBroker, InMemoryProducer, InMemorySession};
pub use message::{Delivery, OutboundMessage};
pub use subscription::Subscription;
pub use transport::{MessageProducer, MessageTransport, TransportError, TransportSession};
