use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// A subscription to the messages committed to one address.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = broker.subscribe("jobs");
///
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(delivery) => process(delivery)?,
///         Err(RecvTimeoutError::Timeout) => continue,  // Check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break,  // Broker closed
///     }
/// }
/// ```
///
/// Subscriptions are designed for single-threaded consumption. Messages from a
/// single committed transaction arrive in the order they were sent; there is no
/// ordering guarantee between transactions committed by different sessions.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
