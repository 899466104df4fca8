//! In-memory transactional broker for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use tracing::debug;

use crate::message::{Delivery, OutboundMessage};
use crate::subscription::Subscription;
use crate::transport::{MessageProducer, MessageTransport, TransportError, TransportSession};

/// Snapshot of the broker's lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub producers_created: u64,
    pub producers_closed: u64,
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sessions_created: AtomicU64,
    sessions_closed: AtomicU64,
    producers_created: AtomicU64,
    producers_closed: AtomicU64,
    messages_sent: AtomicU64,
    messages_delivered: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BrokerStats {
        BrokerStats {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            producers_created: self.producers_created.load(Ordering::Relaxed),
            producers_closed: self.producers_closed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct BrokerInner {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Delivery>>>>,
    counters: Counters,
    refuse_sessions: AtomicBool,
    refuse_sends: AtomicBool,
}

impl BrokerInner {
    fn deliver(&self, deliveries: Vec<Delivery>) -> Result<(), TransportError> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| TransportError::Transaction("subscriber registry poisoned".into()))?;

        for delivery in deliveries {
            if let Some(targets) = subs.get_mut(delivery.address()) {
                // Drop any dead subscribers while delivering.
                targets.retain(|tx| tx.send(delivery.clone()).is_ok());
            }
            Counters::bump(&self.counters.messages_delivered);
        }
        Ok(())
    }
}

/// In-memory message broker.
///
/// - No IO / no async
/// - Sessions are transactional: sends are buffered until `commit`
/// - Committed messages fan out to every live subscriber of the address
///
/// Cloning is cheap; clones share the same broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to everything committed to `address` from now on.
    pub fn subscribe(&self, address: &str) -> Subscription<Delivery> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages.
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.entry(address.to_string()).or_default().push(tx);
        }

        Subscription::new(rx)
    }

    pub fn stats(&self) -> BrokerStats {
        self.inner.counters.snapshot()
    }

    /// Make subsequent `create_session` calls fail (simulates a lost connection).
    pub fn refuse_sessions(&self, refuse: bool) {
        self.inner.refuse_sessions.store(refuse, Ordering::SeqCst);
    }

    /// Make subsequent producer sends fail (simulates a broker-side rejection).
    pub fn refuse_sends(&self, refuse: bool) {
        self.inner.refuse_sends.store(refuse, Ordering::SeqCst);
    }
}

impl MessageTransport for InMemoryBroker {
    type Session = InMemorySession;

    fn create_session(&self) -> Result<Self::Session, TransportError> {
        if self.inner.refuse_sessions.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("broker refused session".into()));
        }

        Counters::bump(&self.inner.counters.sessions_created);
        Ok(InMemorySession {
            broker: self.inner.clone(),
            pending: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Session handed out by [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemorySession {
    broker: Arc<BrokerInner>,
    pending: Arc<Mutex<Vec<Delivery>>>,
    closed: Arc<AtomicBool>,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn take_pending(&self) -> Result<Vec<Delivery>, TransportError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| TransportError::Transaction("pending buffer poisoned".into()))?;
        Ok(std::mem::take(&mut *pending))
    }
}

impl TransportSession for InMemorySession {
    type Producer = InMemoryProducer;

    fn create_producer(&mut self) -> Result<Self::Producer, TransportError> {
        self.ensure_open()?;
        Counters::bump(&self.broker.counters.producers_created);
        Ok(InMemoryProducer {
            broker: self.broker.clone(),
            pending: self.pending.clone(),
            session_closed: self.closed.clone(),
            closed: false,
        })
    }

    fn commit(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let batch = self.take_pending()?;
        debug!(messages = batch.len(), "committing in-memory transaction");
        self.broker.deliver(batch)?;
        Counters::bump(&self.broker.counters.commits);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let discarded = self.take_pending()?;
        debug!(messages = discarded.len(), "rolling back in-memory transaction");
        Counters::bump(&self.broker.counters.rollbacks);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Uncommitted work dies with the session.
        self.take_pending()?;
        Counters::bump(&self.broker.counters.sessions_closed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Producer bound to an [`InMemorySession`].
#[derive(Debug)]
pub struct InMemoryProducer {
    broker: Arc<BrokerInner>,
    pending: Arc<Mutex<Vec<Delivery>>>,
    session_closed: Arc<AtomicBool>,
    closed: bool,
}

impl MessageProducer for InMemoryProducer {
    fn send(&mut self, address: &str, message: OutboundMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ProducerClosed);
        }
        if self.session_closed.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }
        if self.broker.refuse_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send(format!("broker refused message for {address}")));
        }

        self.pending
            .lock()
            .map_err(|_| TransportError::Send("pending buffer poisoned".into()))?
            .push(Delivery::new(address, message));
        Counters::bump(&self.broker.counters.messages_sent);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            Counters::bump(&self.broker.counters.producers_closed);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        // A producer cannot outlive its session.
        self.closed || self.session_closed.load(Ordering::SeqCst)
    }
}
