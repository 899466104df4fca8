//! Thread-affinity session/producer pool publishing job messages.
//!
//! ## Resource model
//!
//! Every dispatching thread gets its own session and producer, created lazily
//! on first use and recreated independently whenever the transport reports
//! them closed. The pairs live in a registry keyed by [`ThreadId`]:
//!
//! ```text
//! registry (one Mutex) ─┬─ ThreadId(3) → SessionStore { session, producer }
//!                       ├─ ThreadId(7) → SessionStore { session, producer }
//!                       └─ abandoned: Receiver<ThreadId>
//! ```
//!
//! Two paths release a pair:
//!
//! - [`JobMessageDispatcher::shutdown`] closes every pair. This is the
//!   authoritative cleanup path.
//! - A thread-local exit guard, registered when a thread first obtains its
//!   store, pushes the thread's id onto the `abandoned` queue as the thread
//!   exits. The next [`JobMessageDispatcher::session_store`] call from any
//!   thread closes and removes those stores before doing anything else.
//!
//! Lock order is always registry, then store.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, ThreadId};

use tracing::{debug, info, warn};

use entitle_messaging::{
    MessageProducer, MessageTransport, OutboundMessage, TransportError, TransportSession,
};

use super::error::{JobError, JobMessageDispatchError};
use super::types::JobMessage;

/// Message property carrying the job key, for broker-side routing.
pub const JOB_KEY_PROPERTY: &str = "job_key";

type ProducerOf<T> = <<T as MessageTransport>::Session as TransportSession>::Producer;

/// A shared handle on one thread's session store.
pub type SharedSessionStore<T> = Arc<Mutex<SessionStore<T>>>;

/// One thread's session and producer.
pub struct SessionStore<T: MessageTransport> {
    session: Option<T::Session>,
    producer: Option<ProducerOf<T>>,
}

impl<T: MessageTransport> SessionStore<T> {
    fn new() -> Self {
        Self {
            session: None,
            producer: None,
        }
    }

    /// True when the store holds a session the transport still considers open.
    pub fn has_open_session(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// True when the store holds a producer the transport still considers open.
    pub fn has_open_producer(&self) -> bool {
        self.producer.as_ref().is_some_and(|p| !p.is_closed())
    }

    fn session(&mut self, transport: &T) -> Result<&mut T::Session, JobMessageDispatchError> {
        if self.session.as_ref().is_none_or(|s| s.is_closed()) {
            // A producer cannot outlive the session that created it.
            if let Some(mut producer) = self.producer.take() {
                if let Err(err) = producer.close() {
                    warn!(error = %err, "failed to close producer of a closed session");
                }
            }
            let session = transport
                .create_session()
                .map_err(JobMessageDispatchError::Session)?;
            self.session = Some(session);
        }

        self.session
            .as_mut()
            .ok_or(JobMessageDispatchError::Session(TransportError::SessionClosed))
    }

    fn producer(&mut self, transport: &T) -> Result<&mut ProducerOf<T>, JobMessageDispatchError> {
        self.session(transport)?;
        let Self { session, producer } = self;

        if producer.as_ref().is_none_or(|p| p.is_closed()) {
            let session = session
                .as_mut()
                .ok_or(JobMessageDispatchError::Session(TransportError::SessionClosed))?;
            let created = session
                .create_producer()
                .map_err(JobMessageDispatchError::Producer)?;
            *producer = Some(created);
        }

        producer
            .as_mut()
            .ok_or(JobMessageDispatchError::Producer(TransportError::ProducerClosed))
    }

    fn open_session(&mut self) -> Option<&mut T::Session> {
        self.session.as_mut().filter(|s| !s.is_closed())
    }

    /// Close producer then session. Both calls are attempted; the first failure wins.
    fn close(&mut self) -> Result<(), TransportError> {
        let producer = match self.producer.take() {
            Some(mut producer) => producer.close(),
            None => Ok(()),
        };
        let session = match self.session.take() {
            Some(mut session) => session.close(),
            None => Ok(()),
        };
        producer.and(session)
    }
}

impl<T: MessageTransport> std::fmt::Debug for SessionStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("open_session", &self.has_open_session())
            .field("open_producer", &self.has_open_producer())
            .finish()
    }
}

struct Registry<T: MessageTransport> {
    stores: HashMap<ThreadId, SharedSessionStore<T>>,
    abandoned: mpsc::Receiver<ThreadId>,
}

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Reports its thread to a dispatcher's abandoned queue when the thread exits.
struct ThreadExitGuard {
    dispatcher_id: u64,
    thread_id: ThreadId,
    notify: mpsc::Sender<ThreadId>,
}

impl Drop for ThreadExitGuard {
    fn drop(&mut self) {
        // Fails only if the dispatcher is already gone, and its stores with it.
        let _ = self.notify.send(self.thread_id);
    }
}

thread_local! {
    static EXIT_GUARDS: RefCell<Vec<ThreadExitGuard>> = const { RefCell::new(Vec::new()) };
}

fn register_exit_guard(dispatcher_id: u64, notify: &mpsc::Sender<ThreadId>) {
    let thread_id = thread::current().id();
    let registered = EXIT_GUARDS.try_with(|guards| {
        let mut guards = guards.borrow_mut();
        if !guards.iter().any(|g| g.dispatcher_id == dispatcher_id) {
            guards.push(ThreadExitGuard {
                dispatcher_id,
                thread_id,
                notify: notify.clone(),
            });
        }
    });

    if registered.is_err() {
        debug!(?thread_id, "thread is exiting; store will be released at shutdown");
    }
}

/// Publishes job messages to a single destination address.
///
/// All operations block and may perform network I/O; callers dispatch from a
/// thread pool sized for their expected concurrency.
pub struct JobMessageDispatcher<T: MessageTransport> {
    id: u64,
    transport: T,
    address: String,
    registry: Mutex<Registry<T>>,
    abandon_tx: mpsc::Sender<ThreadId>,
}

impl<T: MessageTransport> JobMessageDispatcher<T> {
    /// Create a dispatcher for `address`.
    ///
    /// An empty address is a fatal configuration error, reported here rather
    /// than on first use.
    pub fn new(transport: T, address: impl Into<String>) -> Result<Self, JobMessageDispatchError> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(JobMessageDispatchError::MissingAddress);
        }

        let (abandon_tx, abandoned) = mpsc::channel();
        Ok(Self {
            id: NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            address,
            registry: Mutex::new(Registry {
                stores: HashMap::new(),
                abandoned,
            }),
            abandon_tx,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Number of threads currently holding a session store.
    pub fn tracked_threads(&self) -> usize {
        self.lock_registry().stores.len()
    }

    /// Queue `thread_id`'s store for reclamation on the next `session_store` call.
    pub fn mark_abandoned(&self, thread_id: ThreadId) {
        // The receiving end lives in `self.registry`, so this cannot fail.
        let _ = self.abandon_tx.send(thread_id);
    }

    /// The current thread's store, created on first use.
    ///
    /// Stores left behind by exited threads are closed and dropped first.
    pub fn session_store(&self) -> SharedSessionStore<T> {
        let mut registry = self.lock_registry();
        Self::reclaim_abandoned(&mut registry);

        let thread_id = thread::current().id();
        if let Some(store) = registry.stores.get(&thread_id) {
            return store.clone();
        }

        let store = Arc::new(Mutex::new(SessionStore::new()));
        registry.stores.insert(thread_id, store.clone());
        register_exit_guard(self.id, &self.abandon_tx);
        debug!(?thread_id, tracked = registry.stores.len(), "created session store");
        store
    }

    /// Publish `message` in the current thread's transaction.
    ///
    /// The message is durable and carries the job key as the `job_key`
    /// property. It becomes visible to workers on [`commit`](Self::commit).
    pub fn post_job_message(&self, message: &JobMessage) -> Result<(), JobMessageDispatchError> {
        let store = self.session_store();
        let mut store = lock_store(&store);
        let producer = store.producer(&self.transport)?;

        let body = serde_json::to_string(message).map_err(|source| {
            JobMessageDispatchError::Serialization {
                job_key: message.job_key().to_string(),
                source,
            }
        })?;
        let mut outbound = OutboundMessage::new(body);
        outbound.set_durable(true);
        outbound.set_property(JOB_KEY_PROPERTY, message.job_key());

        producer
            .send(&self.address, outbound)
            .map_err(|source| JobMessageDispatchError::Send {
                job_key: message.job_key().to_string(),
                source,
            })?;

        debug!(
            job_id = %message.job_id(),
            job_key = message.job_key(),
            address = %self.address,
            "posted job message"
        );
        Ok(())
    }

    /// Commit the current thread's transaction. A thread with no open session has nothing to commit.
    pub fn commit(&self) -> Result<(), JobMessageDispatchError> {
        let store = self.session_store();
        let mut store = lock_store(&store);
        match store.open_session() {
            Some(session) => session.commit().map_err(JobMessageDispatchError::Commit),
            None => Ok(()),
        }
    }

    /// Roll back the current thread's transaction.
    pub fn rollback(&self) -> Result<(), JobMessageDispatchError> {
        let store = self.session_store();
        let mut store = lock_store(&store);
        match store.open_session() {
            Some(session) => session.rollback().map_err(JobMessageDispatchError::Rollback),
            None => Ok(()),
        }
    }

    /// Close every tracked session and producer, across all threads, and clear the registry.
    ///
    /// Every store is attempted even if some fail to close. Safe to call repeatedly.
    pub fn shutdown(&self) -> Result<(), JobError> {
        let mut registry = self.lock_registry();
        // Pending exit notices refer to stores about to be closed anyway.
        while registry.abandoned.try_recv().is_ok() {}
        let stores: Vec<_> = registry.stores.drain().collect();

        let closed = stores.len();
        let mut failures = 0;
        let mut first_error = None;
        for (thread_id, store) in stores {
            if let Err(err) = lock_store(&store).close() {
                warn!(?thread_id, error = %err, "failed to close session store");
                failures += 1;
                first_error.get_or_insert(err);
            }
        }

        info!(closed, failures, address = %self.address, "job message dispatcher shut down");
        match first_error {
            Some(source) => Err(JobError::Shutdown { failures, source }),
            None => Ok(()),
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reclaim_abandoned(registry: &mut Registry<T>) {
        while let Ok(thread_id) = registry.abandoned.try_recv() {
            let Some(store) = registry.stores.remove(&thread_id) else {
                continue;
            };
            match lock_store(&store).close() {
                Ok(()) => debug!(?thread_id, "reclaimed session store of exited thread"),
                Err(err) => {
                    warn!(?thread_id, error = %err, "failed to close abandoned session store")
                }
            }
        }
    }
}

impl<T: MessageTransport> std::fmt::Debug for JobMessageDispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobMessageDispatcher")
            .field("address", &self.address)
            .field("tracked_threads", &self.tracked_threads())
            .finish()
    }
}

fn lock_store<T: MessageTransport>(store: &SharedSessionStore<T>) -> MutexGuard<'_, SessionStore<T>> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    use entitle_core::{CorrelationId, JobId};
    use entitle_messaging::InMemoryBroker;

    const ADDRESS: &str = "job.dispatch";

    fn dispatcher() -> (InMemoryBroker, JobMessageDispatcher<InMemoryBroker>) {
        let broker = InMemoryBroker::new();
        let dispatcher = JobMessageDispatcher::new(broker.clone(), ADDRESS).unwrap();
        (broker, dispatcher)
    }

    fn message(key: &str) -> JobMessage {
        JobMessage::new(JobId::new(), key, CorrelationId::new())
    }

    #[test]
    fn empty_address_is_rejected_at_construction() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            JobMessageDispatcher::new(broker.clone(), ""),
            Err(JobMessageDispatchError::MissingAddress)
        ));
        assert!(matches!(
            JobMessageDispatcher::new(broker, "   "),
            Err(JobMessageDispatchError::MissingAddress)
        ));
    }

    #[test]
    fn same_thread_posts_reuse_one_session_and_producer() {
        let (broker, dispatcher) = dispatcher();

        dispatcher.post_job_message(&message("refresh_pools")).unwrap();
        dispatcher.post_job_message(&message("refresh_pools")).unwrap();

        let stats = broker.stats();
        assert_eq!(stats.sessions_created, 1);
        assert_eq!(stats.producers_created, 1);
        assert_eq!(stats.messages_sent, 2);
    }

    #[test]
    fn committed_message_is_durable_and_carries_job_key() {
        let (broker, dispatcher) = dispatcher();
        let sub = broker.subscribe(ADDRESS);
        let sent = message("refresh_pools");

        dispatcher.post_job_message(&sent).unwrap();
        assert!(sub.try_recv().is_err());
        dispatcher.commit().unwrap();

        let delivery = sub.try_recv().unwrap();
        assert_eq!(delivery.address(), ADDRESS);
        assert!(delivery.message().is_durable());
        assert_eq!(delivery.message().property(JOB_KEY_PROPERTY), Some("refresh_pools"));

        let decoded: JobMessage = serde_json::from_str(delivery.message().body()).unwrap();
        assert_eq!(decoded, sent);
    }

    #[test]
    fn rollback_discards_posted_messages() {
        let (broker, dispatcher) = dispatcher();
        let sub = broker.subscribe(ADDRESS);

        dispatcher.post_job_message(&message("refresh_pools")).unwrap();
        dispatcher.rollback().unwrap();
        dispatcher.commit().unwrap();

        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn commit_without_a_session_does_not_connect() {
        let (broker, dispatcher) = dispatcher();
        dispatcher.commit().unwrap();
        assert_eq!(broker.stats().sessions_created, 0);
    }

    #[test]
    fn transport_failures_are_wrapped() {
        let (broker, dispatcher) = dispatcher();

        broker.refuse_sessions(true);
        assert!(matches!(
            dispatcher.post_job_message(&message("k")),
            Err(JobMessageDispatchError::Session(_))
        ));

        broker.refuse_sessions(false);
        broker.refuse_sends(true);
        match dispatcher.post_job_message(&message("k")) {
            Err(JobMessageDispatchError::Send { job_key, .. }) => assert_eq!(job_key, "k"),
            other => panic!("expected send failure, got {other:?}"),
        }
    }

    #[test]
    fn closed_session_is_recreated_with_a_fresh_producer() {
        let (broker, dispatcher) = dispatcher();
        dispatcher.post_job_message(&message("k")).unwrap();

        let store = dispatcher.session_store();
        lock_store(&store).close().unwrap();
        assert!(!lock_store(&store).has_open_session());

        dispatcher.post_job_message(&message("k")).unwrap();
        let stats = broker.stats();
        assert_eq!(stats.sessions_created, 2);
        assert_eq!(stats.producers_created, 2);
    }

    #[test]
    fn shutdown_closes_every_thread_and_clears_registry() {
        let (broker, dispatcher) = dispatcher();
        let dispatcher = Arc::new(dispatcher);
        let posted = Arc::new(Barrier::new(3));
        let released = Arc::new(Barrier::new(3));

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let posted = posted.clone();
                let released = released.clone();
                thread::spawn(move || {
                    dispatcher.post_job_message(&message("k")).unwrap();
                    posted.wait();
                    // Stay alive until the main thread has shut down.
                    released.wait();
                })
            })
            .collect();

        posted.wait();
        assert_eq!(dispatcher.tracked_threads(), 2);

        dispatcher.shutdown().unwrap();
        assert_eq!(dispatcher.tracked_threads(), 0);
        assert_eq!(broker.stats().sessions_closed, 2);
        assert_eq!(broker.stats().producers_closed, 2);

        released.wait();
        for worker in workers {
            worker.join().unwrap();
        }

        // A later store starts empty instead of reusing a closed session.
        let store = dispatcher.session_store();
        assert!(!lock_store(&store).has_open_session());
        dispatcher.post_job_message(&message("k")).unwrap();
        assert_eq!(broker.stats().sessions_created, 3);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (broker, dispatcher) = dispatcher();
        dispatcher.post_job_message(&message("k")).unwrap();

        dispatcher.shutdown().unwrap();
        dispatcher.shutdown().unwrap();
        assert_eq!(broker.stats().sessions_closed, 1);
    }

    #[test]
    fn exited_thread_store_is_reclaimed_on_next_lookup() {
        let (broker, dispatcher) = dispatcher();
        let dispatcher = Arc::new(dispatcher);

        let worker = {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || dispatcher.post_job_message(&message("k")).unwrap())
        };
        worker.join().unwrap();

        // Exit noticed but not yet acted on.
        assert_eq!(dispatcher.tracked_threads(), 1);
        assert_eq!(broker.stats().sessions_closed, 0);

        dispatcher.session_store();
        assert_eq!(broker.stats().sessions_closed, 1);
        assert_eq!(dispatcher.tracked_threads(), 1);
    }

    #[test]
    fn manually_abandoned_store_is_closed_before_lookup_proceeds() {
        let (broker, dispatcher) = dispatcher();
        dispatcher.post_job_message(&message("k")).unwrap();

        dispatcher.mark_abandoned(thread::current().id());
        let store = dispatcher.session_store();

        assert_eq!(broker.stats().sessions_closed, 1);
        assert!(!lock_store(&store).has_open_session());
    }
}
