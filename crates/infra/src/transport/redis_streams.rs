//! Redis Streams-backed job message transport.
//!
//! - **Address**: the stream key a message is appended to
//! - **Transaction**: sends are buffered in the session; commit appends every
//!   buffered message in one `MULTI`/`EXEC` pipeline, so a batch lands whole
//!   or not at all
//! - **Entry fields**: every message property, plus `durable` and `body`
//!
//! Redis persists stream entries regardless of the durable flag; it is kept as
//! a field so consumers can tell what the sender asked for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, instrument};

use entitle_messaging::{
    MessageProducer, MessageTransport, OutboundMessage, TransportError, TransportSession,
};

const DURABLE_FIELD: &str = "durable";
const BODY_FIELD: &str = "body";

type Pending = Arc<Mutex<Vec<(String, OutboundMessage)>>>;

#[derive(Debug, Clone)]
pub struct RedisStreamsTransport {
    client: Arc<redis::Client>,
}

impl RedisStreamsTransport {
    /// Create a transport for `redis_url` (e.g. `redis://localhost:6379`).
    ///
    /// No connection is made until the first session is created.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

impl MessageTransport for RedisStreamsTransport {
    type Session = RedisStreamsSession;

    fn create_session(&self) -> Result<Self::Session, TransportError> {
        let conn = self
            .client
            .get_connection()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        Ok(RedisStreamsSession {
            conn: Some(conn),
            pending: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

pub struct RedisStreamsSession {
    conn: Option<redis::Connection>,
    pending: Pending,
    closed: Arc<AtomicBool>,
}

impl RedisStreamsSession {
    fn take_pending(&self) -> Result<Vec<(String, OutboundMessage)>, TransportError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| TransportError::Transaction("pending buffer poisoned".into()))?;
        Ok(std::mem::take(&mut *pending))
    }

    fn connection(&mut self) -> Result<&mut redis::Connection, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }
        self.conn.as_mut().ok_or(TransportError::SessionClosed)
    }
}

impl std::fmt::Debug for RedisStreamsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsSession")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl TransportSession for RedisStreamsSession {
    type Producer = RedisStreamsProducer;

    fn create_producer(&mut self) -> Result<Self::Producer, TransportError> {
        self.connection()?;
        Ok(RedisStreamsProducer {
            pending: self.pending.clone(),
            session_closed: self.closed.clone(),
            closed: false,
        })
    }

    #[instrument(skip(self), err)]
    fn commit(&mut self) -> Result<(), TransportError> {
        self.connection()?;
        let batch = self.take_pending()?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (stream_key, message) in &batch {
            let cmd = pipe.cmd("XADD").arg(stream_key).arg("*");
            for (name, value) in message.properties() {
                cmd.arg(name).arg(value);
            }
            cmd.arg(DURABLE_FIELD)
                .arg(if message.is_durable() { "1" } else { "0" })
                .arg(BODY_FIELD)
                .arg(message.body())
                .ignore();
        }

        let conn = self.connection()?;
        pipe.query::<()>(conn)
            .map_err(|e| TransportError::Transaction(format!("XADD pipeline failed: {e}")))?;

        debug!(messages = batch.len(), "committed job messages to redis");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), TransportError> {
        self.connection()?;
        let discarded = self.take_pending()?;
        debug!(messages = discarded.len(), "discarded uncommitted job messages");
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.take_pending()?;
        // Dropping the connection closes the socket.
        self.conn = None;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Producer bound to a [`RedisStreamsSession`]; buffers into the session's transaction.
#[derive(Debug)]
pub struct RedisStreamsProducer {
    pending: Pending,
    session_closed: Arc<AtomicBool>,
    closed: bool,
}

impl MessageProducer for RedisStreamsProducer {
    fn send(&mut self, address: &str, message: OutboundMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ProducerClosed);
        }
        if self.session_closed.load(Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }

        self.pending
            .lock()
            .map_err(|_| TransportError::Send("pending buffer poisoned".into()))?
            .push((address.to_string(), message));
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed || self.session_closed.load(Ordering::SeqCst)
    }
}
