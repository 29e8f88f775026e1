//! Delivery sink: hands serialized events to live client sessions.
//!
//! Publishers enqueue `(message, destination)` pairs into a ring and return
//! immediately. A single writer thread drains the ring, checks that the
//! destination session is still open right before writing, and drops the
//! message silently when it is not. A slow or dead session never blocks
//! publishers beyond ring backpressure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bus::{BusError, SessionSink};
use crate::ring::{ProducerMode, RingBuffer, RingConfig, RingError, WorkHandler, WorkerPool};

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("session '{0}' is closed")]
    SessionClosed(String),

    #[error("delivery ring unavailable: {0}")]
    Ring(#[from] RingError),
}

pub type Result<T> = std::result::Result<T, DeliveryError>;

// ============================================================================
// Session registry
// ============================================================================

/// Live client sessions keyed by destination.
pub trait SessionRegistry: Send + Sync {
    fn is_open(&self, destination: &str) -> bool;

    fn push(&self, destination: &str, message: String) -> Result<()>;
}

/// Sessions backed by in-process channels.
///
/// The receiving half stands in for a connection; dropping it closes the
/// session.
#[derive(Default)]
pub struct LocalSessions {
    sessions: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl LocalSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens (or reopens) a session and returns its message stream.
    pub fn open(&self, destination: impl Into<String>) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.write().insert(destination.into(), tx);
        rx
    }

    pub fn close(&self, destination: &str) {
        self.sessions.write().remove(destination);
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl SessionRegistry for LocalSessions {
    fn is_open(&self, destination: &str) -> bool {
        self.sessions
            .read()
            .get(destination)
            .is_some_and(|tx| !tx.is_closed())
    }

    fn push(&self, destination: &str, message: String) -> Result<()> {
        let sessions = self.sessions.read();
        let tx = sessions
            .get(destination)
            .ok_or_else(|| DeliveryError::SessionClosed(destination.to_string()))?;
        tx.send(message)
            .map_err(|_| DeliveryError::SessionClosed(destination.to_string()))
    }
}

// ============================================================================
// Sink
// ============================================================================

/// Counters for what the writer did with each message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

struct Outbound {
    message: String,
    destination: String,
}

struct SessionWriter {
    registry: Arc<dyn SessionRegistry>,
    counters: Arc<Counters>,
}

impl WorkHandler<Outbound> for SessionWriter {
    fn on_event(&mut self, outbound: Outbound) {
        if !self.registry.is_open(&outbound.destination) {
            debug!(destination = %outbound.destination, "Session closed, dropping message");
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.registry.push(&outbound.destination, outbound.message) {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!(destination = %outbound.destination, error = %e, "Session push failed, dropping message");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

pub struct DeliverySink {
    writer: WorkerPool<Outbound>,
    counters: Arc<Counters>,
}

impl DeliverySink {
    pub fn start(registry: Arc<dyn SessionRegistry>, ring: &RingConfig) -> Result<Self> {
        let counters = Arc::new(Counters::default());
        let ring = Arc::new(RingBuffer::from_config(ring, ProducerMode::Multi)?);
        let writer = SessionWriter {
            registry,
            counters: Arc::clone(&counters),
        };
        let writer = WorkerPool::start("delivery-sink", ring, [writer])?;
        info!("Delivery sink started");
        Ok(Self { writer, counters })
    }

    /// Queues `message` for `destination`.
    pub fn deliver(&self, message: impl Into<String>, destination: impl Into<String>) -> Result<()> {
        self.writer.ring().publish(Outbound {
            message: message.into(),
            destination: destination.into(),
        })?;
        Ok(())
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Writes out everything queued, then stops the writer.
    pub fn shutdown(&self) {
        self.writer.shutdown();
    }
}

impl SessionSink for DeliverySink {
    fn deliver(&self, message: String, destination: &str) -> std::result::Result<(), BusError> {
        DeliverySink::deliver(self, message, destination)
            .map_err(|e| BusError::Delivery(e.to_string()))
    }
}
