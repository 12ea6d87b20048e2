//! Transport abstraction: the seam between `BrokerConnection` and a concrete broker.
//!
//! A transport produces sessions (one connection + one channel). Sessions
//! report connection loss through [`LinkEvents`]; the owning
//! `BrokerConnection` decides whether that starts a reconnect chain.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::error::BrokerError;

/// Stream of raw message bodies delivered on one queue.
///
/// The stream ending means the underlying channel is gone.
pub type DeliveryStream = BoxStream<'static, Result<Vec<u8>, BrokerError>>;

/// Something went wrong with a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The connection or channel was closed.
    Closed { reason: String },
    /// The connection or channel reported an error.
    Error { reason: String },
}

impl LinkEvent {
    pub fn reason(&self) -> &str {
        match self {
            LinkEvent::Closed { reason } | LinkEvent::Error { reason } => reason,
        }
    }
}

/// Loss reporter handed to a session, tagged with the session's generation.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
}

impl LinkEvents {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, LinkEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report that the session was closed.
    pub fn closed(&self, reason: impl Into<String>) {
        self.emit(LinkEvent::Closed {
            reason: reason.into(),
        });
    }

    /// Report that the session hit an error.
    pub fn error(&self, reason: impl Into<String>) {
        self.emit(LinkEvent::Error {
            reason: reason.into(),
        });
    }

    fn emit(&self, event: LinkEvent) {
        // Receiver gone means the connection itself was dropped
        let _ = self.tx.send((self.generation, event));
    }
}

/// Opens sessions against a broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Human-readable transport name for logs.
    fn name(&self) -> &str;

    /// Open a connection and a channel on it.
    async fn connect(&self, events: LinkEvents) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

/// One live connection + channel pair.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declare (assert) a durable queue.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Publish a body to `queue` through the default exchange.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError>;

    /// Start an auto-acknowledged consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError>;

    /// Close the connection. Closing an already-closed session is not an error.
    async fn close(&self) -> Result<(), BrokerError>;

    /// Whether the connection and channel are both still usable.
    fn is_open(&self) -> bool;
}
