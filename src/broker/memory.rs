//! In-process broker: a transport with no network behind it.
//!
//! Used when the endpoint is `memory://` (local runs without a broker) and by
//! tests, which can script connect/publish failures, sever live sessions, and
//! inject inbound deliveries.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::transport::{BrokerSession, BrokerTransport, DeliveryStream, LinkEvents};
use crate::error::BrokerError;

#[derive(Default)]
struct QueueState {
    /// Every body ever published or delivered to this queue.
    log: Vec<Vec<u8>>,
    /// Bodies waiting for a consumer.
    backlog: VecDeque<Vec<u8>>,
    consumers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
}

impl QueueState {
    fn push(&mut self, body: Vec<u8>) {
        self.log.push(body.clone());
        self.consumers.retain(|tx| !tx.is_closed());
        match self.consumers.first() {
            Some(tx) => {
                let _ = tx.send(body);
            }
            None => self.backlog.push_back(body),
        }
    }
}

struct LiveSession {
    alive: Arc<AtomicBool>,
    events: LinkEvents,
}

#[derive(Default)]
struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    declared: Mutex<Vec<String>>,
    sessions: Mutex<Vec<LiveSession>>,
    connect_attempts: Mutex<Vec<Instant>>,
    fail_connects: AtomicU32,
    fail_publishes: AtomicU32,
}

/// In-process broker transport. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.broker.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` publishes fail with a transport error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.broker.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Instants of every connect attempt so far, successful or not.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        lock(&self.broker.connect_attempts).clone()
    }

    /// Queues declared by sessions, in declaration order (with repeats).
    pub fn declared_queues(&self) -> Vec<String> {
        lock(&self.broker.declared).clone()
    }

    /// Bodies published or delivered to `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.broker.queues)
            .get(queue)
            .map(|q| q.log.clone())
            .unwrap_or_default()
    }

    /// Bodies on `queue` decoded as JSON.
    pub fn messages_json(&self, queue: &str) -> Vec<serde_json::Value> {
        self.messages(queue)
            .iter()
            .filter_map(|body| serde_json::from_slice(body).ok())
            .collect()
    }

    /// Inject a message as if a worker had published it.
    pub fn deliver(&self, queue: &str, body: impl Into<Vec<u8>>) {
        lock(&self.broker.queues)
            .entry(queue.to_string())
            .or_default()
            .push(body.into());
    }

    /// Kill every live session and report the loss, like a dropped TCP link.
    pub fn sever(&self, reason: &str) {
        let sessions: Vec<LiveSession> = lock(&self.broker.sessions).drain(..).collect();
        for queue in lock(&self.broker.queues).values_mut() {
            queue.consumers.clear();
        }
        for session in sessions {
            session.alive.store(false, Ordering::SeqCst);
            session.events.closed(reason);
        }
        debug!(reason = %reason, "Memory broker severed all sessions");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decrement a failure budget, returning true if this call should fail.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, events: LinkEvents) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        lock(&self.broker.connect_attempts).push(Instant::now());

        if take_failure(&self.broker.fail_connects) {
            return Err(BrokerError::Connect("connection refused".to_string()));
        }

        let alive = Arc::new(AtomicBool::new(true));
        lock(&self.broker.sessions).push(LiveSession {
            alive: Arc::clone(&alive),
            events,
        });

        Ok(Arc::new(MemorySession {
            broker: Arc::clone(&self.broker),
            alive,
        }))
    }
}

struct MemorySession {
    broker: Arc<MemoryBroker>,
    alive: Arc<AtomicBool>,
}

impl MemorySession {
    fn ensure_alive(&self) -> Result<(), String> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("session closed".to_string())
        }
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_alive().map_err(|reason| BrokerError::Declare {
            queue: queue.to_string(),
            reason,
        })?;
        lock(&self.broker.queues).entry(queue.to_string()).or_default();
        lock(&self.broker.declared).push(queue.to_string());
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        let publish_err = |reason: String| BrokerError::Publish {
            queue: queue.to_string(),
            reason,
        };
        self.ensure_alive().map_err(publish_err)?;
        if take_failure(&self.broker.fail_publishes) {
            return Err(publish_err("injected publish failure".to_string()));
        }

        lock(&self.broker.queues)
            .entry(queue.to_string())
            .or_default()
            .push(body.to_vec());
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        self.ensure_alive().map_err(|reason| BrokerError::Consume {
            queue: queue.to_string(),
            reason,
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut queues = lock(&self.broker.queues);
            let state = queues.entry(queue.to_string()).or_default();
            while let Some(body) = state.backlog.pop_front() {
                let _ = tx.send(body);
            }
            state.consumers.push(tx);
        }

        Ok(UnboundedReceiverStream::new(rx).map(Ok).boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
