//! Broker connection manager: one live session, reconnect with bounded backoff.
//!
//! `BrokerConnection` owns exactly one session at a time. Sessions report loss
//! through link events; a supervisor task turns a loss observed while
//! `Connected` into a reconnect chain:
//!
//! - first attempt immediately, then `base * 2^(n-1)` after the n-th failure
//! - at most `max_attempts` attempts, then `Failed` (terminal for the chain)
//! - only one chain at a time; concurrent triggers are coalesced
//!
//! Registered consumers are re-attached on every new session before the state
//! flips to `Connected`, so publishers never observe `Connected` mid-reconnect.
//! A loss reported while a chain is establishing the session waits for that
//! chain and is judged against the session it produced.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::state::ConnectionState;
use super::transport::{BrokerSession, BrokerTransport, DeliveryStream, LinkEvent, LinkEvents};
use crate::config::ReconnectPolicy;
use crate::error::BrokerError;

/// Receives every message consumed from a queue. Invoked fire-and-forget.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, body: Vec<u8>);
}

/// Outcome of a call to [`BrokerConnection::reconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// This call ran the chain and a session is live again.
    Restored,
    /// Another chain was already running; this trigger was coalesced.
    AlreadyInProgress,
}

struct Consumer {
    id: u64,
    queue: String,
    handler: Arc<dyn DeliveryHandler>,
    /// Session generation this consumer is attached to (0: none).
    attached: u64,
}

type EventRx = mpsc::UnboundedReceiver<(u64, LinkEvent)>;

/// The single logical connection to the message broker.
pub struct BrokerConnection {
    transport: Arc<dyn BrokerTransport>,
    /// Queues declared on every new session.
    queues: Vec<String>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    /// Live session and the generation it was opened under.
    session: RwLock<Option<(u64, Arc<dyn BrokerSession>)>>,
    /// Bumped for every session attempt and on close; older link events are stale.
    generation: AtomicU64,
    /// Held by whoever runs a connect chain.
    chain: AsyncMutex<()>,
    closed: AtomicBool,
    consumers: Mutex<Vec<Consumer>>,
    next_consumer_id: AtomicU64,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    events_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    events_rx: Mutex<Option<EventRx>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BrokerConnection {
    /// Create a disconnected connection. Nothing happens until [`initialize`](Self::initialize).
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        queues: Vec<String>,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            transport,
            queues,
            policy,
            state,
            session: RwLock::new(None),
            generation: AtomicU64::new(0),
            chain: AsyncMutex::new(()),
            closed: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
            next_consumer_id: AtomicU64::new(1),
            pumps: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            supervisor: Mutex::new(None),
        })
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to state changes (the operator surface for `Failed`).
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connect, open a channel and declare queues.
    ///
    /// Uses the same bounded retry chain as a reconnect. Returns
    /// `ReconnectExhausted` and leaves the state `Failed` when the budget runs out.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), BrokerError> {
        if self.state() == ConnectionState::Connected {
            debug!("Broker connection already initialized");
            return Ok(());
        }
        let Ok(_chain) = self.chain.try_lock() else {
            return Err(BrokerError::ChannelUnavailable {
                state: self.state(),
            });
        };

        self.closed.store(false, Ordering::SeqCst);
        self.start_supervisor();
        self.transition(ConnectionState::Connecting);
        info!(
            transport = self.transport.name(),
            queues = ?self.queues,
            "Connecting to broker"
        );
        self.run_chain().await
    }

    /// Re-establish the session after a loss.
    ///
    /// Coalesces with a chain that is already running.
    pub async fn reconnect(&self) -> Result<ReconnectOutcome, BrokerError> {
        let Ok(_chain) = self.chain.try_lock() else {
            debug!("Reconnect already in progress, coalescing");
            return Ok(ReconnectOutcome::AlreadyInProgress);
        };
        self.reconnect_locked().await
    }

    /// Reconnect body. The caller holds `self.chain`.
    async fn reconnect_locked(&self) -> Result<ReconnectOutcome, BrokerError> {
        let state = self.state();
        if self.closed.load(Ordering::SeqCst) || state == ConnectionState::Disconnected {
            return Err(BrokerError::ChannelUnavailable { state });
        }

        // Flip state before dropping the session so nobody sees Connected without one
        self.transition(ConnectionState::Reconnecting);
        self.teardown_session().await;

        warn!(
            max_attempts = self.policy.max_attempts,
            "Broker connection lost, starting reconnect chain"
        );
        self.run_chain().await.map(|()| ReconnectOutcome::Restored)
    }

    /// Publish a JSON-serialized message to `queue`.
    ///
    /// Fails fast with `ChannelUnavailable` unless the state is `Connected`.
    /// A failure that leaves the session dead is reported as a link loss.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        message: &T,
    ) -> Result<(), BrokerError> {
        let (generation, session) = self.live_session()?;
        let body = serde_json::to_vec(message)?;
        if let Err(e) = session.publish(queue, &body).await {
            if !session.is_open() {
                warn!(generation, error = %e, "Publish failed on a dead session");
                self.report_loss(generation, LinkEvent::Error {
                    reason: e.to_string(),
                });
            }
            return Err(e);
        }
        debug!(queue = %queue, bytes = body.len(), "Message published");
        Ok(())
    }

    /// Register `handler` for every message delivered on `queue`.
    ///
    /// Attaches immediately when connected, otherwise as soon as a session is
    /// up, and again on every reconnect. A failed attach unregisters the handler.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), BrokerError> {
        let id = self.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.consumers).push(Consumer {
            id,
            queue: queue.to_string(),
            handler,
            attached: 0,
        });

        if let Ok((generation, session)) = self.live_session() {
            if let Err(e) = self.attach_consumers(generation, &session, Some(id)).await {
                lock(&self.consumers).retain(|c| c.id != id);
                return Err(e);
            }
        }
        info!(queue = %queue, "Consumer registered");
        Ok(())
    }

    /// Release the connection. Idempotent.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);

        self.abort_pumps();

        let previous = self.state.send_replace(ConnectionState::Disconnected);
        let session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match session {
            Some((_, session)) => {
                session.close().await?;
                info!(previous = %previous, "Broker connection closed");
            }
            None => debug!(previous = %previous, "Broker connection already closed"),
        }
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────

    fn transition(&self, target: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == target {
                return false;
            }
            if !current.can_transition_to(target) {
                warn!(from = %current, to = %target, "Ignoring illegal broker state transition");
                return false;
            }
            debug!(from = %current, to = %target, "Broker state transition");
            *current = target;
            true
        })
    }

    fn live_session(&self) -> Result<(u64, Arc<dyn BrokerSession>), BrokerError> {
        let session = self
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let state = self.state();
        match session {
            Some(live) if state.accepts_publish() => Ok(live),
            _ => Err(BrokerError::ChannelUnavailable { state }),
        }
    }

    /// Attempt to establish a session until it works or the budget is spent.
    async fn run_chain(&self) -> Result<(), BrokerError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::ChannelUnavailable {
                    state: self.state(),
                });
            }

            match self.establish().await {
                Ok((generation, session)) => {
                    if self.closed.load(Ordering::SeqCst) {
                        let _ = session.close().await;
                        return Err(BrokerError::ChannelUnavailable {
                            state: self.state(),
                        });
                    }
                    *self.session.write().unwrap_or_else(PoisonError::into_inner) =
                        Some((generation, Arc::clone(&session)));
                    self.transition(ConnectionState::Connected);
                    info!(attempt, generation, "Broker connection established");

                    // Consumers registered while the session was being prepared
                    if let Err(e) = self.attach_consumers(generation, &session, None).await {
                        warn!(generation, error = %e, "Failed to attach late consumer");
                        self.report_loss(generation, LinkEvent::Error {
                            reason: e.to_string(),
                        });
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, max_attempts, error = %e, "Broker connect attempt failed");
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        let delay = self.policy.delay_after(attempt);
                        info!(
                            delay_ms = delay.as_millis() as u64,
                            "Retrying broker connection"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.transition(ConnectionState::Failed);
        error!(
            attempts = max_attempts,
            last_error = %last_error,
            "Failed to reconnect after maximum retries"
        );
        Err(BrokerError::ReconnectExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Open a session, declare queues and re-attach consumers.
    async fn establish(&self) -> Result<(u64, Arc<dyn BrokerSession>), BrokerError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let events = LinkEvents::new(generation, self.events_tx.clone());
        let session = self.transport.connect(events).await?;

        if let Err(e) = self.prepare_session(generation, &session).await {
            self.abort_pumps();
            if let Err(close_err) = session.close().await {
                debug!(error = %close_err, "Failed to close half-open session");
            }
            return Err(e);
        }
        Ok((generation, session))
    }

    async fn prepare_session(
        &self,
        generation: u64,
        session: &Arc<dyn BrokerSession>,
    ) -> Result<(), BrokerError> {
        for queue in &self.queues {
            session.declare_queue(queue).await?;
        }
        self.attach_consumers(generation, session, None).await
    }

    /// Attach every consumer not yet on `generation` (or only consumer `only`).
    ///
    /// Consumers are claimed under the lock, so each attaches once per session.
    async fn attach_consumers(
        &self,
        generation: u64,
        session: &Arc<dyn BrokerSession>,
        only: Option<u64>,
    ) -> Result<(), BrokerError> {
        let claimed: Vec<(String, Arc<dyn DeliveryHandler>)> = lock(&self.consumers)
            .iter_mut()
            .filter(|c| c.attached != generation && only.is_none_or(|id| c.id == id))
            .map(|c| {
                c.attached = generation;
                (c.queue.clone(), Arc::clone(&c.handler))
            })
            .collect();

        for (queue, handler) in claimed {
            let stream = session.consume(&queue).await?;
            self.spawn_pump(generation, queue, stream, handler);
        }
        Ok(())
    }

    fn report_loss(&self, generation: u64, event: LinkEvent) {
        let _ = self.events_tx.send((generation, event));
    }

    /// Forward deliveries to the handler; a finished stream counts as a lost link.
    fn spawn_pump(
        &self,
        generation: u64,
        queue: String,
        mut stream: DeliveryStream,
        handler: Arc<dyn DeliveryHandler>,
    ) {
        let events = LinkEvents::new(generation, self.events_tx.clone());
        let handle = tokio::spawn(async move {
            while let Some(delivery) = stream.next().await {
                match delivery {
                    Ok(body) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move { handler.handle(body).await });
                    }
                    Err(e) => warn!(queue = %queue, error = %e, "Delivery error"),
                }
            }
            debug!(queue = %queue, generation, "Consumer stream ended");
            events.closed(format!("consumer on {queue} ended"));
        });

        let mut pumps = lock(&self.pumps);
        pumps.retain(|h| !h.is_finished());
        pumps.push(handle);
    }

    fn abort_pumps(&self) {
        for handle in lock(&self.pumps).drain(..) {
            handle.abort();
        }
    }

    async fn teardown_session(&self) {
        self.abort_pumps();
        let old = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((_, old)) = old {
            if let Err(e) = old.close().await {
                debug!(error = %e, "Failed to close lost session");
            }
        }
    }

    fn start_supervisor(self: &Arc<Self>) {
        let Some(mut events_rx) = lock(&self.events_rx).take() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            while let Some((generation, event)) = events_rx.recv().await {
                let Some(connection) = weak.upgrade() else {
                    break;
                };
                connection.handle_link_event(generation, event).await;
            }
        });
        *lock(&self.supervisor) = Some(handle);
    }

    async fn handle_link_event(&self, generation: u64, event: LinkEvent) {
        let current = self.generation.load(Ordering::SeqCst);
        if generation != current {
            debug!(generation, current, reason = event.reason(), "Ignoring stale link event");
            return;
        }

        // The session may still be in setup; let that chain finish first
        let _chain = self.chain.lock().await;
        let current = self.generation.load(Ordering::SeqCst);
        if generation != current {
            debug!(generation, current, reason = event.reason(), "Link event superseded");
            return;
        }
        if self.state() != ConnectionState::Connected {
            debug!(state = %self.state(), reason = event.reason(), "Link event outside Connected");
            return;
        }

        match &event {
            LinkEvent::Closed { reason } => warn!(reason = %reason, "Broker link closed"),
            LinkEvent::Error { reason } => error!(reason = %reason, "Broker link error"),
        }

        match self.reconnect_locked().await {
            Ok(outcome) => debug!(?outcome, "Reconnect chain finished"),
            Err(e) => error!(error = %e, "Broker connection is down for good"),
        }
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
        self.abort_pumps();
    }
}
