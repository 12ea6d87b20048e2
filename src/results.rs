//! Result routing: worker results back to whoever is waiting for them.
//!
//! `ResultRouter` is the consumer handler for the inbound queue. For each
//! record it releases the originating session, records the outcome in the job
//! store and hands the payload to a [`ResultSink`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::broker::{DeliveryHandler, InboundResult};
use crate::dispatch::DispatchCoordinator;
use crate::store::{JobStore, STATUS_COMPLETED};

/// Fields a worker result is expected to carry besides the correlation id.
const EXPECTED_FIELDS: &[&str] = &["cdnLink", "userId"];

/// Receives completed results keyed by correlation id.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn notify(&self, correlation_id: &str, payload: Value);
}

/// One-shot listeners for server-sent events, one per job id.
#[derive(Default)]
pub struct SseResultSink {
    listeners: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl SseResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the result of `job_id`. A second registration replaces the first.
    pub fn register(&self, job_id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|_, tx| !tx.is_closed());
        if listeners.insert(job_id.to_string(), tx).is_some() {
            debug!(job_id = %job_id, "Replaced existing result listener");
        }
        rx
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl ResultSink for SseResultSink {
    async fn notify(&self, correlation_id: &str, payload: Value) {
        let listener = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id);

        match listener {
            Some(tx) => {
                if tx.send(payload).is_err() {
                    debug!(job_id = %correlation_id, "Result listener went away before delivery");
                } else {
                    info!(job_id = %correlation_id, "Result delivered to listener");
                }
            }
            None => debug!(job_id = %correlation_id, "No listener for result"),
        }
    }
}

/// Handles every delivery on the inbound results queue.
pub struct ResultRouter {
    coordinator: Arc<DispatchCoordinator>,
    store: Arc<dyn JobStore>,
    sink: Arc<dyn ResultSink>,
}

impl ResultRouter {
    pub fn new(
        coordinator: Arc<DispatchCoordinator>,
        store: Arc<dyn JobStore>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            coordinator,
            store,
            sink,
        }
    }

    /// Route one parsed result. Records without a correlation id are dropped.
    pub async fn route(&self, result: InboundResult) {
        let Some(job_id) = result.correlation_id.clone() else {
            warn!(payload = %result.payload, "Inbound result has no job id, dropping");
            return;
        };

        let missing: Vec<&str> = EXPECTED_FIELDS
            .iter()
            .copied()
            .filter(|key| result.field(key).is_none())
            .collect();
        if !missing.is_empty() {
            warn!(job_id = %job_id, ?missing, "Inbound result is missing fields");
        }

        match self.coordinator.complete(&job_id) {
            Some(session_id) => debug!(job_id = %job_id, session_id = %session_id, "Result matched"),
            None => debug!(job_id = %job_id, "Result for unknown or already completed job"),
        }

        self.record(&job_id, &result.payload).await;
        self.sink.notify(&job_id, result.payload).await;
    }

    /// Merge the result into the job record. Store failures are logged, not fatal.
    async fn record(&self, job_id: &str, payload: &Value) {
        let mut record = match self.store.get(job_id).await {
            Ok(Some(record)) => record,
            Ok(None) => json!({ "jobID": job_id }),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to load job record");
                json!({ "jobID": job_id })
            }
        };
        if let Some(fields) = record.as_object_mut() {
            fields.insert("status".into(), json!(STATUS_COMPLETED));
            fields.insert("result".into(), payload.clone());
        }

        if let Err(e) = self.store.put(job_id, record).await {
            warn!(job_id = %job_id, error = %e, "Failed to persist job result");
        }
    }
}

#[async_trait]
impl DeliveryHandler for ResultRouter {
    async fn handle(&self, body: Vec<u8>) {
        match InboundResult::from_slice(&body) {
            Ok(result) => self.route(result).await,
            Err(e) => warn!(error = %e, bytes = body.len(), "Unparsable inbound result"),
        }
    }
}
