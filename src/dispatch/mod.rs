//! Job dispatch: admission, overflow buffering and hand-off to the broker.
//!
//! - `coordinator`: `DispatchCoordinator` (submit, drain step, release)
//! - `drain`: the cancellable periodic drain task

pub mod coordinator;
pub mod drain;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::broker::{BrokerConnection, ConnectionState, OutboundJob};
use crate::error::BrokerError;

pub use coordinator::{DispatchCoordinator, DrainReport};
pub use drain::{DrainTask, spawn_drain_task};

/// Where admitted jobs go. Implemented by the broker; faked in tests.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish_job(&self, job: &OutboundJob) -> Result<(), BrokerError>;

    /// Connection state, for health reporting.
    fn connection_state(&self) -> ConnectionState;
}

/// Publishes jobs to one outbound queue of a [`BrokerConnection`].
pub struct BrokerPublisher {
    connection: Arc<BrokerConnection>,
    queue: String,
}

impl BrokerPublisher {
    pub fn new(connection: Arc<BrokerConnection>, queue: impl Into<String>) -> Self {
        Self {
            connection,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl JobPublisher for BrokerPublisher {
    async fn publish_job(&self, job: &OutboundJob) -> Result<(), BrokerError> {
        self.connection.publish(&self.queue, job).await
    }

    fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }
}

/// A job submission as received from the front door.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub text: String,
    pub session_id: String,
    /// Correlation id threaded through to the worker and back.
    pub job_id: Option<String>,
}

impl JobRequest {
    pub fn new(text: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: session_id.into(),
            job_id: None,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// What happened to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    /// Handed to the broker.
    Submitted,
    /// Parked in the overflow buffer.
    Queued,
}

impl DispatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchStatus::Submitted => "submitted",
            DispatchStatus::Queued => "queued",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            DispatchStatus::Submitted => "Job successfully submitted to the broker.",
            DispatchStatus::Queued => {
                "Job added to the in-memory queue due to max active sessions limit."
            }
        }
    }
}

/// Returned once per submission; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchResult {
    pub status: DispatchStatus,
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl DispatchResult {
    pub fn submitted(correlation_id: Option<String>) -> Self {
        Self {
            status: DispatchStatus::Submitted,
            correlation_id,
        }
    }

    pub fn queued(correlation_id: Option<String>) -> Self {
        Self {
            status: DispatchStatus::Queued,
            correlation_id,
        }
    }
}
