//! Overflow buffer: strict FIFO of submissions waiting for capacity.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// A submission parked until a session slot frees up. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedSubmission {
    pub text: String,
    pub session_id: String,
    /// Correlation id, when the caller supplied one.
    pub job_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedSubmission {
    pub fn new(text: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: session_id.into(),
            job_id: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Unbounded in-memory FIFO. Enqueue at the tail, drain from the head.
#[derive(Debug, Default)]
pub struct OverflowBuffer {
    items: VecDeque<QueuedSubmission>,
}

impl OverflowBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail.
    pub fn enqueue(&mut self, submission: QueuedSubmission) {
        debug!(
            session_id = %submission.session_id,
            position = self.items.len(),
            "Submission buffered"
        );
        self.items.push_back(submission);
    }

    /// The submission that has waited longest, without removing it.
    pub fn peek(&self) -> Option<&QueuedSubmission> {
        self.items.front()
    }

    /// Remove and return the head.
    pub fn dequeue(&mut self) -> Option<QueuedSubmission> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Snapshot of the buffer in drain order.
    pub fn snapshot(&self) -> Vec<QueuedSubmission> {
        self.items.iter().cloned().collect()
    }
}
