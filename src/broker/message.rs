//! Wire records exchanged with the worker pool.
//!
//! Both directions are JSON objects. Field names follow the workers'
//! convention (`sessionId`, `jobID`) rather than Rust naming.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Job handed to the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundJob {
    pub text: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "jobID", skip_serializing_if = "Option::is_none", default)]
    pub job_id: Option<String>,
}

/// Keys accepted as the correlation id on inbound records, in priority order.
const CORRELATION_KEYS: &[&str] = &["jobID", "jobId", "correlationId"];

/// Result produced by a worker, as consumed from the inbound queue.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundResult {
    /// Correlation id matching the originating submission, if the worker sent one.
    pub correlation_id: Option<String>,
    /// The whole record, forwarded untouched to the result sink.
    pub payload: Value,
}

impl InboundResult {
    /// Parse a raw delivery body.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        let payload: Value = serde_json::from_slice(body)?;
        let correlation_id = CORRELATION_KEYS
            .iter()
            .filter_map(|key| payload.get(*key))
            .filter_map(Value::as_str)
            .find(|id| !id.is_empty())
            .map(str::to_string);

        Ok(Self {
            correlation_id,
            payload,
        })
    }

    /// A string field of the payload, if present.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
