//! Client-facing request contract
//!
//! Payloads are opaque JSON bodies; the station only cares about their size
//! and their deadline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::errors::SharedResult;
use crate::types::{wait_duration, RequestId};

/// One inference call forwarded to a worker
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InferenceRequest {
    /// Backend capability to invoke, e.g. `caption` or `query`
    pub function: String,
    pub payload: Value,
    /// Overrides the pool's default timeout when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
}

impl InferenceRequest {
    pub fn new(function: impl Into<String>, payload: Value) -> Self {
        Self {
            function: function.into(),
            payload,
            timeout_seconds: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = Some(timeout.as_secs_f64());
        self
    }

    /// Serialized size of the payload in bytes
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.payload).map(|bytes| bytes.len()).unwrap_or(0)
    }

    /// Requested timeout, ignoring non-positive or out-of-range values
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| wait_duration("timeout_seconds", secs).ok())
    }

    /// Reject a timeout that is non-finite or longer than [`crate::MAX_WAIT`]
    ///
    /// Zero and negative values are allowed and mean "use the pool default".
    pub fn validate(&self) -> SharedResult<()> {
        match self.timeout_seconds {
            Some(secs) if secs > 0.0 || !secs.is_finite() => wait_duration("timeout_seconds", secs).map(|_| ()),
            _ => Ok(()),
        }
    }
}

/// Lifecycle of a request inside the pool
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    Running,
    Completed,
    TimedOut,
    Rejected,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::TimedOut | RequestState::Rejected)
    }
}

/// Terminal result of a request
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RequestOutcome {
    Completed { result: Value },
    TimedOut,
    Rejected { reason: String },
}

impl RequestOutcome {
    pub fn state(&self) -> RequestState {
        match self {
            RequestOutcome::Completed { .. } => RequestState::Completed,
            RequestOutcome::TimedOut => RequestState::TimedOut,
            RequestOutcome::Rejected { .. } => RequestState::Rejected,
        }
    }
}

/// Answer to `submit`
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Admission {
    Accepted { request_id: RequestId },
    Saturated,
}

/// Answer to `poll`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RequestStatus {
    pub request_id: RequestId,
    pub state: RequestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RequestOutcome>,
}

/// Snapshot of pool occupancy and counters
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PoolStats {
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
    pub restarting: usize,
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub accepting: bool,
    pub completed: u64,
    pub timeouts: u64,
    pub rejected: u64,
    pub saturated: u64,
    pub default_timeout: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_size_counts_serialized_bytes() {
        let request = InferenceRequest::new("caption", json!({"image_url": "abc"}));
        assert_eq!(request.payload_size(), r#"{"image_url":"abc"}"#.len());
    }

    #[test]
    fn test_invalid_timeouts_fall_back_to_default() {
        let mut request = InferenceRequest::new("query", json!({}));
        request.timeout_seconds = Some(-1.0);
        assert!(request.timeout().is_none());
        request.timeout_seconds = Some(2.5);
        assert_eq!(request.timeout(), Some(Duration::from_millis(2500)));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_timeouts_beyond_the_clock_are_refused() {
        let mut request = InferenceRequest::new("query", json!({}));
        request.timeout_seconds = Some(1e20);
        assert!(request.timeout().is_none());
        assert!(request.validate().is_err());

        request.timeout_seconds = Some(f64::INFINITY);
        assert!(request.validate().is_err());
        request.timeout_seconds = Some(0.0);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_admission_wire_format() {
        let saturated = serde_json::to_value(Admission::Saturated).unwrap();
        assert_eq!(saturated, json!({"status": "saturated"}));
    }
}
