pub mod clock;
pub mod http;
pub mod shipper;
pub mod stdout;

pub use clock::{Clock, TokioClock};
pub use http::HttpSink;
pub use shipper::{Delivery, DeliveryError, Shipper};
pub use stdout::StdoutSink;

use crate::config::types::{DestinationConfig, SinkType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("invalid sequence token (expected {expected:?})")]
    InvalidSequenceToken { expected: Option<String> },

    #[error("batch was already accepted (next token {expected:?})")]
    DataAlreadyAccepted { expected: Option<String> },

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("resource already exists: {0}")]
    ResourceAlreadyExists(String),

    #[error("request rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

impl SinkError {
    /// Worth another attempt after a backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Throttled(_) | SinkError::Transport(_))
    }
}

/// Remote position of one destination stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamState {
    pub log_group: String,
    pub log_stream: String,
    /// Token the next put must present; None for a fresh stream
    pub sequence_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputLogEvent {
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutEventsRequest {
    #[serde(rename = "logGroupName")]
    pub log_group: String,
    #[serde(rename = "logStreamName")]
    pub log_stream: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_token: Option<String>,
    #[serde(rename = "logEvents")]
    pub events: Vec<InputLogEvent>,
}

/// Indexes of events the destination accepted the request for but dropped
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedEventsInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub too_new_log_event_start_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub too_old_log_event_end_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired_log_event_end_index: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutEventsResponse {
    pub next_sequence_token: Option<String>,
    #[serde(rename = "rejectedLogEventsInfo")]
    pub rejected: Option<RejectedEventsInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamDescription {
    pub upload_sequence_token: Option<String>,
}

/// A log-ingestion destination: grouped, named streams accepting ordered,
/// timestamped events.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Ok(None) when the stream does not exist
    async fn describe_stream(
        &self,
        log_group: &str,
        log_stream: &str,
    ) -> Result<Option<StreamDescription>, SinkError>;

    async fn create_stream(&self, log_group: &str, log_stream: &str) -> Result<(), SinkError>;

    async fn put_events(&self, request: &PutEventsRequest) -> Result<PutEventsResponse, SinkError>;
}

/// Build the sink selected by the destination config
pub fn build_sink(config: &DestinationConfig) -> Result<Arc<dyn LogSink>, SinkError> {
    match config.sink_type {
        SinkType::Http => Ok(Arc::new(HttpSink::new(config)?)),
        SinkType::Stdout => Ok(Arc::new(StdoutSink::stdout())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_request_wire_format() {
        let request = PutEventsRequest {
            log_group: "group".to_string(),
            log_stream: "stream".to_string(),
            sequence_token: None,
            events: vec![InputLogEvent {
                timestamp: 1_640_048_289_612,
                message: "hello".to_string(),
            }],
        };

        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["logGroupName"], "group");
        assert_eq!(json["logStreamName"], "stream");
        assert!(json.get("sequenceToken").is_none());
        assert_eq!(json["logEvents"][0]["timestamp"], 1_640_048_289_612i64);
    }

    #[test]
    fn test_put_response_with_rejections() {
        let response: PutEventsResponse = serde_json::from_str(
            r#"{"nextSequenceToken": "49", "rejectedLogEventsInfo": {"tooOldLogEventEndIndex": 2}}"#,
        )
        .unwrap();

        assert_eq!(response.next_sequence_token.as_deref(), Some("49"));
        assert_eq!(response.rejected.unwrap().too_old_log_event_end_index, Some(2));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SinkError::Throttled("slow down".into()).is_retryable());
        assert!(SinkError::Transport("reset".into()).is_retryable());
        assert!(!SinkError::InvalidSequenceToken { expected: None }.is_retryable());
        assert!(!SinkError::Rejected {
            code: "InvalidParameterException".into(),
            message: "bad".into()
        }
        .is_retryable());
    }
}
