use crate::batch::{Batch, BatchLimits};
use crate::config::types::RetryConfig;
use crate::sink::{
    Clock, InputLogEvent, LogSink, PutEventsRequest, RejectedEventsInfo, SinkError, StreamState,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Appended to messages cut to the per-event limit
pub const TRUNCATION_MARKER: &str = "...[truncated]";

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("sequence token for {stream} still rejected after refreshing it")]
    SequenceToken { stream: String },

    #[error("gave up on {stream} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        stream: String,
        attempts: u32,
        last_error: SinkError,
    },

    #[error("{stream} rejected the batch: {source}")]
    Rejected {
        stream: String,
        #[source]
        source: SinkError,
    },

    #[error("cannot prepare stream {stream}: {source}")]
    Stream {
        stream: String,
        #[source]
        source: SinkError,
    },
}

/// Outcome of a batch the destination acknowledged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub events: usize,
    /// Put calls made, including the one after a token refresh
    pub attempts: u32,
    pub truncated_events: usize,
    /// The destination had already accepted this batch on an earlier attempt
    pub duplicate: bool,
    pub rejected: Option<RejectedEventsInfo>,
}

/// Delivers batches to one sink, handling sequence tokens, throttling and
/// per-event size limits.
pub struct Shipper {
    sink: Arc<dyn LogSink>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    max_message_bytes: usize,
    create_missing_stream: bool,
}

impl Shipper {
    pub fn new(
        sink: Arc<dyn LogSink>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
        limits: &BatchLimits,
        create_missing_stream: bool,
    ) -> Self {
        Self {
            sink,
            clock,
            retry,
            max_message_bytes: limits.max_message_bytes(),
            create_missing_stream,
        }
    }

    /// Look up the stream's current token, creating the stream if allowed
    pub async fn prepare_stream(
        &self,
        log_group: &str,
        log_stream: &str,
    ) -> Result<StreamState, DeliveryError> {
        let description = self
            .with_retry(log_stream, || self.sink.describe_stream(log_group, log_stream))
            .await?;

        let sequence_token = match description {
            Some(description) => description.upload_sequence_token,
            None if self.create_missing_stream => {
                let created = self
                    .with_retry(log_stream, || self.sink.create_stream(log_group, log_stream))
                    .await;
                match created {
                    Ok(()) => {}
                    // Someone else created it between describe and create
                    Err(DeliveryError::Rejected {
                        source: SinkError::ResourceAlreadyExists(_),
                        ..
                    }) => {}
                    Err(e) => return Err(e),
                }
                None
            }
            None => {
                return Err(DeliveryError::Stream {
                    stream: log_stream.to_string(),
                    source: SinkError::ResourceNotFound(format!("{}/{}", log_group, log_stream)),
                })
            }
        };

        tracing::debug!(log_group, log_stream, has_token = sequence_token.is_some(), "Stream ready");
        Ok(StreamState {
            log_group: log_group.to_string(),
            log_stream: log_stream.to_string(),
            sequence_token,
        })
    }

    /// Ship one batch.
    ///
    /// Hands back the stream state to use next; it only changes when the
    /// destination confirmed the batch.
    pub async fn send(
        &self,
        batch: &Batch,
        state: StreamState,
    ) -> (StreamState, Result<Delivery, DeliveryError>) {
        let (events, truncated_events) = self.wire_events(batch);
        let mut request = PutEventsRequest {
            log_group: state.log_group.clone(),
            log_stream: state.log_stream.clone(),
            sequence_token: state.sequence_token.clone(),
            events,
        };

        let mut attempts = 0u32;
        let mut failures = 0u32;
        let mut refreshed = false;
        let mut backoff = self.retry.initial_backoff;

        loop {
            attempts += 1;
            match self.sink.put_events(&request).await {
                Ok(response) => {
                    if let Some(rejected) = &response.rejected {
                        tracing::warn!(
                            stream = %request.log_stream,
                            rejected = ?rejected,
                            "Destination dropped some events of an accepted batch"
                        );
                    }
                    tracing::debug!(
                        stream = %request.log_stream,
                        events = request.events.len(),
                        attempts,
                        "Batch delivered"
                    );
                    let delivery = Delivery {
                        events: request.events.len(),
                        attempts,
                        truncated_events,
                        duplicate: false,
                        rejected: response.rejected,
                    };
                    return (
                        StreamState {
                            sequence_token: response.next_sequence_token,
                            ..state
                        },
                        Ok(delivery),
                    );
                }
                Err(SinkError::DataAlreadyAccepted { expected }) => {
                    tracing::warn!(
                        stream = %request.log_stream,
                        "Batch was already accepted, treating as delivered"
                    );
                    let delivery = Delivery {
                        events: request.events.len(),
                        attempts,
                        truncated_events,
                        duplicate: true,
                        rejected: None,
                    };
                    let sequence_token = expected.or(request.sequence_token);
                    return (
                        StreamState {
                            sequence_token,
                            ..state
                        },
                        Ok(delivery),
                    );
                }
                Err(SinkError::InvalidSequenceToken { expected }) if !refreshed => {
                    refreshed = true;
                    let token = match self.fetch_token(&request.log_group, &request.log_stream).await {
                        Ok(Some(token)) => Some(token),
                        Ok(None) => expected,
                        Err(e) => {
                            tracing::warn!(error = %e, "Token refresh failed, using the token from the error");
                            expected
                        }
                    };
                    tracing::warn!(
                        stream = %request.log_stream,
                        "Sequence token rejected, retrying once with a refreshed token"
                    );
                    request.sequence_token = token;
                }
                Err(SinkError::InvalidSequenceToken { .. }) => {
                    let stream = request.log_stream;
                    return (state, Err(DeliveryError::SequenceToken { stream }));
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if failures >= self.retry.max_attempts {
                        tracing::error!(
                            stream = %request.log_stream,
                            attempts = failures,
                            error = %e,
                            "Max retries exceeded"
                        );
                        let stream = request.log_stream;
                        return (
                            state,
                            Err(DeliveryError::RetriesExhausted {
                                stream,
                                attempts: failures,
                                last_error: e,
                            }),
                        );
                    }

                    tracing::warn!(
                        stream = %request.log_stream,
                        attempt = failures,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Put failed, retrying"
                    );
                    self.clock.sleep(backoff).await;
                    backoff = next_backoff(backoff, self.retry.max_backoff);
                }
                Err(e) => {
                    let stream = request.log_stream;
                    return (state, Err(DeliveryError::Rejected { stream, source: e }));
                }
            }
        }
    }

    async fn fetch_token(&self, log_group: &str, log_stream: &str) -> Result<Option<String>, SinkError> {
        Ok(self
            .sink
            .describe_stream(log_group, log_stream)
            .await?
            .and_then(|description| description.upload_sequence_token))
    }

    /// Retry a request with exponential backoff
    async fn with_retry<F, Fut, T>(&self, stream: &str, mut operation: F) -> Result<T, DeliveryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SinkError>>,
    {
        let mut attempts = 0u32;
        let mut backoff = self.retry.initial_backoff;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    if attempts >= self.retry.max_attempts {
                        return Err(DeliveryError::RetriesExhausted {
                            stream: stream.to_string(),
                            attempts,
                            last_error: e,
                        });
                    }
                    tracing::warn!(
                        stream,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Request failed, retrying"
                    );
                    self.clock.sleep(backoff).await;
                    backoff = next_backoff(backoff, self.retry.max_backoff);
                }
                Err(e) => {
                    return Err(DeliveryError::Rejected {
                        stream: stream.to_string(),
                        source: e,
                    })
                }
            }
        }
    }

    fn wire_events(&self, batch: &Batch) -> (Vec<InputLogEvent>, usize) {
        let mut truncated = 0;
        let events = batch
            .events
            .iter()
            .map(|event| {
                let message = if event.message.len() > self.max_message_bytes {
                    truncated += 1;
                    tracing::warn!(
                        line_number = event.line_number,
                        bytes = event.message.len(),
                        limit = self.max_message_bytes,
                        "Truncating oversized event"
                    );
                    truncate_message(&event.message, self.max_message_bytes)
                } else {
                    event.message.clone()
                };
                InputLogEvent {
                    timestamp: event.timestamp.timestamp_millis(),
                    message,
                }
            })
            .collect();
        (events, truncated)
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    std::cmp::min(current.saturating_mul(2), max)
}

/// Cut `message` to at most `limit` bytes on a char boundary, marking the cut
/// when the marker fits
pub fn truncate_message(message: &str, limit: usize) -> String {
    if message.len() <= limit {
        return message.to_string();
    }
    let marker = if limit > TRUNCATION_MARKER.len() {
        TRUNCATION_MARKER
    } else {
        ""
    };
    let mut end = limit - marker.len();
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = String::with_capacity(end + marker.len());
    truncated.push_str(&message[..end]);
    truncated.push_str(marker);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{PutEventsResponse, StreamDescription};
    use crate::source::normalizer::LogEvent;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedSink {
        put_results: Mutex<VecDeque<Result<PutEventsResponse, SinkError>>>,
        puts: Mutex<Vec<PutEventsRequest>>,
        token: Mutex<Option<String>>,
        exists: bool,
        created: Mutex<bool>,
    }

    impl ScriptedSink {
        fn with_results(results: Vec<Result<PutEventsResponse, SinkError>>) -> Self {
            Self {
                put_results: Mutex::new(results.into()),
                exists: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl LogSink for ScriptedSink {
        async fn describe_stream(
            &self,
            _log_group: &str,
            _log_stream: &str,
        ) -> Result<Option<StreamDescription>, SinkError> {
            if !self.exists && !*self.created.lock().unwrap() {
                return Ok(None);
            }
            Ok(Some(StreamDescription {
                upload_sequence_token: self.token.lock().unwrap().clone(),
            }))
        }

        async fn create_stream(&self, _log_group: &str, _log_stream: &str) -> Result<(), SinkError> {
            *self.created.lock().unwrap() = true;
            Ok(())
        }

        async fn put_events(&self, request: &PutEventsRequest) -> Result<PutEventsResponse, SinkError> {
            self.puts.lock().unwrap().push(request.clone());
            self.put_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(PutEventsResponse::default()))
        }
    }

    #[derive(Default)]
    struct RecordingClock {
        sleeps: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Clock for RecordingClock {
        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    fn batch(messages: &[&str]) -> Batch {
        let timestamp = Utc.with_ymd_and_hms(2021, 12, 21, 10, 0, 0).unwrap();
        Batch {
            events: messages
                .iter()
                .enumerate()
                .map(|(i, message)| LogEvent {
                    timestamp,
                    line_number: i as u64 + 1,
                    end_line: i as u64 + 1,
                    end_offset: (i as u64 + 1) * 10,
                    raw_text: message.to_string(),
                    level: None,
                    message: message.to_string(),
                })
                .collect(),
            size_bytes: 0,
            oversized: false,
        }
    }

    fn state(token: Option<&str>) -> StreamState {
        StreamState {
            log_group: "group".to_string(),
            log_stream: "stream".to_string(),
            sequence_token: token.map(String::from),
        }
    }

    fn shipper(sink: Arc<ScriptedSink>, clock: Arc<RecordingClock>) -> Shipper {
        Shipper::new(
            sink,
            clock,
            RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_millis(150),
            },
            &BatchLimits {
                max_event_bytes: 64,
                ..BatchLimits::default()
            },
            true,
        )
    }

    #[tokio::test]
    async fn test_successful_send_advances_token() {
        let sink = Arc::new(ScriptedSink::with_results(vec![Ok(PutEventsResponse {
            next_sequence_token: Some("t2".to_string()),
            rejected: None,
        })]));
        let shipper = shipper(sink.clone(), Arc::default());

        let (state, result) = shipper.send(&batch(&["a", "b"]), state(Some("t1"))).await;

        let delivery = result.unwrap();
        assert_eq!(delivery.events, 2);
        assert_eq!(delivery.attempts, 1);
        assert_eq!(state.sequence_token.as_deref(), Some("t2"));
        let puts = sink.puts.lock().unwrap();
        assert_eq!(puts[0].sequence_token.as_deref(), Some("t1"));
        assert_eq!(puts[0].events[1].message, "b");
    }

    #[tokio::test]
    async fn test_token_mismatch_refreshes_once() {
        let sink = Arc::new(ScriptedSink::with_results(vec![
            Err(SinkError::InvalidSequenceToken { expected: None }),
            Ok(PutEventsResponse {
                next_sequence_token: Some("t9".to_string()),
                rejected: None,
            }),
        ]));
        *sink.token.lock().unwrap() = Some("t8".to_string());
        let shipper = shipper(sink.clone(), Arc::default());

        let (state, result) = shipper.send(&batch(&["a"]), state(Some("stale"))).await;

        assert_eq!(result.unwrap().attempts, 2);
        assert_eq!(state.sequence_token.as_deref(), Some("t9"));
        let puts = sink.puts.lock().unwrap();
        assert_eq!(puts.len(), 2);
        assert_eq!(puts[1].sequence_token.as_deref(), Some("t8"));
    }

    #[tokio::test]
    async fn test_second_token_mismatch_fails() {
        let sink = Arc::new(ScriptedSink::with_results(vec![
            Err(SinkError::InvalidSequenceToken { expected: None }),
            Err(SinkError::InvalidSequenceToken { expected: None }),
        ]));
        let shipper = shipper(sink.clone(), Arc::default());

        let (_, result) = shipper.send(&batch(&["a"]), state(Some("stale"))).await;

        assert!(matches!(result, Err(DeliveryError::SequenceToken { .. })));
        assert_eq!(sink.puts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_already_accepted_counts_as_delivered() {
        let sink = Arc::new(ScriptedSink::with_results(vec![Err(
            SinkError::DataAlreadyAccepted {
                expected: Some("t5".to_string()),
            },
        )]));
        let shipper = shipper(sink, Arc::default());

        let (state, result) = shipper.send(&batch(&["a"]), state(Some("t4"))).await;

        assert!(result.unwrap().duplicate);
        assert_eq!(state.sequence_token.as_deref(), Some("t5"));
    }

    #[tokio::test]
    async fn test_throttling_backs_off_then_succeeds() {
        let sink = Arc::new(ScriptedSink::with_results(vec![
            Err(SinkError::Throttled("slow down".into())),
            Err(SinkError::Throttled("slow down".into())),
            Ok(PutEventsResponse::default()),
        ]));
        let clock = Arc::new(RecordingClock::default());
        let shipper = shipper(sink, clock.clone());

        let (_, result) = shipper.send(&batch(&["a"]), state(None)).await;

        assert_eq!(result.unwrap().attempts, 3);
        assert_eq!(
            *clock.sleeps.lock().unwrap(),
            vec![Duration::from_millis(100), Duration::from_millis(150)]
        );
    }

    #[tokio::test]
    async fn test_throttling_exhausts_attempts() {
        let sink = Arc::new(ScriptedSink::with_results(vec![
            Err(SinkError::Throttled("1".into())),
            Err(SinkError::Throttled("2".into())),
            Err(SinkError::Throttled("3".into())),
            Ok(PutEventsResponse::default()),
        ]));
        let clock = Arc::new(RecordingClock::default());
        let shipper = shipper(sink.clone(), clock.clone());

        let (_, result) = shipper.send(&batch(&["a"]), state(None)).await;

        match result {
            Err(DeliveryError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(clock.sleeps.lock().unwrap().len(), 2);
        assert_eq!(sink.puts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_rejection_not_retried() {
        let sink = Arc::new(ScriptedSink::with_results(vec![Err(SinkError::Rejected {
            code: "InvalidParameterException".into(),
            message: "bad".into(),
        })]));
        let shipper = shipper(sink.clone(), Arc::default());

        let (_, result) = shipper.send(&batch(&["a"]), state(None)).await;

        assert!(matches!(result, Err(DeliveryError::Rejected { .. })));
        assert_eq!(sink.puts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_message_truncated() {
        let sink = Arc::new(ScriptedSink::with_results(vec![]));
        let shipper = shipper(sink.clone(), Arc::default());
        let huge = "é".repeat(100);

        let (_, result) = shipper.send(&batch(&[&huge]), state(None)).await;

        assert_eq!(result.unwrap().truncated_events, 1);
        let puts = sink.puts.lock().unwrap();
        let message = &puts[0].events[0].message;
        assert!(message.len() <= 64);
        assert!(message.ends_with(TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn test_prepare_creates_missing_stream() {
        let sink = Arc::new(ScriptedSink::default());
        let shipper = shipper(sink.clone(), Arc::default());

        let state = shipper.prepare_stream("group", "stream").await.unwrap();

        assert!(*sink.created.lock().unwrap());
        assert_eq!(state.sequence_token, None);
        assert_eq!(state.log_stream, "stream");
    }

    #[test]
    fn test_truncate_below_marker_length_cuts_plain() {
        let truncated = truncate_message("abcdefghijklmnopqrstuvwxyz", 10);

        assert_eq!(truncated, "abcdefghij");
        assert_eq!(truncate_message("ééé", 3), "é");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let truncated = truncate_message("ééééééééééééééééééééé", 20);

        assert!(truncated.len() <= 20);
        assert!(truncated.ends_with(TRUNCATION_MARKER));
    }
}
