use crate::sink::{LogSink, PutEventsRequest, PutEventsResponse, SinkError, StreamDescription};
use async_trait::async_trait;
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Dry-run sink: prints each event as one JSON line instead of shipping it.
///
/// Hands out increasing sequence tokens so the shipper's bookkeeping runs
/// exactly as it would against a real endpoint.
pub struct StdoutSink<W: Write + Send = std::io::Stdout> {
    out: Mutex<W>,
    next_token: AtomicU64,
}

#[derive(Serialize)]
struct PrintedEvent<'a> {
    log_group: &'a str,
    log_stream: &'a str,
    timestamp: i64,
    message: &'a str,
}

impl StdoutSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> StdoutSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl<W: Write + Send> LogSink for StdoutSink<W> {
    async fn describe_stream(
        &self,
        _log_group: &str,
        _log_stream: &str,
    ) -> Result<Option<StreamDescription>, SinkError> {
        Ok(Some(StreamDescription {
            upload_sequence_token: None,
        }))
    }

    async fn create_stream(&self, _log_group: &str, _log_stream: &str) -> Result<(), SinkError> {
        Ok(())
    }

    async fn put_events(&self, request: &PutEventsRequest) -> Result<PutEventsResponse, SinkError> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| SinkError::Transport("output lock poisoned".to_string()))?;

        for event in &request.events {
            let line = serde_json::to_string(&PrintedEvent {
                log_group: &request.log_group,
                log_stream: &request.log_stream,
                timestamp: event.timestamp,
                message: &event.message,
            })
            .map_err(|e| SinkError::InvalidResponse(e.to_string()))?;
            writeln!(out, "{}", line).map_err(|e| SinkError::Transport(e.to_string()))?;
        }
        out.flush().map_err(|e| SinkError::Transport(e.to_string()))?;

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        Ok(PutEventsResponse {
            next_sequence_token: Some(token.to_string()),
            rejected: None,
        })
    }
}
