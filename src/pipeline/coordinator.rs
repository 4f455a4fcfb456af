use crate::batch::{Batch, BatchLimits, Batcher};
use crate::config::types::{Config, TimeZoneSpec};
use crate::pipeline::summary::{PassSummary, RunSummary};
use crate::sink::{Clock, DeliveryError, LogSink, Shipper, StreamState};
use crate::source::fingerprint::{file_identity, Fingerprint};
use crate::source::normalizer::{LogEvent, LogLevel, Normalizer};
use crate::source::reader::{find_rotated_sibling, rotated_suffix_date, LineReader, ReaderError};
use crate::source::timestamp::{TimestampError, TimestampExtractor};
use crate::storage::cursor::{Cursor, CursorStore, PersistenceError};
use chrono::{DateTime, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Reading,
    Normalizing,
    Batching,
    Shipping,
    Advancing,
    Failed,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("source reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("timestamp configuration error: {0}")]
    Timestamp(#[from] TimestampError),
}

impl RunError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::Persistence(_) => 2,
            RunError::Delivery(_) => 3,
            RunError::Reader(_) | RunError::Timestamp(_) => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing new to ship
    Idle,
    Shipped(RunSummary),
}

/// Drives one bounded pass: read new lines, group them into events, ship
/// them in batches and advance the cursor after every acknowledged batch.
pub struct Coordinator {
    config: Config,
    store: CursorStore,
    shipper: Shipper,
    limits: BatchLimits,
    skip_events: u64,
    phase: RunPhase,
}

/// Per-pass state threaded through the shipping of each batch
struct PassContext<'a> {
    cursor_key: &'a Path,
    fingerprint: Fingerprint,
    log_group: String,
    log_stream: String,
    stream: Option<StreamState>,
    summary: PassSummary,
    to_skip: u64,
    skipped_through: Option<Cursor>,
}

impl Coordinator {
    pub fn new(config: Config, store: CursorStore, shipper: Shipper) -> Self {
        let limits = BatchLimits::from(&config.batch);
        Self {
            config,
            store,
            shipper,
            limits,
            skip_events: 0,
            phase: RunPhase::Idle,
        }
    }

    /// Reprocess the current file from its first line, dropping the first
    /// `count` events instead of resuming from the stored cursor
    pub fn skip_events(mut self, count: u64) -> Self {
        self.skip_events = count;
        self
    }

    /// Wire a coordinator around `sink` using the batch, retry and state settings
    pub fn from_config(config: Config, sink: Arc<dyn LogSink>, clock: Arc<dyn Clock>) -> Self {
        let limits = BatchLimits::from(&config.batch);
        let shipper = Shipper::new(
            sink,
            clock,
            config.retry.clone(),
            &limits,
            config.destination.create_missing_stream,
        );
        let store = CursorStore::new(config.state.cursor_path.clone());
        Self::new(config, store, shipper)
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Ship everything appended to `log_path` since the last run.
    ///
    /// `log_date` anchors time-of-day timestamps and names the stream.
    pub async fn run(&mut self, log_path: &Path, log_date: NaiveDate) -> Result<RunOutcome, RunError> {
        let started_at = Utc::now();

        match self.run_passes(log_path, log_date).await {
            Ok(passes) => {
                self.transition(RunPhase::Idle);
                if passes.iter().all(|pass| pass.batches_shipped == 0) {
                    tracing::info!(log = %log_path.display(), "Nothing new to ship");
                    return Ok(RunOutcome::Idle);
                }

                let summary = RunSummary::new(started_at, passes);
                self.publish_summary(&summary).await;
                Ok(RunOutcome::Shipped(summary))
            }
            Err(e) => {
                self.transition(RunPhase::Failed);
                tracing::error!(log = %log_path.display(), error = %e, "Run failed");
                Err(e)
            }
        }
    }

    async fn run_passes(&mut self, log_path: &Path, log_date: NaiveDate) -> Result<Vec<PassSummary>, RunError> {
        self.transition(RunPhase::Reading);
        let mut cursor = self.store.load(log_path)?;
        let mut passes = Vec::new();

        if self.skip_events > 0 {
            tracing::info!(
                log = %log_path.display(),
                skip = self.skip_events,
                "Reprocessing from the start of the file"
            );
            cursor = Cursor::zero();
        } else if let Some(rotated) = self.rotated_predecessor(log_path, &cursor) {
            let rotated_date = self.rotated_log_date(log_path, &rotated).unwrap_or(log_date);
            tracing::info!(
                rotated = %rotated.display(),
                log_date = %rotated_date,
                "Draining the rotated file before the current one"
            );
            passes.push(self.run_pass(&rotated, log_path, &cursor, rotated_date, 0).await?);
            cursor = Cursor::zero();
        }

        let skip = self.skip_events;
        match self.run_pass(log_path, log_path, &cursor, log_date, skip).await {
            Ok(pass) => passes.push(pass),
            Err(RunError::Reader(ReaderError::NotFound(path))) => {
                tracing::warn!(log = %path.display(), "Log file does not exist, nothing to do");
            }
            Err(e) => return Err(e),
        }

        Ok(passes)
    }

    /// The renamed old incarnation of `log_path`, if the cursor points at one
    fn rotated_predecessor(&self, log_path: &Path, cursor: &Cursor) -> Option<PathBuf> {
        let fingerprint = cursor.fingerprint.as_ref()?;
        if let Ok(metadata) = std::fs::metadata(log_path) {
            let (device, inode) = file_identity(&metadata);
            if fingerprint.same_identity(device, inode) {
                return None;
            }
        }
        find_rotated_sibling(log_path, &self.config.source.rotated_suffix_format, fingerprint)
    }

    /// Date from the rotation suffix (`server.log.2021-12-21`), else the mtime
    fn rotated_log_date(&self, log_path: &Path, rotated: &Path) -> Option<NaiveDate> {
        let suffix_format = &self.config.source.rotated_suffix_format;
        if let Some(date) = rotated_suffix_date(log_path, rotated, suffix_format) {
            return Some(date);
        }
        let modified = std::fs::metadata(rotated).ok()?.modified().ok()?;
        Some(self.timezone().date_of(DateTime::<Utc>::from(modified)))
    }

    fn timezone(&self) -> TimeZoneSpec {
        self.config.source.timestamp.timezone
    }

    async fn run_pass(
        &mut self,
        file: &Path,
        cursor_key: &Path,
        cursor: &Cursor,
        log_date: NaiveDate,
        skip: u64,
    ) -> Result<PassSummary, RunError> {
        self.transition(RunPhase::Reading);
        let mut reader = LineReader::open(file, cursor)?;

        let extractor = TimestampExtractor::new(
            &self.config.source.timestamp.pattern,
            &self.config.source.timestamp.format,
            self.timezone(),
        )?;
        let fallback = reader.modified().unwrap_or_else(Utc::now);
        let mut normalizer = Normalizer::new(extractor, log_date, fallback);
        let mut batcher = Batcher::new(self.limits);

        let log_group = self.config.destination.log_group.clone();
        let log_stream = stream_name(&self.config.destination.log_stream, log_date);
        let mut pass = PassContext {
            cursor_key,
            fingerprint: reader.fingerprint().clone(),
            summary: PassSummary::new(
                file,
                &log_group,
                &log_stream,
                log_date,
                reader.start_offset(),
                reader.discontinuity(),
            ),
            log_group,
            log_stream,
            stream: None,
            to_skip: skip,
            skipped_through: None,
        };

        tracing::debug!(
            file = %file.display(),
            start_offset = reader.start_offset(),
            stream = %pass.log_stream,
            "Pass started"
        );

        while let Some(line) = reader.next_line()? {
            self.transition(RunPhase::Normalizing);
            if let Some(event) = normalizer.push(line) {
                self.take_event(event, &mut batcher, &mut pass).await?;
            }
        }

        if let Some(event) = normalizer.finish() {
            self.take_event(event, &mut batcher, &mut pass).await?;
        }
        if let Some(batch) = batcher.flush() {
            self.ship(&batch, &mut pass).await?;
        }

        pass.summary.malformed_lines = normalizer.malformed_lines();

        if pass.summary.batches_shipped == 0 {
            // Remember skipped events, a reset position, or a file seen for the first time
            let resume = pass.skipped_through.take().or_else(|| {
                (reader.discontinuity().is_some() || cursor.fingerprint.is_none())
                    .then(|| reader.start_cursor())
            });
            if let Some(resume) = resume {
                self.transition(RunPhase::Advancing);
                self.store.advance(cursor_key, &resume)?;
            }
        } else {
            tracing::info!(
                file = %file.display(),
                stream = %pass.log_stream,
                events = pass.summary.events_shipped,
                batches = pass.summary.batches_shipped,
                end_offset = pass.summary.end_offset,
                "Pass complete"
            );
        }

        Ok(pass.summary)
    }

    async fn take_event(
        &mut self,
        event: LogEvent,
        batcher: &mut Batcher,
        pass: &mut PassContext<'_>,
    ) -> Result<(), RunError> {
        if pass.to_skip > 0 {
            pass.to_skip -= 1;
            pass.summary.events_skipped += 1;
            pass.skipped_through = Some(Cursor {
                fingerprint: Some(pass.fingerprint.clone()),
                offset: event.end_offset,
                line: event.end_line,
            });
            return Ok(());
        }

        self.transition(RunPhase::Batching);
        if let Some(batch) = batcher.add(event) {
            self.ship(&batch, pass).await?;
        }
        Ok(())
    }

    async fn ship(&mut self, batch: &Batch, pass: &mut PassContext<'_>) -> Result<(), RunError> {
        self.transition(RunPhase::Shipping);

        let state = match pass.stream.take() {
            Some(state) => state,
            None => {
                self.shipper
                    .prepare_stream(&pass.log_group, &pass.log_stream)
                    .await?
            }
        };

        let (state, result) = self.shipper.send(batch, state).await;
        pass.stream = Some(state);
        let delivery = result?;

        self.transition(RunPhase::Advancing);
        let cursor = Cursor {
            fingerprint: Some(pass.fingerprint.clone()),
            offset: batch.end_offset(),
            line: batch.end_line(),
        };
        self.store.advance(pass.cursor_key, &cursor)?;
        pass.summary.record(batch, &delivery);
        Ok(())
    }

    async fn publish_summary(&self, summary: &RunSummary) {
        tracing::info!(
            run_id = %summary.run_id,
            events = summary.events_shipped(),
            batches = summary.batches_shipped(),
            elapsed_ms = summary.elapsed_ms,
            "Run complete"
        );

        if let Some(path) = &self.config.state.summary_log {
            if let Err(e) = summary.append_to(path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to append run summary");
            }
        }

        let Some(summary_stream) = self.config.destination.summary_stream.clone() else {
            return;
        };
        let message = match serde_json::to_string(summary) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode run summary");
                return;
            }
        };
        let batch = Batch {
            size_bytes: message.len() + self.limits.event_overhead_bytes,
            events: vec![LogEvent {
                timestamp: summary.finished_at,
                line_number: 0,
                end_line: 0,
                end_offset: 0,
                raw_text: message.clone(),
                level: Some(LogLevel::Info),
                message,
            }],
            oversized: false,
        };

        let log_group = self.config.destination.log_group.clone();
        let result = match self.shipper.prepare_stream(&log_group, &summary_stream).await {
            Ok(state) => self.shipper.send(&batch, state).await.1.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(stream = %summary_stream, error = %e, "Failed to ship run summary");
        }
    }

    fn transition(&mut self, next: RunPhase) {
        if self.phase != next {
            tracing::trace!(from = ?self.phase, to = ?next, "Phase change");
            self.phase = next;
        }
    }
}

/// Expand `{date}` in a stream name template
pub fn stream_name(template: &str, log_date: NaiveDate) -> String {
    template.replace("{date}", &log_date.format("%Y-%m-%d").to_string())
}
