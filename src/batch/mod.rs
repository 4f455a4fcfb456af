pub mod batcher;

pub use batcher::{BatchLimits, Batcher};

use crate::source::normalizer::LogEvent;
use chrono::{DateTime, Utc};

/// Events shipped in one request, in file order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub events: Vec<LogEvent>,
    /// Billed size: message bytes plus per-event overhead
    pub size_bytes: usize,
    /// A single event too large for any batch; the shipper truncates it
    pub oversized: bool,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Offset just past the last event, where the cursor moves once shipped
    pub fn end_offset(&self) -> u64 {
        self.events.last().map(|e| e.end_offset).unwrap_or(0)
    }

    pub fn end_line(&self) -> u64 {
        self.events.last().map(|e| e.end_line).unwrap_or(0)
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.events.first().map(|e| e.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|e| e.timestamp)
    }
}
