use crate::batch::Batch;
use crate::config::types::BatchConfig;
use crate::source::normalizer::LogEvent;

/// Limits a single put request must respect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_events: usize,
    pub max_bytes: usize,
    pub event_overhead_bytes: usize,
    pub max_event_bytes: usize,
    pub max_span: chrono::Duration,
}

impl BatchLimits {
    /// Billed size of one event
    pub fn event_size(&self, event: &LogEvent) -> usize {
        event.message.len() + self.event_overhead_bytes
    }

    /// Largest message that fits into a request on its own
    pub fn max_message_bytes(&self) -> usize {
        self.max_event_bytes
            .min(self.max_bytes.saturating_sub(self.event_overhead_bytes))
    }
}

impl From<&BatchConfig> for BatchLimits {
    fn from(config: &BatchConfig) -> Self {
        Self {
            max_events: config.max_events,
            max_bytes: config.max_bytes,
            event_overhead_bytes: config.event_overhead_bytes,
            max_event_bytes: config.max_event_bytes,
            max_span: chrono::Duration::from_std(config.max_span)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
        }
    }
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self::from(&BatchConfig::default())
    }
}

/// Packs events into the largest batches the limits allow, preserving order.
pub struct Batcher {
    limits: BatchLimits,
    current: Option<BatchBuilder>,
}

struct BatchBuilder {
    events: Vec<LogEvent>,
    size_bytes: usize,
    oversized: bool,
}

impl BatchBuilder {
    fn starting_with(event: LogEvent, size: usize, oversized: bool) -> Self {
        Self {
            events: vec![event],
            size_bytes: size,
            oversized,
        }
    }

    fn build(self) -> Batch {
        Batch {
            events: self.events,
            size_bytes: self.size_bytes,
            oversized: self.oversized,
        }
    }
}

impl Batcher {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            current: None,
        }
    }

    pub fn limits(&self) -> &BatchLimits {
        &self.limits
    }

    /// Add an event
    /// Returns a completed batch if this event did not fit into the open one
    pub fn add(&mut self, event: LogEvent) -> Option<Batch> {
        let size = self.limits.event_size(&event);

        if event.message.len() > self.limits.max_message_bytes() {
            tracing::warn!(
                line_number = event.line_number,
                bytes = event.message.len(),
                limit = self.limits.max_message_bytes(),
                "Event exceeds the per-event limit, it will be shipped alone and truncated"
            );
            let lone = BatchBuilder::starting_with(event, size, true);
            return match self.current.take() {
                Some(open) => {
                    // The lone event goes out with the next add or flush
                    self.current = Some(lone);
                    Some(open.build())
                }
                None => Some(lone.build()),
            };
        }

        let Some(open) = self.current.as_mut() else {
            self.current = Some(BatchBuilder::starting_with(event, size, false));
            return None;
        };

        if open.oversized || !fits(&self.limits, open, &event, size) {
            let completed = self.current.take().map(BatchBuilder::build);
            self.current = Some(BatchBuilder::starting_with(event, size, false));
            return completed;
        }

        open.size_bytes += size;
        open.events.push(event);
        None
    }

    /// Emit the open batch, if any
    pub fn flush(&mut self) -> Option<Batch> {
        self.current.take().map(BatchBuilder::build)
    }
}

fn fits(limits: &BatchLimits, open: &BatchBuilder, event: &LogEvent, size: usize) -> bool {
    if open.events.len() + 1 > limits.max_events {
        return false;
    }
    if open.size_bytes + size > limits.max_bytes {
        return false;
    }
    match open.events.first() {
        Some(first) => event.timestamp - first.timestamp <= limits.max_span,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn event(line: u64, timestamp: DateTime<Utc>, message: &str) -> LogEvent {
        LogEvent {
            timestamp,
            line_number: line,
            end_line: line,
            end_offset: line * 100,
            raw_text: message.to_string(),
            level: None,
            message: message.to_string(),
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 12, 21, 10, 0, 0).unwrap()
    }

    fn limits() -> BatchLimits {
        BatchLimits {
            max_events: 3,
            max_bytes: 100,
            event_overhead_bytes: 10,
            max_event_bytes: 60,
            max_span: chrono::Duration::hours(1),
        }
    }

    #[test]
    fn test_count_limit() {
        let mut batcher = Batcher::new(limits());

        assert!(batcher.add(event(1, base(), "a")).is_none());
        assert!(batcher.add(event(2, base(), "b")).is_none());
        assert!(batcher.add(event(3, base(), "c")).is_none());

        let batch = batcher.add(event(4, base(), "d")).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.end_offset(), 300);
        assert_eq!(batch.size_bytes, 33);

        let rest = batcher.flush().unwrap();
        assert_eq!(rest.events[0].line_number, 4);
        assert!(batcher.flush().is_none());
    }

    #[test]
    fn test_byte_limit() {
        let mut batcher = Batcher::new(limits());
        let forty = "x".repeat(40);

        assert!(batcher.add(event(1, base(), &forty)).is_none());
        // 50 + 50 = 100 fits exactly
        assert!(batcher.add(event(2, base(), &forty)).is_none());

        let batch = batcher.add(event(3, base(), "y")).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.size_bytes, 100);
    }

    #[test]
    fn test_span_limit() {
        let mut batcher = Batcher::new(limits());

        assert!(batcher.add(event(1, base(), "a")).is_none());
        assert!(batcher
            .add(event(2, base() + chrono::Duration::minutes(60), "b"))
            .is_none());

        let batch = batcher
            .add(event(3, base() + chrono::Duration::minutes(61), "c"))
            .unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_oversized_event_emitted_alone() {
        let mut batcher = Batcher::new(limits());
        let huge = "z".repeat(500);

        assert!(batcher.add(event(1, base(), "a")).is_none());

        let first = batcher.add(event(2, base(), &huge)).unwrap();
        assert_eq!(first.len(), 1);
        assert!(!first.oversized);

        let lone = batcher.add(event(3, base(), "b")).unwrap();
        assert!(lone.oversized);
        assert_eq!(lone.events[0].line_number, 2);

        let rest = batcher.flush().unwrap();
        assert_eq!(rest.events[0].line_number, 3);
    }

    #[test]
    fn test_oversized_event_with_nothing_pending() {
        let mut batcher = Batcher::new(limits());

        let lone = batcher.add(event(1, base(), &"z".repeat(61))).unwrap();

        assert!(lone.oversized);
        assert!(batcher.flush().is_none());
    }

    #[test]
    fn test_order_preserved_across_batches() {
        let mut batcher = Batcher::new(limits());
        let mut shipped = Vec::new();

        for line in 1..=10 {
            if let Some(batch) = batcher.add(event(line, base(), "m")) {
                shipped.extend(batch.events.into_iter().map(|e| e.line_number));
            }
        }
        if let Some(batch) = batcher.flush() {
            shipped.extend(batch.events.into_iter().map(|e| e.line_number));
        }

        assert_eq!(shipped, (1..=10).collect::<Vec<_>>());
    }
}
