use crate::source::reader::RawLine;
use crate::source::timestamp::{ParsedTime, TimestampError, TimestampExtractor};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A time of day this far behind the previous one means the log crossed midnight
const ROLLOVER_THRESHOLD_HOURS: i64 = 12;
/// Clock skew allowed between a line's time of day and the file's mtime
const MTIME_TOLERANCE_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    /// The event did not start with a recognizable prefix
    Unparsed,
}

impl LogLevel {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "TRACE" | "FINEST" | "FINER" => Some(LogLevel::Trace),
            "DEBUG" | "FINE" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" | "SEVERE" => Some(LogLevel::Error),
            "FATAL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

/// One logical log entry, possibly spanning several lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    /// Line number of the first line
    pub line_number: u64,
    pub end_line: u64,
    /// Offset just past the last line
    pub end_offset: u64,
    pub raw_text: String,
    pub level: Option<LogLevel>,
    /// Text that gets shipped: the raw text minus the timestamp prefix
    pub message: String,
}

/// Classification of a single raw line
#[derive(Debug)]
pub enum ParsedLine<'a> {
    Prefixed {
        time: ParsedTime,
        level: Option<LogLevel>,
        message: &'a str,
    },
    Continuation,
    /// Prefix matched but the timestamp is unusable
    Malformed(TimestampError),
}

#[derive(Debug)]
struct PendingEvent {
    timestamp: Option<DateTime<Utc>>,
    line_number: u64,
    end_line: u64,
    end_offset: u64,
    raw_text: String,
    level: Option<LogLevel>,
    message: String,
}

impl PendingEvent {
    fn start(
        line: RawLine,
        timestamp: Option<DateTime<Utc>>,
        level: Option<LogLevel>,
        message: String,
    ) -> Self {
        Self {
            timestamp,
            line_number: line.line_number,
            end_line: line.line_number,
            end_offset: line.end_offset,
            raw_text: line.text,
            level,
            message,
        }
    }

    fn append(&mut self, line: RawLine) {
        self.raw_text.push('\n');
        self.raw_text.push_str(&line.text);
        self.message.push('\n');
        self.message.push_str(&line.text);
        self.end_line = line.line_number;
        self.end_offset = line.end_offset;
    }
}

/// Turns raw lines into events, grouping continuation lines (stack traces)
/// with the line that introduced them.
///
/// Never fails on input: anything unrecognizable is passed through verbatim
/// with level [`LogLevel::Unparsed`].
pub struct Normalizer {
    extractor: TimestampExtractor,
    log_date: NaiveDate,
    fallback: DateTime<Utc>,
    last_time_of_day: Option<NaiveTime>,
    last_timestamp: Option<DateTime<Utc>>,
    pending: Option<PendingEvent>,
    malformed_lines: u64,
}

impl Normalizer {
    /// `log_date` anchors time-of-day timestamps; `fallback` (the file's
    /// mtime) is used when a fragment contains no timestamp at all. A time of
    /// day that would land after `fallback` was written the day before.
    pub fn new(extractor: TimestampExtractor, log_date: NaiveDate, fallback: DateTime<Utc>) -> Self {
        Self {
            extractor,
            log_date,
            fallback,
            last_time_of_day: None,
            last_timestamp: None,
            pending: None,
            malformed_lines: 0,
        }
    }

    pub fn malformed_lines(&self) -> u64 {
        self.malformed_lines
    }

    /// Classify a raw line without changing any state
    pub fn parse<'a>(&self, raw_text: &'a str) -> ParsedLine<'a> {
        match self.extractor.extract(raw_text) {
            Ok(Some(extracted)) => ParsedLine::Prefixed {
                time: extracted.time,
                level: extracted.level.and_then(LogLevel::from_token),
                message: raw_text[extracted.ts_end..].trim_start(),
            },
            Ok(None) => ParsedLine::Continuation,
            Err(e) => ParsedLine::Malformed(e),
        }
    }

    /// Feed the next line; returns the previous event once it is complete
    pub fn push(&mut self, line: RawLine) -> Option<LogEvent> {
        match self.parse(&line.text) {
            ParsedLine::Prefixed {
                time,
                level,
                message,
            } => {
                let message = message.to_string();
                let timestamp = self.resolve(time);
                let completed = self
                    .pending
                    .take()
                    .map(|pending| self.complete(pending, Some(timestamp)));
                self.pending = Some(PendingEvent::start(line, Some(timestamp), level, message));
                completed
            }
            ParsedLine::Continuation => {
                match self.pending.as_mut() {
                    Some(pending) => pending.append(line),
                    None => {
                        // Start of a fragment with no predecessor
                        let message = line.text.clone();
                        self.pending = Some(PendingEvent::start(
                            line,
                            None,
                            Some(LogLevel::Unparsed),
                            message,
                        ));
                    }
                }
                None
            }
            ParsedLine::Malformed(error) => {
                self.malformed_lines += 1;
                tracing::warn!(
                    line_number = line.line_number,
                    error = %error,
                    "Malformed log line prefix, passing it through verbatim"
                );
                // No timestamp seen yet: keep the fragment open until one shows up
                if self.last_timestamp.is_none() {
                    if let Some(pending) = self.pending.as_mut().filter(|p| p.timestamp.is_none()) {
                        pending.append(line);
                        return None;
                    }
                }
                let completed = self.pending.take().map(|pending| self.complete(pending, None));
                let message = line.text.clone();
                self.pending = Some(PendingEvent::start(
                    line,
                    None,
                    Some(LogLevel::Unparsed),
                    message,
                ));
                completed
            }
        }
    }

    /// Emit whatever is still buffered (end of the pass)
    pub fn finish(&mut self) -> Option<LogEvent> {
        self.pending
            .take()
            .map(|pending| self.complete(pending, None))
    }

    fn resolve(&mut self, time: ParsedTime) -> DateTime<Utc> {
        match time {
            ParsedTime::Instant(instant) => instant,
            ParsedTime::TimeOfDay(time) => {
                if let Some(previous) = self.last_time_of_day {
                    if previous - time > chrono::Duration::hours(ROLLOVER_THRESHOLD_HOURS) {
                        if let Some(next_day) = self.log_date.succ_opt() {
                            tracing::debug!(
                                from = %self.log_date,
                                to = %next_day,
                                "Time of day went backwards, assuming midnight passed"
                            );
                            self.log_date = next_day;
                        }
                    }
                }
                self.last_time_of_day = Some(time);

                let timezone = self.extractor.timezone();
                let instant = timezone.to_utc(&self.log_date.and_time(time));
                let latest = self.fallback + chrono::Duration::minutes(MTIME_TOLERANCE_MINUTES);
                match self.log_date.pred_opt() {
                    Some(previous_day) if instant > latest => {
                        tracing::debug!(
                            from = %self.log_date,
                            to = %previous_day,
                            "Time of day is later than the file's mtime, assuming the previous day"
                        );
                        self.log_date = previous_day;
                        timezone.to_utc(&self.log_date.and_time(time))
                    }
                    _ => instant,
                }
            }
        }
    }

    fn complete(&mut self, pending: PendingEvent, next_timestamp: Option<DateTime<Utc>>) -> LogEvent {
        let candidate = pending
            .timestamp
            .or(self.last_timestamp)
            .or(next_timestamp)
            .unwrap_or(self.fallback);

        // Events must never go back in time
        let timestamp = match self.last_timestamp {
            Some(last) if last > candidate => last,
            _ => candidate,
        };
        self.last_timestamp = Some(timestamp);

        LogEvent {
            timestamp,
            line_number: pending.line_number,
            end_line: pending.end_line,
            end_offset: pending.end_offset,
            raw_text: pending.raw_text,
            level: pending.level,
            message: pending.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{default_timestamp_format, default_timestamp_pattern, TimeZoneSpec};
    use chrono::TimeZone;

    fn mtime() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 12, 22, 6, 0, 0).unwrap()
    }

    fn normalizer_at(log_date: NaiveDate, mtime: DateTime<Utc>) -> Normalizer {
        let extractor = TimestampExtractor::new(
            &default_timestamp_pattern(),
            &default_timestamp_format(),
            TimeZoneSpec::Utc,
        )
        .unwrap();
        Normalizer::new(extractor, log_date, mtime)
    }

    fn normalizer() -> Normalizer {
        normalizer_at(NaiveDate::from_ymd_opt(2021, 12, 21).unwrap(), mtime())
    }

    fn lines(texts: &[&str]) -> Vec<RawLine> {
        let mut offset = 0;
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                offset += text.len() as u64 + 1;
                RawLine {
                    line_number: i as u64 + 1,
                    text: text.to_string(),
                    end_offset: offset,
                }
            })
            .collect()
    }

    fn run(normalizer: &mut Normalizer, texts: &[&str]) -> Vec<LogEvent> {
        let mut events: Vec<LogEvent> = lines(texts)
            .into_iter()
            .filter_map(|line| normalizer.push(line))
            .collect();
        events.extend(normalizer.finish());
        events
    }

    #[test]
    fn test_prefixed_lines_become_events() {
        let mut normalizer = normalizer();

        let events = run(
            &mut normalizer,
            &[
                "00:58:09,612 INFO  [org.teiid.RUNTIME] (main) started",
                "00:58:10,001 ERROR [org.teiid.CONNECTOR] (worker) failed",
            ],
        );

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].level, Some(LogLevel::Info));
        assert_eq!(events[0].message, "INFO  [org.teiid.RUNTIME] (main) started");
        assert_eq!(
            events[0].timestamp,
            Utc.with_ymd_and_hms(2021, 12, 21, 0, 58, 9).unwrap() + chrono::Duration::milliseconds(612)
        );
        assert_eq!(events[1].level, Some(LogLevel::Error));
    }

    #[test]
    fn test_stack_trace_grouped_into_one_event() {
        let mut normalizer = normalizer();

        let events = run(
            &mut normalizer,
            &[
                "10:00:00,000 ERROR [org.teiid] (worker) query failed",
                "java.lang.NullPointerException",
                "\tat org.teiid.Foo.bar(Foo.java:42)",
                "\tat org.teiid.Foo.baz(Foo.java:7)",
                "10:00:01,000 INFO  [org.teiid] (worker) recovered",
            ],
        );

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].line_number, 1);
        assert_eq!(events[0].end_line, 4);
        assert_eq!(events[0].raw_text.lines().count(), 4);
        assert!(events[0].message.ends_with("\tat org.teiid.Foo.baz(Foo.java:7)"));
        assert_eq!(events[1].line_number, 5);
    }

    #[test]
    fn test_first_line_without_prefix_is_unparsed_event() {
        let mut normalizer = normalizer();

        let events = run(
            &mut normalizer,
            &[
                "\tat org.teiid.Tail.end(Tail.java:1)",
                "10:00:01,000 INFO  [org.teiid] (worker) next",
            ],
        );

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].level, Some(LogLevel::Unparsed));
        assert_eq!(events[0].message, "\tat org.teiid.Tail.end(Tail.java:1)");
        // Borrowed from the next prefixed line
        assert_eq!(events[0].timestamp, events[1].timestamp);
    }

    #[test]
    fn test_fragment_without_any_timestamp_uses_fallback() {
        let mut normalizer = normalizer();

        let events = run(&mut normalizer, &["no prefix here", "nor here"]);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "no prefix here\nnor here");
        assert_eq!(events[0].timestamp, mtime());
    }

    #[test]
    fn test_malformed_prefix_passes_through() {
        let mut normalizer = normalizer();

        let events = run(
            &mut normalizer,
            &[
                "10:00:00,000 INFO  [a] (b) fine",
                "99:99:99,999 INFO  [a] (b) broken clock",
                "10:00:02,000 INFO  [a] (b) fine again",
            ],
        );

        assert_eq!(events.len(), 3);
        assert_eq!(events[1].level, Some(LogLevel::Unparsed));
        assert_eq!(events[1].message, "99:99:99,999 INFO  [a] (b) broken clock");
        assert_eq!(events[1].timestamp, events[0].timestamp);
        assert_eq!(normalizer.malformed_lines(), 1);
    }

    #[test]
    fn test_timestamps_never_decrease() {
        let mut normalizer = normalizer();

        let events = run(
            &mut normalizer,
            &[
                "10:00:05,000 INFO  [a] (b) later",
                "10:00:01,000 INFO  [a] (b) written late by another thread",
            ],
        );

        assert_eq!(events[1].timestamp, events[0].timestamp);
    }

    #[test]
    fn test_midnight_rollover_advances_date() {
        let mut normalizer = normalizer();

        let events = run(
            &mut normalizer,
            &[
                "23:59:59,000 INFO  [a] (b) before midnight",
                "00:00:01,000 INFO  [a] (b) after midnight",
            ],
        );

        assert_eq!(
            events[1].timestamp,
            Utc.with_ymd_and_hms(2021, 12, 22, 0, 0, 1).unwrap()
        );
    }

    #[test]
    fn test_end_offsets_follow_last_line() {
        let mut normalizer = normalizer();

        let events = run(
            &mut normalizer,
            &["10:00:00,000 INFO  [a] (b) x", "  continued"],
        );

        // 28 + 1 + 11 + 1
        assert_eq!(events[0].end_offset, 41);
    }

    #[test]
    fn test_malformed_line_after_unparsed_start_waits_for_timestamp() {
        let mut normalizer = normalizer();

        let events = run(
            &mut normalizer,
            &[
                "\tat org.teiid.Tail.end(Tail.java:1)",
                "99:99:99,999 INFO  [a] (b) broken clock",
                "10:00:00,000 INFO  [a] (b) ok",
            ],
        );

        let ten = Utc.with_ymd_and_hms(2021, 12, 21, 10, 0, 0).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].message,
            "\tat org.teiid.Tail.end(Tail.java:1)\n99:99:99,999 INFO  [a] (b) broken clock"
        );
        assert_eq!(events[0].timestamp, ten);
        assert_eq!(events[1].timestamp, ten);
        assert_eq!(normalizer.malformed_lines(), 1);
    }

    #[test]
    fn test_time_after_mtime_belongs_to_previous_day() {
        // Written just before midnight, read the next day before rotation
        let mut normalizer = normalizer_at(
            NaiveDate::from_ymd_opt(2021, 12, 22).unwrap(),
            Utc.with_ymd_and_hms(2021, 12, 21, 23, 59, 30).unwrap(),
        );

        let events = run(
            &mut normalizer,
            &[
                "23:58:00,000 INFO  [a] (b) late",
                "23:59:00,000 INFO  [a] (b) later",
            ],
        );

        assert_eq!(
            events[0].timestamp,
            Utc.with_ymd_and_hms(2021, 12, 21, 23, 58, 0).unwrap()
        );
        assert_eq!(
            events[1].timestamp,
            Utc.with_ymd_and_hms(2021, 12, 21, 23, 59, 0).unwrap()
        );
    }
}
