use crate::config::types::TimeZoneSpec;
use chrono::{DateTime, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("regex compilation failed: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("pattern missing 'ts' capture group")]
    MissingTsGroup,

    #[error("failed to parse timestamp '{value}' with format '{format}': {source}")]
    ParseError {
        value: String,
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Debug, Clone)]
pub enum TimestampFormat {
    Strptime(String),
    /// strptime format without any date component (`%H:%M:%S,%3f`)
    TimeOfDay(String),
    Iso8601,
    Epoch,
    EpochMs,
}

/// A timestamp as found in the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedTime {
    Instant(DateTime<Utc>),
    /// Needs a calendar date from the caller
    TimeOfDay(NaiveTime),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted<'a> {
    pub time: ParsedTime,
    pub level: Option<&'a str>,
    /// Byte index just past the `ts` capture
    pub ts_end: usize,
}

#[derive(Debug)]
pub struct TimestampExtractor {
    pattern: Regex,
    format: TimestampFormat,
    timezone: TimeZoneSpec,
}

// Specifiers that carry a calendar date; a strptime format with none of them
// only describes a time of day.
const DATE_SPECIFIERS: &[&str] = &[
    "%Y", "%y", "%C", "%m", "%b", "%B", "%h", "%d", "%e", "%j", "%F", "%D", "%x", "%c", "%+",
    "%s", "%G", "%g",
];

impl TimestampExtractor {
    /// Create a new TimestampExtractor
    ///
    /// # Arguments
    /// * `pattern` - Regex pattern that must contain a named capture group 'ts'
    ///   and may contain 'level'
    /// * `format` - One of: strptime format string, 'iso8601', 'epoch', 'epoch_ms'
    /// * `timezone` - Used for formats without an offset
    pub fn new(pattern: &str, format: &str, timezone: TimeZoneSpec) -> Result<Self, TimestampError> {
        let regex = Regex::new(pattern)?;

        if regex.capture_names().all(|name| name != Some("ts")) {
            return Err(TimestampError::MissingTsGroup);
        }

        let timestamp_format = match format {
            "iso8601" => TimestampFormat::Iso8601,
            "epoch" => TimestampFormat::Epoch,
            "epoch_ms" => TimestampFormat::EpochMs,
            other if !DATE_SPECIFIERS.iter().any(|s| other.contains(s)) => {
                TimestampFormat::TimeOfDay(other.to_string())
            }
            other => TimestampFormat::Strptime(other.to_string()),
        };

        Ok(Self {
            pattern: regex,
            format: timestamp_format,
            timezone,
        })
    }

    pub fn timezone(&self) -> TimeZoneSpec {
        self.timezone
    }

    /// Extract the timestamp prefix from a log line
    ///
    /// Returns None if the pattern doesn't match the line.
    /// Returns an error if it matched but the value could not be parsed.
    pub fn extract<'a>(&self, line: &'a str) -> Result<Option<Extracted<'a>>, TimestampError> {
        let Some(captures) = self.pattern.captures(line) else {
            return Ok(None);
        };
        let Some(ts) = captures.name("ts") else {
            return Ok(None);
        };
        let ts_value = ts.as_str();

        let time = match &self.format {
            TimestampFormat::Iso8601 => ParsedTime::Instant(self.parse_iso8601(ts_value)?),
            TimestampFormat::Epoch => ParsedTime::Instant(self.parse_epoch(ts_value)?),
            TimestampFormat::EpochMs => ParsedTime::Instant(self.parse_epoch_ms(ts_value)?),
            TimestampFormat::Strptime(fmt) => {
                ParsedTime::Instant(self.parse_strptime(ts_value, fmt)?)
            }
            TimestampFormat::TimeOfDay(fmt) => {
                ParsedTime::TimeOfDay(NaiveTime::parse_from_str(ts_value, fmt).map_err(|e| {
                    TimestampError::ParseError {
                        value: ts_value.to_string(),
                        format: fmt.clone(),
                        source: Box::new(e),
                    }
                })?)
            }
        };

        Ok(Some(Extracted {
            time,
            level: captures.name("level").map(|m| m.as_str()),
            ts_end: ts.end(),
        }))
    }

    fn parse_iso8601(&self, value: &str) -> Result<DateTime<Utc>, TimestampError> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| TimestampError::ParseError {
                value: value.to_string(),
                format: "iso8601".to_string(),
                source: Box::new(e),
            })
    }

    fn parse_epoch(&self, value: &str) -> Result<DateTime<Utc>, TimestampError> {
        let seconds: i64 =
            value
                .parse()
                .map_err(|e: std::num::ParseIntError| TimestampError::ParseError {
                    value: value.to_string(),
                    format: "epoch".to_string(),
                    source: Box::new(e),
                })?;

        Utc.timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| out_of_range(value, "epoch"))
    }

    fn parse_epoch_ms(&self, value: &str) -> Result<DateTime<Utc>, TimestampError> {
        let millis: i64 =
            value
                .parse()
                .map_err(|e: std::num::ParseIntError| TimestampError::ParseError {
                    value: value.to_string(),
                    format: "epoch_ms".to_string(),
                    source: Box::new(e),
                })?;

        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| out_of_range(value, "epoch_ms"))
    }

    fn parse_strptime(&self, value: &str, format: &str) -> Result<DateTime<Utc>, TimestampError> {
        if format.contains("%z") || format.contains("%Z") || format.contains("%:z") {
            DateTime::parse_from_str(value, format)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| TimestampError::ParseError {
                    value: value.to_string(),
                    format: format.to_string(),
                    source: Box::new(e),
                })
        } else {
            // Naive wall-clock time in the configured timezone
            NaiveDateTime::parse_from_str(value, format)
                .map(|ndt| self.timezone.to_utc(&ndt))
                .map_err(|e| TimestampError::ParseError {
                    value: value.to_string(),
                    format: format.to_string(),
                    source: Box::new(e),
                })
        }
    }
}

fn out_of_range(value: &str, format: &str) -> TimestampError {
    TimestampError::ParseError {
        value: value.to_string(),
        format: format.to_string(),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "timestamp out of range",
        )),
    }
}
