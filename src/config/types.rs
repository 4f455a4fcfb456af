use chrono::{DateTime, FixedOffset, Local, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub timestamp: TimestampConfig,
    /// chrono format of the suffix appended to rotated files, separator
    /// included: `.%Y-%m-%d` for `server.log.2021-12-21`, `-%Y%m%d` for
    /// logrotate's dateext
    #[serde(default = "default_rotated_suffix_format")]
    pub rotated_suffix_format: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            timestamp: TimestampConfig::default(),
            rotated_suffix_format: default_rotated_suffix_format(),
        }
    }
}

fn default_rotated_suffix_format() -> String {
    ".%Y-%m-%d".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampConfig {
    /// Regex with a required `ts` group and an optional `level` group
    #[serde(default = "default_timestamp_pattern")]
    pub pattern: String,
    #[serde(default = "default_timestamp_format")]
    pub format: String,
    #[serde(default)]
    pub timezone: TimeZoneSpec,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            pattern: default_timestamp_pattern(),
            format: default_timestamp_format(),
            timezone: TimeZoneSpec::default(),
        }
    }
}

/// Matches the Data Virtuality / WildFly `server.log` prefix:
/// `00:58:09,612 INFO  [org.teiid.RUNTIME] (main) ...`
pub fn default_timestamp_pattern() -> String {
    r"^(?P<ts>\d{2}:\d{2}:\d{2},\d{3})\s+(?:(?P<level>TRACE|DEBUG|INFO|WARN|WARNING|ERROR|FATAL|SEVERE)\b)?"
        .to_string()
}

pub fn default_timestamp_format() -> String {
    "%H:%M:%S,%3f".to_string()
}

/// Timezone used to interpret timestamps that carry no offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeZoneSpec {
    #[default]
    Local,
    Utc,
    Fixed(FixedOffset),
    /// IANA zone such as `Europe/Berlin`, with its DST rules
    Named(Tz),
}

impl TimeZoneSpec {
    pub fn parse(value: &str) -> Result<Self, String> {
        let trimmed = value.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "local" => return Ok(TimeZoneSpec::Local),
            "utc" | "z" => return Ok(TimeZoneSpec::Utc),
            _ => {}
        }
        if let Some(offset) = parse_offset(trimmed) {
            return Ok(TimeZoneSpec::Fixed(offset));
        }
        trimmed.parse::<Tz>().map(TimeZoneSpec::Named).map_err(|_| {
            format!(
                "invalid timezone '{}': expected 'local', 'utc', an offset like '+01:00' \
                 or a zone name like 'Europe/Berlin' (see --list-timezones)",
                value
            )
        })
    }

    /// Interpret a naive wall-clock time in this timezone.
    ///
    /// Ambiguous local times (DST fall-back) resolve to the earlier instant;
    /// non-existent ones (DST spring-forward gap) are shifted by one hour.
    pub fn to_utc(&self, naive: &NaiveDateTime) -> DateTime<Utc> {
        match self {
            TimeZoneSpec::Utc => Utc.from_utc_datetime(naive),
            TimeZoneSpec::Fixed(offset) => wall_clock_to_utc(offset, naive),
            TimeZoneSpec::Local => wall_clock_to_utc(&Local, naive),
            TimeZoneSpec::Named(tz) => wall_clock_to_utc(tz, naive),
        }
    }

    pub fn today(&self) -> chrono::NaiveDate {
        self.date_of(Utc::now())
    }

    pub fn date_of(&self, instant: DateTime<Utc>) -> chrono::NaiveDate {
        match self {
            TimeZoneSpec::Local => instant.with_timezone(&Local).date_naive(),
            TimeZoneSpec::Utc => instant.date_naive(),
            TimeZoneSpec::Fixed(offset) => instant.with_timezone(offset).date_naive(),
            TimeZoneSpec::Named(tz) => instant.with_timezone(tz).date_naive(),
        }
    }
}

fn wall_clock_to_utc<Z: TimeZone>(zone: &Z, naive: &NaiveDateTime) -> DateTime<Utc> {
    match zone.from_local_datetime(naive) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = *naive + chrono::Duration::hours(1);
            zone.from_local_datetime(&shifted)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(naive))
        }
    }
}

/// Every IANA zone name accepted as `source.timestamp.timezone`
pub fn available_timezones() -> impl Iterator<Item = &'static str> {
    chrono_tz::TZ_VARIANTS.iter().map(|tz| tz.name())
}

/// Parses `+HH:MM`, `-HH:MM`, `+HHMM` or `+HH`.
fn parse_offset(value: &str) -> Option<FixedOffset> {
    let (sign, rest) = match value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

impl std::fmt::Display for TimeZoneSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeZoneSpec::Local => write!(f, "local"),
            TimeZoneSpec::Utc => write!(f, "utc"),
            TimeZoneSpec::Fixed(offset) => write!(f, "{}", offset),
            TimeZoneSpec::Named(tz) => write!(f, "{}", tz.name()),
        }
    }
}

impl Serialize for TimeZoneSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TimeZoneSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TimeZoneSpec::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    #[serde(rename = "type", default)]
    pub sink_type: SinkType,
    /// Base URL of the log-ingestion API (required for `http`)
    pub endpoint: Option<String>,
    #[serde(default = "default_log_group")]
    pub log_group: String,
    /// Stream name; `{date}` is replaced with the pass's log date
    #[serde(default = "default_log_stream")]
    pub log_stream: String,
    /// Stream receiving one run summary per run that shipped something
    pub summary_stream: Option<String>,
    #[serde(default = "default_true")]
    pub create_missing_stream: bool,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Extra request headers (signing proxy, emulator credentials)
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_log_group() -> String {
    "DataVirtualityETLLogGroup".to_string()
}

fn default_log_stream() -> String {
    "dv-server.log-{date}".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkType {
    #[default]
    Http,
    Stdout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_event_overhead")]
    pub event_overhead_bytes: usize,
    #[serde(default = "default_max_event_bytes")]
    pub max_event_bytes: usize,
    #[serde(default = "default_max_span", with = "humantime_serde")]
    pub max_span: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            max_bytes: default_max_bytes(),
            event_overhead_bytes: default_event_overhead(),
            max_event_bytes: default_max_event_bytes(),
            max_span: default_max_span(),
        }
    }
}

fn default_max_events() -> usize {
    10_000
}

fn default_max_bytes() -> usize {
    1_048_576
}

fn default_event_overhead() -> usize {
    26
}

fn default_max_event_bytes() -> usize {
    256 * 1024 - 26
}

fn default_max_span() -> Duration {
    Duration::from_secs(24 * 3600)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_cursor_path")]
    pub cursor_path: PathBuf,
    /// Append one JSON line per run here
    pub summary_log: Option<PathBuf>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            cursor_path: default_cursor_path(),
            summary_log: None,
        }
    }
}

fn default_cursor_path() -> PathBuf {
    PathBuf::from("/var/lib/dv2cw/cursors.json")
}
