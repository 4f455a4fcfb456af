pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# DV2CW CONFIGURATION
# =============================================================================
# dv2cw ships a Data Virtuality server.log to a CloudWatch-Logs-compatible
# ingestion API, one bounded pass per invocation. Run it from cron under an
# exclusive lock, e.g.:
#
#   */5 * * * * flock -n /tmp/dv2cw.lock dv2cw /opt/datavirtuality/dvserver/standalone/log/server.log
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/dv2cw/config.yml
#   3. /etc/dv2cw/config.yml
#
# Values may reference environment variables as $env{NAME}; commented-out
# lines are not checked.

# =============================================================================
# SOURCE
# =============================================================================
source:
  timestamp:
    # Regex with a named group 'ts' (required) and 'level' (optional).
    # Lines that do not match are continuation lines of the previous event.
    pattern: '^(?P<ts>\d{2}:\d{2}:\d{2},\d{3})\s+(?:(?P<level>TRACE|DEBUG|INFO|WARN|WARNING|ERROR|FATAL|SEVERE)\b)?'
    # strptime format, 'iso8601', 'epoch' or 'epoch_ms'. Time-only formats are
    # anchored to the log date (today, or the date of a rotated file).
    format: '%H:%M:%S,%3f'
    # 'local', 'utc', a fixed offset like '+01:00' or a zone name like
    # 'Europe/Berlin' (dv2cw --list-timezones prints them all)
    timezone: local
  # Suffix of rotated files, separator included: server.log.2021-12-21.
  # Use '-%Y%m%d' for logrotate's dateext (server.log-20211221).
  rotated_suffix_format: '.%Y-%m-%d'

# =============================================================================
# DESTINATION
# =============================================================================
destination:
  # 'http' (CloudWatch Logs JSON API) or 'stdout' (dry run)
  type: http
  endpoint: $env{DV2CW_ENDPOINT}
  log_group: DataVirtualityETLLogGroup
  # {date} is replaced with the log date (YYYY-MM-DD)
  log_stream: 'dv-server.log-{date}'
  # One JSON summary per run is posted here (optional)
  summary_stream: DV_2_CW_logger
  create_missing_stream: true
  # Per-request timeout
  timeout: 10s
  # Extra headers sent with every request (signing proxy, emulator auth)
  headers: {}

# =============================================================================
# BATCHING (PutLogEvents limits)
# =============================================================================
batch:
  max_events: 10000
  max_bytes: 1048576
  event_overhead_bytes: 26
  max_event_bytes: 262118
  max_span: 24h

# =============================================================================
# RETRY (throttling and transient failures)
# =============================================================================
retry:
  max_attempts: 5
  initial_backoff: 200ms
  max_backoff: 10s

# =============================================================================
# STATE
# =============================================================================
state:
  # Read position per log file, replaced atomically after every shipped batch
  cursor_path: /var/lib/dv2cw/cursors.json
  # Append one JSON line per run (optional)
  # summary_log: /var/lib/dv2cw/results.jsonl
"#
    .to_string()
}
