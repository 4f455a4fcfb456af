use dv2cw::config::{generate::generate_starter_config, load_config, ConfigError, SinkType, TimeZoneSpec};
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_generated_config_is_valid() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");

    // The starter config reads the endpoint from the environment
    let content = generate_starter_config().replace("$env{DV2CW_ENDPOINT}", "https://logs.example.com");
    fs::write(&config_path, content).unwrap();

    let config = load_config(&config_path).expect("Generated config should be valid");

    assert_eq!(config.destination.sink_type, SinkType::Http);
    assert_eq!(config.destination.endpoint.as_deref(), Some("https://logs.example.com"));
    assert_eq!(config.destination.log_group, "DataVirtualityETLLogGroup");
    assert_eq!(config.destination.log_stream, "dv-server.log-{date}");
    assert_eq!(config.destination.summary_stream.as_deref(), Some("DV_2_CW_logger"));
    assert_eq!(config.batch.max_events, 10_000);
    assert_eq!(config.batch.max_bytes, 1_048_576);
    assert_eq!(config.batch.max_span, Duration::from_secs(24 * 3600));
    assert_eq!(config.retry.initial_backoff, Duration::from_millis(200));
    assert_eq!(config.source.timestamp.timezone, TimeZoneSpec::Local);
    assert!(config.state.summary_log.is_none());
}

#[test]
fn test_unset_env_var_reported() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    fs::write(
        &config_path,
        "destination:\n  endpoint: $env{DV2CW_TEST_SURELY_UNSET_VAR}\n",
    )
    .unwrap();

    let error = load_config(&config_path).unwrap_err();

    match error {
        ConfigError::Validation(message) => {
            assert!(message.contains("DV2CW_TEST_SURELY_UNSET_VAR"))
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_all_problems_reported_together() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    fs::write(
        &config_path,
        r#"
source:
  timestamp:
    pattern: '^(?P<time>\d+)'
destination:
  type: http
  log_group: ''
batch:
  max_events: 0
retry:
  max_attempts: 0
"#,
    )
    .unwrap();

    let error = load_config(&config_path).unwrap_err();

    match error {
        ConfigError::ValidationList(errors) => {
            assert_eq!(errors.len(), 5, "{:?}", errors);
            assert!(errors.iter().any(|e| e.contains("'ts'")));
            assert!(errors.iter().any(|e| e.contains("endpoint")));
            assert!(errors.iter().any(|e| e.contains("log_group")));
            assert!(errors.iter().any(|e| e.contains("max_events")));
            assert!(errors.iter().any(|e| e.contains("max_attempts")));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_destination_is_required() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");
    fs::write(&config_path, "batch:\n  max_events: 10\n").unwrap();

    assert!(load_config(&config_path).is_err());
}
