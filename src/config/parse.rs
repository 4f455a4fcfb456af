use super::types::*;
use crate::config::{expand_env_vars, expand_tilde};
use crate::sink::shipper::TRUNCATION_MARKER;
use crate::source::timestamp::TimestampExtractor;
use regex::Regex;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parse and validate a YAML config document
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    // Expand environment variables in the YAML string before parsing
    let yaml_string = expand_env_vars(yaml);

    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;

    expand_paths(&mut config);

    validate_config(&config)?;

    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let re = Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    let mut unexpanded_vars: Vec<String> = yaml_string
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(|line| re.captures_iter(line))
        .map(|cap| cap[1].to_string())
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with the actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

fn expand_paths(config: &mut Config) {
    config.state.cursor_path = expand_tilde(&config.state.cursor_path);
    if let Some(summary_log) = config.state.summary_log.take() {
        config.state.summary_log = Some(expand_tilde(&summary_log));
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_source(&config.source, &mut errors);
    validate_destination(&config.destination, &mut errors);
    validate_batch(&config.batch, &mut errors);

    if config.retry.max_attempts == 0 {
        errors.push("retry.max_attempts must be at least 1".to_string());
    }
    if config.retry.initial_backoff > config.retry.max_backoff {
        errors.push("retry.initial_backoff must not exceed retry.max_backoff".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_source(source: &SourceConfig, errors: &mut Vec<String>) {
    let ts = &source.timestamp;
    if let Err(e) = TimestampExtractor::new(&ts.pattern, &ts.format, ts.timezone) {
        errors.push(format!("source.timestamp: {}", e));
    }
    if !source.rotated_suffix_format.contains('%') {
        errors.push(format!(
            "source.rotated_suffix_format '{}' must contain a date specifier like %Y",
            source.rotated_suffix_format
        ));
    }
}

fn validate_destination(destination: &DestinationConfig, errors: &mut Vec<String>) {
    if destination.sink_type == SinkType::Http {
        match destination.endpoint.as_deref() {
            None | Some("") => {
                errors.push("destination.endpoint is required for type 'http'".to_string())
            }
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                errors.push(format!(
                    "destination.endpoint '{}' must start with http:// or https://",
                    url
                ))
            }
            Some(_) => {}
        }
    }

    if destination.log_group.is_empty() {
        errors.push("destination.log_group cannot be empty".to_string());
    }
    if destination.log_stream.is_empty() {
        errors.push("destination.log_stream cannot be empty".to_string());
    }
    if let Some(summary) = &destination.summary_stream {
        if summary.is_empty() {
            errors.push("destination.summary_stream cannot be empty when set".to_string());
        }
    }
    if destination.timeout.is_zero() {
        errors.push("destination.timeout must be greater than zero".to_string());
    }
}

fn validate_batch(batch: &BatchConfig, errors: &mut Vec<String>) {
    if batch.max_events == 0 {
        errors.push("batch.max_events must be at least 1".to_string());
    }
    if batch.max_bytes <= batch.event_overhead_bytes {
        errors.push(format!(
            "batch.max_bytes ({}) must exceed batch.event_overhead_bytes ({})",
            batch.max_bytes, batch.event_overhead_bytes
        ));
    }
    if batch.max_event_bytes <= TRUNCATION_MARKER.len() {
        errors.push(format!(
            "batch.max_event_bytes must exceed {} bytes to fit the truncation marker",
            TRUNCATION_MARKER.len()
        ));
    }
    if batch.max_span.is_zero() {
        errors.push("batch.max_span must be greater than zero".to_string());
    }
}
