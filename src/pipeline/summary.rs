use crate::batch::Batch;
use crate::sink::{Delivery, RejectedEventsInfo};
use crate::source::reader::Discontinuity;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// What one pass over one physical file did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSummary {
    pub file: PathBuf,
    pub log_group: String,
    pub log_stream: String,
    pub log_date: NaiveDate,
    pub start_offset: u64,
    pub end_offset: u64,
    pub events_shipped: usize,
    pub batches_shipped: usize,
    /// Events dropped by a manual `--skip`
    #[serde(default)]
    pub events_skipped: u64,
    /// Events truncated to fit the per-event limit
    pub oversized_events: usize,
    pub malformed_lines: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discontinuity: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedEventsInfo>,
}

impl PassSummary {
    pub fn new(
        file: &Path,
        log_group: &str,
        log_stream: &str,
        log_date: NaiveDate,
        start_offset: u64,
        discontinuity: Option<Discontinuity>,
    ) -> Self {
        Self {
            file: file.to_path_buf(),
            log_group: log_group.to_string(),
            log_stream: log_stream.to_string(),
            log_date,
            start_offset,
            end_offset: start_offset,
            events_shipped: 0,
            batches_shipped: 0,
            events_skipped: 0,
            oversized_events: 0,
            malformed_lines: 0,
            discontinuity: discontinuity.map(|d| match d {
                Discontinuity::Rotated { previous_offset } => {
                    format!("rotated (previous offset {})", previous_offset)
                }
                Discontinuity::Truncated { previous_offset } => {
                    format!("truncated (previous offset {})", previous_offset)
                }
            }),
            rejected: Vec::new(),
        }
    }

    pub fn record(&mut self, batch: &Batch, delivery: &Delivery) {
        self.batches_shipped += 1;
        self.events_shipped += delivery.events;
        self.oversized_events += delivery.truncated_events;
        self.end_offset = batch.end_offset();
        if let Some(rejected) = &delivery.rejected {
            self.rejected.push(rejected.clone());
        }
    }
}

/// Result record of one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: i64,
    pub passes: Vec<PassSummary>,
}

impl RunSummary {
    pub fn new(started_at: DateTime<Utc>, passes: Vec<PassSummary>) -> Self {
        let finished_at = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            host: local_host(),
            started_at,
            finished_at,
            elapsed_ms: (finished_at - started_at).num_milliseconds(),
            passes,
        }
    }

    pub fn events_shipped(&self) -> usize {
        self.passes.iter().map(|p| p.events_shipped).sum()
    }

    pub fn batches_shipped(&self) -> usize {
        self.passes.iter().map(|p| p.batches_shipped).sum()
    }

    /// Append as one JSON line
    pub fn append_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let line = serde_json::to_string(self)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        file.sync_data()
    }
}

fn local_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pass(events: usize) -> PassSummary {
        let mut pass = PassSummary::new(
            Path::new("/var/log/server.log"),
            "group",
            "dv-server.log-2021-12-21",
            NaiveDate::from_ymd_opt(2021, 12, 21).unwrap(),
            0,
            Some(Discontinuity::Truncated { previous_offset: 99 }),
        );
        pass.events_shipped = events;
        pass.batches_shipped = 1;
        pass
    }

    #[test]
    fn test_totals_across_passes() {
        let summary = RunSummary::new(Utc::now(), vec![pass(3), pass(4)]);

        assert_eq!(summary.events_shipped(), 7);
        assert_eq!(summary.batches_shipped(), 2);
        assert!(summary.elapsed_ms >= 0);
    }

    #[test]
    fn test_append_writes_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs/summary.jsonl");

        RunSummary::new(Utc::now(), vec![pass(1)]).append_to(&path).unwrap();
        RunSummary::new(Utc::now(), vec![pass(2)]).append_to(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<RunSummary> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].passes[0].events_shipped, 2);
        assert_eq!(
            lines[0].passes[0].discontinuity.as_deref(),
            Some("truncated (previous offset 99)")
        );
    }
}
