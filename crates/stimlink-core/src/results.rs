//! Trial results
//!
//! One [`ResultRecord`] per completed trial, handed to an abstract
//! [`ResultsSink`]. The record owns the CSV line shape; sinks only append.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// One completed-trial observation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Device identity, e.g. `sDRT_COM3` or `wDRT_3`
    pub device_id: String,
    /// Experimental condition label
    pub condition_label: String,
    /// Host receive time, UTC seconds with millisecond precision
    pub host_timestamp: f64,
    /// Trial number within the experiment, monotonically increasing
    pub trial_number: u32,
    /// Reaction time in milliseconds; `-1` means no response
    pub reaction_time_ms: i64,
    /// Debounced responses during the trial
    pub response_count: u32,
    /// Last battery percentage reported by the device, 0 until one arrives
    pub battery_percent: u8,
    /// Device-side UTC seconds at trial end
    pub device_timestamp: u64,
}

impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{:.3},{},{},{},{},{}",
            self.device_id,
            self.condition_label,
            self.host_timestamp,
            self.trial_number,
            self.reaction_time_ms,
            self.response_count,
            self.battery_percent,
            self.device_timestamp,
        )
    }
}

/// Destination for completed-trial records
pub trait ResultsSink: Send + Sync {
    /// Append one record. Failures are the sink's own concern to report;
    /// callers log and continue.
    fn append(&self, record: &ResultRecord) -> io::Result<()>;
}

/// Appends records as CSV lines to one file, writing the header when the
/// file is first created
pub struct FileSink {
    path: PathBuf,
    header: &'static str,
}

impl FileSink {
    /// Sink appending to `path` with the given header line
    pub fn new(path: impl Into<PathBuf>, header: &'static str) -> Self {
        Self {
            path: path.into(),
            header,
        }
    }

    /// Target path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultsSink for FileSink {
    fn append(&self, record: &ResultRecord) -> io::Result<()> {
        let new_file = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if new_file {
            writeln!(file, "{}", self.header)?;
        }
        writeln!(file, "{record}")
    }
}

/// In-memory sink for tests and headless use
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<ResultRecord>>,
}

impl MemorySink {
    /// New empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything appended so far
    pub fn records(&self) -> Vec<ResultRecord> {
        self.records.lock().expect("sink poisoned").clone()
    }
}

impl ResultsSink for MemorySink {
    fn append(&self, record: &ResultRecord) -> io::Result<()> {
        self.records.lock().expect("sink poisoned").push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> ResultRecord {
        ResultRecord {
            device_id: "sDRT_COM3".to_string(),
            condition_label: "baseline".to_string(),
            host_timestamp: 1700000000.123,
            trial_number: 4,
            reaction_time_ms: 512,
            response_count: 2,
            battery_percent: 87,
            device_timestamp: 1700000001,
        }
    }

    #[test]
    fn test_csv_shape() {
        assert_eq!(
            sample().to_string(),
            "sDRT_COM3,baseline,1700000000.123,4,512,2,87,1700000001"
        );
    }

    #[test]
    fn test_no_response_sentinel() {
        let mut record = sample();
        record.reaction_time_ms = -1;
        assert!(record.to_string().contains(",-1,"));
    }

    #[test]
    fn test_record_serializes_for_host_persistence() {
        let json = serde_json::to_string(&sample()).unwrap();
        let back: ResultRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_file_sink_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sDRT.txt");
        let sink = FileSink::new(&path, "Device_Unit,Label");
        sink.append(&sample()).unwrap();
        sink.append(&sample()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Device_Unit,Label");
        assert_eq!(lines[1], lines[2]);
    }
}
