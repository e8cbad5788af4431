// src/telemetry.rs
//
// JSONL step log and best-configuration search.
//
// One line per environment step:
//   {"step", "mode", "config", "metrics", "reward", "components", "failed",
//    "reason", "attempts", "cleanups", "elapsed_ms"}
//
// `best_record` scans such a log for the highest-reward configuration, which
// the binary can export as a sectioned YAML document.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::ConfigDocument;
use crate::config::EnvMode;
use crate::observation::PerfMetrics;
use crate::reward::RewardComponents;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u64,
    pub mode: EnvMode,
    /// Configuration deployed for this step (empty for the baseline run or
    /// when the action could not be decoded).
    pub config: ConfigDocument,
    /// Measured metrics; None for failed steps.
    pub metrics: Option<PerfMetrics>,
    pub reward: f64,
    #[serde(default)]
    pub components: Option<RewardComponents>,
    pub failed: bool,
    #[serde(default)]
    pub reason: Option<String>,
    pub attempts: u32,
    pub cleanups: u32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to open step log '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read step log '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Append-only JSONL sink. Disabled sinks accept and drop records.
pub struct StepTelemetry {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    written: u64,
}

impl Default for StepTelemetry {
    fn default() -> Self {
        Self::disabled()
    }
}

impl StepTelemetry {
    pub fn disabled() -> Self {
        Self {
            path: None,
            writer: None,
            written: 0,
        }
    }

    /// Append to `path`, creating it if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TelemetryError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| TelemetryError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            writer: Some(BufWriter::new(file)),
            written: 0,
        })
    }

    /// Open `path` if given; on failure log and continue disabled.
    pub fn open_or_disabled(path: Option<&Path>) -> Self {
        match path {
            Some(p) => Self::open(p).unwrap_or_else(|err| {
                warn!(error = %err, "step telemetry disabled");
                Self::disabled()
            }),
            None => Self::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Write one record and flush. Write errors are logged, not returned.
    pub fn record(&mut self, record: &StepRecord) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(err) => {
                warn!(step = record.step, error = %err, "failed to serialize step record");
                return;
            }
        };
        let result = writeln!(writer, "{line}").and_then(|_| writer.flush());
        match result {
            Ok(()) => self.written += 1,
            Err(err) => warn!(step = record.step, error = %err, "failed to write step record"),
        }
    }
}

/// Highest-reward successful record in a step log (earliest wins ties).
///
/// Malformed lines are skipped with a warning.
pub fn best_record<P: AsRef<Path>>(path: P) -> Result<Option<StepRecord>, TelemetryError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let file = File::open(path).map_err(|source| TelemetryError::Open {
        path: display.clone(),
        source,
    })?;

    let mut best: Option<StepRecord> = None;
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| TelemetryError::Read {
            path: display.clone(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: StepRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                warn!(line = lineno + 1, error = %err, "skipping malformed step record");
                continue;
            }
        };
        if record.failed || !record.reward.is_finite() {
            continue;
        }
        if best.as_ref().map_or(true, |b| record.reward > b.reward) {
            best = Some(record);
        }
    }

    if let Some(b) = &best {
        debug!(step = b.step, reward = b.reward, "best step found");
    }
    Ok(best)
}
