//! Per-attempt records handed to the persistence collaborator (write-only)

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::orchestrator::{FailureReason, Phase, RecoveryStrategy};
use crate::types::{Answer, FillSummary, Provenance};

/// Answers counted by where their value came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceCounts {
    pub cache: usize,
    pub service: usize,
    pub fallback: usize,
    pub collaborator: usize,
}

impl ProvenanceCounts {
    pub fn from_answers(answers: &[Answer]) -> Self {
        let mut counts = Self::default();
        for answer in answers {
            match answer.provenance {
                Provenance::Cache => counts.cache += 1,
                Provenance::Service => counts.service += 1,
                Provenance::Fallback => counts.fallback += 1,
                Provenance::Collaborator => counts.collaborator += 1,
            }
        }
        counts
    }
}

/// One phase execution within an attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub attempt: u32,
    /// `None` when the phase advanced normally
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub at: DateTime<Utc>,
}

/// Everything that happened between two recovery decisions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub session_id: Uuid,
    /// 1-based attempt number; each RECOVER cycle starts a new attempt
    pub attempt: u32,
    pub url: String,
    pub phases: Vec<PhaseRecord>,
    pub fill: FillSummary,
    pub provenance: ProvenanceCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RecoveryStrategy>,
    /// Phase the session ended in, for the final record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<Phase>,
    pub recorded_at: DateTime<Utc>,
}

/// Receiver of attempt records
pub trait RecordSink: Send + Sync {
    fn record(&self, record: &AttemptRecord) -> Result<()>;
}

/// Appends records as JSON lines
pub struct JsonlRecordSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlRecordSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open record file '{}'", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }
}

impl RecordSink for JsonlRecordSink {
    fn record(&self, record: &AttemptRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        writeln!(file, "{}", line)
            .with_context(|| format!("Failed to append to '{}'", self.path.display()))?;
        debug!("Recorded attempt {} of session {}", record.attempt, record.session_id);
        Ok(())
    }
}

/// Keeps records in memory
#[derive(Default)]
pub struct MemoryRecordSink {
    records: Mutex<Vec<AttemptRecord>>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AttemptRecord> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl RecordSink for MemoryRecordSink {
    fn record(&self, record: &AttemptRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record.clone());
        Ok(())
    }
}

/// Discards records
pub struct NullRecordSink;

impl RecordSink for NullRecordSink {
    fn record(&self, _record: &AttemptRecord) -> Result<()> {
        Ok(())
    }
}
