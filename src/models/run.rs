use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Non-terminal stage of a per-image pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Encoding,
    Extracting,
    Validating,
    Persisting,
}

/// Error kind recorded against a failed image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq)]
pub enum FailureKind {
    NotFound,
    UnsupportedFormat,
    /// The image exists but could not be read.
    ReadError,
    ExtractionParseError,
    #[strum(serialize = "TransportError(rate_limited_exhausted)")]
    RateLimitedExhausted,
    #[strum(serialize = "TransportError(transport_failed)")]
    TransportFailed,
    #[strum(serialize = "TransportError(non_retriable)")]
    NonRetriable,
    SchemaViolation,
    PersistError,
    /// Another image already writes the same label file.
    OutputCollision,
}

impl FailureKind {
    /// Failures that would repeat for every remaining image.
    pub fn is_fatal(self) -> bool {
        matches!(self, FailureKind::NonRetriable)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Labeled { output: PathBuf },
    Skipped,
    Failed {
        stage: Stage,
        kind: FailureKind,
        reason: String,
    },
    /// Not started because the run was stopped.
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageOutcome {
    pub id: String,
    pub path: PathBuf,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

/// Aggregate result of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Outcomes in enumeration order.
    pub outcomes: Vec<ImageOutcome>,
    /// Set when a fatal error stopped the run before every image was attempted.
    pub aborted: Option<String>,
    pub elapsed_ms: u64,
}

impl RunResult {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            processed: 0,
            skipped: 0,
            failed: 0,
            cancelled: 0,
            outcomes: Vec::new(),
            aborted: None,
            elapsed_ms: 0,
        }
    }

    pub fn record(&mut self, outcome: ImageOutcome) {
        match outcome.status {
            OutcomeStatus::Labeled { .. } => self.processed += 1,
            OutcomeStatus::Skipped => self.skipped += 1,
            OutcomeStatus::Failed { .. } => self.failed += 1,
            OutcomeStatus::Cancelled => self.cancelled += 1,
        }
        self.outcomes.push(outcome);
    }

    pub fn finish(mut self, elapsed: Duration) -> Self {
        self.elapsed_ms = elapsed.as_millis() as u64;
        self
    }

    /// Failed outcomes as (image id, kind, reason).
    pub fn failures(&self) -> impl Iterator<Item = (&str, FailureKind, &str)> {
        self.outcomes.iter().filter_map(|o| match &o.status {
            OutcomeStatus::Failed { kind, reason, .. } => Some((o.id.as_str(), *kind, reason.as_str())),
            _ => None,
        })
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.aborted.is_none()
    }

    pub fn success_rate(&self) -> f64 {
        let attempted = self.processed + self.failed;
        if attempted == 0 {
            0.0
        } else {
            self.processed as f64 / attempted as f64 * 100.0
        }
    }
}

/// Human-readable duration: "1h 2m 3s", "2m 3s" or "3s".
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, rest) = (total / 3600, total % 3600);
    let (minutes, secs) = (rest / 60, rest % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}
