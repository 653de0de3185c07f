use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::models::image::ImageRef;
use crate::models::label::LabelRecord;
use crate::models::run::{format_duration, FailureKind, ImageOutcome, OutcomeStatus, RunResult, Stage};
use crate::services::encoder::{self, has_image_extension, EncodeError};
use crate::services::engine::{EngineError, ExtractionContext, LabelEngine};
use crate::services::transport::TransportError;
use crate::services::validation::CompiledSchema;

/// Run-level settings for the labeling pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub data_dir: PathBuf,
    /// Images processed concurrently.
    pub workers: usize,
    pub language: String,
    pub max_output_tokens: u32,
    /// Directory names (case-insensitive) never descended into.
    pub skip_dirs: Vec<String>,
    /// Images larger than this fail at the encoding stage.
    pub max_image_bytes: u64,
}

/// Walks a data directory and labels every image that has no label yet.
///
/// Per image: Encoding -> Extracting -> Validating -> Persisting. A failure
/// at any stage is recorded against the image and the run moves on; only a
/// non-retriable transport failure stops the remaining images.
pub struct Pipeline {
    engine: Arc<dyn LabelEngine>,
    schema: Arc<CompiledSchema>,
    options: PipelineOptions,
    cancel: CancellationToken,
}

/// Failure of one image, attributed to the stage it happened in.
#[derive(Debug, Clone)]
struct StageFailure {
    stage: Stage,
    kind: FailureKind,
    reason: String,
}

impl StageFailure {
    fn new(stage: Stage, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            reason: reason.into(),
        }
    }

    fn encoding(e: EncodeError) -> Self {
        let kind = match e {
            EncodeError::NotFound(_) => FailureKind::NotFound,
            EncodeError::UnsupportedFormat { .. } | EncodeError::Empty(_) | EncodeError::TooLarge { .. } => {
                FailureKind::UnsupportedFormat
            }
            EncodeError::Io(_) => FailureKind::ReadError,
        };
        Self::new(Stage::Encoding, kind, e.to_string())
    }

    fn extracting(e: EngineError) -> Self {
        let kind = match &e {
            EngineError::Parse { .. } => FailureKind::ExtractionParseError,
            EngineError::Transport(TransportError::RateLimitedExhausted { .. }) => {
                FailureKind::RateLimitedExhausted
            }
            EngineError::Transport(TransportError::TransportFailed { .. }) => FailureKind::TransportFailed,
            EngineError::Transport(TransportError::NonRetriable(_)) => FailureKind::NonRetriable,
        };
        Self::new(Stage::Extracting, kind, e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Data directory {0} not found")]
    DataDirMissing(PathBuf),
}

impl Pipeline {
    pub fn new(engine: Arc<dyn LabelEngine>, schema: Arc<CompiledSchema>, options: PipelineOptions) -> Self {
        Self {
            engine,
            schema,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned token to stop the run between images.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Enumerate images under the data directory in lexicographic path order.
    pub fn discover(&self) -> Result<Vec<ImageRef>, PipelineError> {
        let root = &self.options.data_dir;
        if !root.is_dir() {
            return Err(PipelineError::DataDirMissing(root.clone()));
        }

        let skip_dirs = &self.options.skip_dirs;
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || !skip_dirs
                        .iter()
                        .any(|skip| entry.file_name().to_string_lossy().trim().eq_ignore_ascii_case(skip))
            });

        let mut paths = Vec::new();
        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() && has_image_extension(entry.path()) => {
                    paths.push(entry.into_path());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable directory entry"),
            }
        }
        paths.sort();

        Ok(paths
            .into_iter()
            .map(|path| {
                let image = ImageRef::new(root, path);
                let hint = if image.id.contains('/') {
                    image.parent_name().and_then(|dir| self.schema.hint_for(&dir))
                } else {
                    None
                };
                image.with_hint(hint)
            })
            .collect())
    }

    /// Process every image under the data directory.
    pub async fn run(&self) -> Result<RunResult, PipelineError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let images = self.discover()?;

        let total = images.len();
        let owners = label_owners(&images);
        let pending = images
            .iter()
            .zip(&owners)
            .filter(|(image, owner)| owner.is_none() && !image.already_labeled)
            .count();
        info!(
            run_id = %run_id,
            data_dir = %self.options.data_dir.display(),
            engine = self.engine.name(),
            total,
            pending,
            workers = self.options.workers,
            "Starting labeling run"
        );

        // Stopping the child leaves the caller's token untouched.
        let stop = self.cancel.child_token();
        let aborted: OnceLock<String> = OnceLock::new();
        let position = AtomicUsize::new(0);
        let finished = AtomicUsize::new(0);

        let mut outcomes: Vec<(usize, ImageOutcome)> = stream::iter(images.into_iter().zip(owners).enumerate())
            .map(|(index, (image, owner))| {
                let (stop, aborted, position, finished) = (&stop, &aborted, &position, &finished);
                async move {
                    let status = if let Some(owner) = owner {
                        let reason = format!(
                            "Label path {} already belongs to {}",
                            image.label_path.display(),
                            owner.display()
                        );
                        warn!(image = %image.id, error = %reason, "Output collision");
                        metrics::counter!("labels_failed_total", "kind" => FailureKind::OutputCollision.to_string())
                            .increment(1);
                        OutcomeStatus::Failed {
                            stage: Stage::Persisting,
                            kind: FailureKind::OutputCollision,
                            reason,
                        }
                    } else if image.already_labeled {
                        debug!(image = %image.id, "Label exists, skipping");
                        metrics::counter!("labels_skipped_total").increment(1);
                        OutcomeStatus::Skipped
                    } else if stop.is_cancelled() {
                        OutcomeStatus::Cancelled
                    } else {
                        let n = position.fetch_add(1, Ordering::SeqCst) + 1;
                        info!(
                            "[{}/{} | {:.1}%] Processing {}",
                            n,
                            pending,
                            n as f64 / pending as f64 * 100.0,
                            image.id
                        );

                        let status = self.process_image(&image).await;
                        if let OutcomeStatus::Failed { kind, reason, .. } = &status {
                            if kind.is_fatal() {
                                warn!(image = %image.id, error = %reason, "Fatal failure, stopping run");
                                let _ = aborted.set(format!("{}: {}", image.id, reason));
                                stop.cancel();
                            }
                        }

                        let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                        if done < pending {
                            let eta = started.elapsed().mul_f64((pending - done) as f64 / done as f64);
                            info!(done, pending, eta = %format_duration(eta), "Progress");
                        }
                        status
                    };

                    let outcome = ImageOutcome {
                        id: image.id,
                        path: image.path,
                        status,
                    };
                    (index, outcome)
                }
            })
            .buffer_unordered(self.options.workers.max(1))
            .collect()
            .await;

        outcomes.sort_by_key(|(index, _)| *index);

        let mut result = RunResult::new(run_id);
        for (_, outcome) in outcomes {
            result.record(outcome);
        }
        result.aborted = aborted.into_inner();
        let result = result.finish(started.elapsed());

        info!(
            run_id = %run_id,
            total,
            processed = result.processed,
            skipped = result.skipped,
            failed = result.failed,
            cancelled = result.cancelled,
            success_rate = result.success_rate(),
            elapsed = %format_duration(started.elapsed()),
            "Labeling run finished"
        );

        Ok(result)
    }

    /// Run one image through every stage, returning its terminal status.
    pub async fn process_image(&self, image: &ImageRef) -> OutcomeStatus {
        let span = info_span!("image", id = %image.id);
        match self.label_image(image).instrument(span).await {
            Ok(output) => {
                metrics::counter!("labels_processed_total").increment(1);
                OutcomeStatus::Labeled { output }
            }
            Err(failure) => {
                warn!(
                    image = %image.id,
                    stage = %failure.stage,
                    kind = %failure.kind,
                    error = %failure.reason,
                    "Image failed"
                );
                metrics::counter!("labels_failed_total", "kind" => failure.kind.to_string()).increment(1);
                OutcomeStatus::Failed {
                    stage: failure.stage,
                    kind: failure.kind,
                    reason: failure.reason,
                }
            }
        }
    }

    async fn label_image(&self, image: &ImageRef) -> Result<PathBuf, StageFailure> {
        // ── Encoding ─────────────────────────────────────────────────────
        let inline = encoder::encode(&image.path, self.options.max_image_bytes)
            .await
            .map_err(StageFailure::encoding)?;
        debug!(mime = inline.mime_type, bytes = inline.byte_len, "Image encoded");

        // ── Extracting ───────────────────────────────────────────────────
        let context = ExtractionContext {
            language: self.options.language.clone(),
            max_output_tokens: self.options.max_output_tokens,
            hint: image.hint.clone(),
        };
        let start = Instant::now();
        let response = self
            .engine
            .extract(&inline, &context)
            .await
            .map_err(StageFailure::extracting)?;
        let extraction = start.elapsed();
        metrics::histogram!("label_extraction_seconds").record(extraction.as_secs_f64());
        debug!(duration_ms = extraction.as_millis() as u64, "Extraction complete");

        // ── Validating ───────────────────────────────────────────────────
        let label = match response.candidate {
            Value::Object(label) => label,
            other => {
                debug!(candidate = %other, "Rejected non-object candidate");
                return Err(StageFailure::new(
                    Stage::Validating,
                    FailureKind::SchemaViolation,
                    format!("Label candidate must be a JSON object; raw reply: {}", response.raw),
                ));
            }
        };

        let validation = self.schema.validate_object(&label);
        if !validation.is_valid() {
            warn!(raw = %response.raw, "Model reply violates label schema");
            return Err(StageFailure::new(
                Stage::Validating,
                FailureKind::SchemaViolation,
                validation.describe(),
            ));
        }

        // ── Persisting ───────────────────────────────────────────────────
        let record = LabelRecord::new(image.file_name(), self.engine.name(), label);
        persist(&image.label_path, &record).await.map_err(|e| {
            StageFailure::new(Stage::Persisting, FailureKind::PersistError, e.to_string())
        })?;
        info!(output = %image.label_path.display(), "Label saved");

        Ok(image.label_path.clone())
    }
}

/// For each image, the earlier image that already claims its label path.
///
/// Images sharing a stem in one directory (`foo.jpg`, `foo.png`) map to the
/// same `foo.json`; the first in enumeration order keeps it.
fn label_owners(images: &[ImageRef]) -> Vec<Option<PathBuf>> {
    let mut claimed: HashMap<&Path, &Path> = HashMap::new();
    images
        .iter()
        .map(|image| {
            let owner = *claimed
                .entry(image.label_path.as_path())
                .or_insert(image.path.as_path());
            (owner != image.path.as_path()).then(|| owner.to_path_buf())
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("Failed to serialize label: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write label: {0}")]
    Io(#[from] std::io::Error),
}

/// Write a label record atomically: temporary sibling first, then rename.
pub async fn persist(path: &Path, record: &LabelRecord) -> Result<(), PersistError> {
    let mut text = serde_json::to_string_pretty(record)?;
    text.push('\n');

    let tmp = path.with_extension("json.tmp");
    let written = match tokio::fs::write(&tmp, text).await {
        Ok(()) => tokio::fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        // Best effort; the temporary may never have been created.
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Read a persisted label record back.
pub async fn load_record(path: &Path) -> Result<LabelRecord, PersistError> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_persist_then_load_equal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("promo1.json");
        let label = json!({"name": "Masło 200 g", "price": 5.99, "promo": "NONE", "promo_args": ""});
        let record = LabelRecord::new("promo1.jpg", "openai", label.as_object().unwrap().clone());

        persist(&path, &record).await.unwrap();
        assert!(!dir.path().join("promo1.json.tmp").exists());
        assert_eq!(load_record(&path).await.unwrap(), record);
    }

    #[test]
    fn test_encoding_failures_map_to_kinds() {
        let failure = StageFailure::encoding(EncodeError::NotFound(PathBuf::from("a.jpg")));
        assert_eq!((failure.stage, failure.kind), (Stage::Encoding, FailureKind::NotFound));

        let failure = StageFailure::encoding(EncodeError::UnsupportedFormat {
            path: PathBuf::from("a.tiff"),
            reason: "no".to_string(),
        });
        assert_eq!(failure.kind, FailureKind::UnsupportedFormat);

        let failure = StageFailure::encoding(EncodeError::TooLarge {
            path: PathBuf::from("huge.png"),
            size: 11,
            limit: 10,
        });
        assert_eq!((failure.stage, failure.kind), (Stage::Encoding, FailureKind::UnsupportedFormat));
        assert!(failure.reason.contains("limit is 10"));

        let failure = StageFailure::encoding(EncodeError::Empty(PathBuf::from("zero.jpg")));
        assert_eq!(failure.kind, FailureKind::UnsupportedFormat);
    }

    #[test]
    fn test_first_image_owns_shared_label_path() {
        let root = Path::new("/data");
        let images: Vec<_> = ["/data/a.jpg", "/data/foo.jpg", "/data/foo.png", "/data/sub/foo.webp"]
            .into_iter()
            .map(|p| ImageRef::new(root, PathBuf::from(p)))
            .collect();

        let owners = label_owners(&images);
        assert_eq!(owners, vec![None, None, Some(PathBuf::from("/data/foo.jpg")), None]);
    }

    #[test]
    fn test_transport_failures_map_to_kinds() {
        let cases = [
            (TransportError::RateLimitedExhausted { attempts: 4 }, FailureKind::RateLimitedExhausted),
            (
                TransportError::TransportFailed {
                    attempts: 4,
                    last_error: "timeout".to_string(),
                },
                FailureKind::TransportFailed,
            ),
            (TransportError::NonRetriable("401".to_string()), FailureKind::NonRetriable),
        ];
        for (error, kind) in cases {
            let failure = StageFailure::extracting(EngineError::Transport(error));
            assert_eq!((failure.stage, failure.kind), (Stage::Extracting, kind));
        }
    }
}
