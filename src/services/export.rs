use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::models::label::LabelRecord;
use crate::services::encoder::IMAGE_EXTENSIONS;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Data directory {0} not found")]
    DataDirMissing(PathBuf),

    #[error("Failed to write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize line: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Why a single label file was left out of the export.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("unreadable: {0}")]
    Read(#[from] std::io::Error),

    #[error("not a label record: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("image {0} is missing")]
    ImageMissing(PathBuf),
}

/// One line of the training JSONL file.
#[derive(Debug, Serialize)]
struct TrainingLine<'a> {
    image_path: String,
    label: &'a str,
}

#[derive(Debug, Default)]
pub struct ExportReport {
    pub written: usize,
    pub errors: Vec<(PathBuf, RecordError)>,
}

/// Merge every label file under `data_dir` into one JSONL file at `output`.
///
/// Lines are written in label path order; `image_path` is `image_prefix`
/// followed by the image path relative to `data_dir`. Directories named in
/// `skip_dirs` are pruned. A `.json` file with no sibling image of the same
/// stem is only exported if it parses as a label record.
pub fn convert(
    data_dir: &Path,
    output: &Path,
    image_prefix: &str,
    skip_dirs: &[String],
) -> Result<ExportReport, ExportError> {
    if !data_dir.is_dir() {
        return Err(ExportError::DataDirMissing(data_dir.to_path_buf()));
    }

    let output_error = |source: std::io::Error| ExportError::Output {
        path: output.to_path_buf(),
        source,
    };
    let file = File::create(output).map_err(output_error)?;
    let mut writer = BufWriter::new(file);
    let mut report = ExportReport::default();

    for label_path in label_files(data_dir, skip_dirs) {
        let (image_path, record) = match read_record(&label_path) {
            Ok(found) => found,
            Err(RecordError::Parse(e)) if !has_sibling_image(&label_path) => {
                debug!(path = %label_path.display(), error = %e, "Ignoring unrelated JSON file");
                continue;
            }
            Err(e) => {
                warn!(path = %label_path.display(), error = %e, "Skipping label file");
                report.errors.push((label_path, e));
                continue;
            }
        };

        let label = record.label_json()?;
        let line = TrainingLine {
            image_path: format!("{}{}", image_prefix, relative_path(data_dir, &image_path)),
            label: &label,
        };
        serde_json::to_writer(&mut writer, &line)?;
        writer.write_all(b"\n").map_err(output_error)?;
        report.written += 1;
    }

    writer.flush().map_err(output_error)?;

    info!(
        output = %output.display(),
        written = report.written,
        errors = report.errors.len(),
        "Export complete"
    );
    Ok(report)
}

fn label_files(data_dir: &Path, skip_dirs: &[String]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(data_dir)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !skip_dirs
                    .iter()
                    .any(|skip| entry.file_name().to_string_lossy().trim().eq_ignore_ascii_case(skip))
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

fn read_record(label_path: &Path) -> Result<(PathBuf, LabelRecord), RecordError> {
    let text = std::fs::read_to_string(label_path)?;
    let record: LabelRecord = serde_json::from_str(&text)?;
    let image_path = label_path.with_file_name(&record.image);
    if !image_path.is_file() {
        return Err(RecordError::ImageMissing(image_path));
    }
    Ok((image_path, record))
}

/// An image with the label file's stem exists next to it.
fn has_sibling_image(label_path: &Path) -> bool {
    IMAGE_EXTENSIONS.iter().any(|ext| {
        label_path.with_extension(ext).is_file() || label_path.with_extension(ext.to_uppercase()).is_file()
    })
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let root = Path::new("/data");
        assert_eq!(relative_path(root, Path::new("/data/BXYG/promo7.jpg")), "BXYG/promo7.jpg");
        assert_eq!(relative_path(root, Path::new("/data/promo1.png")), "promo1.png");
    }

    #[test]
    fn test_sibling_image_any_case() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("shelf.PNG"), b"x").unwrap();
        assert!(has_sibling_image(&dir.path().join("shelf.json")));
        assert!(!has_sibling_image(&dir.path().join("manifest.json")));
    }

    #[test]
    fn test_missing_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let result = convert(&dir.path().join("nope"), &dir.path().join("out.jsonl"), "images/", &[]);
        assert!(matches!(result, Err(ExportError::DataDirMissing(_))));
    }
}
