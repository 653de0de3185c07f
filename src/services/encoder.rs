use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::write::EncoderStringWriter;
use image::ImageFormat;

use crate::models::image::InlineImage;

/// File extensions accepted as promotion images (lower-case).
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "gif"];

/// Largest image accepted for inline embedding (100 MiB).
pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 100 * 1024 * 1024;

const SUPPORTED_FORMATS: &[ImageFormat] = &[
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Bmp,
    ImageFormat::Gif,
];

/// Whether the path carries one of the supported image extensions.
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Encode an image file for inline embedding, off the async executor.
pub async fn encode(path: &Path, max_bytes: u64) -> Result<InlineImage, EncodeError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || encode_file(&owned, max_bytes))
        .await
        .map_err(|e| EncodeError::Io(io::Error::other(e)))?
}

/// Stream a file through a base64 writer, sniffing its format from the leading bytes.
///
/// Empty files and files larger than `max_bytes` are rejected before any content is read.
pub fn encode_file(path: &Path, max_bytes: u64) -> Result<InlineImage, EncodeError> {
    if !has_image_extension(path) {
        return Err(EncodeError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: "unsupported file extension".to_string(),
        });
    }

    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => EncodeError::NotFound(path.to_path_buf()),
        _ => EncodeError::Io(e),
    })?;

    let size = file.metadata()?.len();
    if size == 0 {
        return Err(EncodeError::Empty(path.to_path_buf()));
    }
    if size > max_bytes {
        return Err(EncodeError::TooLarge {
            path: path.to_path_buf(),
            size,
            limit: max_bytes,
        });
    }
    let mut reader = BufReader::new(file);

    let format = image::guess_format(reader.fill_buf()?).map_err(|_| EncodeError::UnsupportedFormat {
        path: path.to_path_buf(),
        reason: "content is not a recognised image".to_string(),
    })?;
    if !SUPPORTED_FORMATS.contains(&format) {
        return Err(EncodeError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: format!("{:?} images are not supported", format),
        });
    }

    let mut writer = EncoderStringWriter::new(&STANDARD);
    let byte_len = io::copy(&mut reader, &mut writer)?;

    Ok(InlineImage {
        mime_type: format.to_mime_type(),
        payload: writer.into_inner(),
        byte_len,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Image not found: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported image format for {path}: {reason}")]
    UnsupportedFormat { path: PathBuf, reason: String },

    #[error("Image {0} is empty")]
    Empty(PathBuf),

    #[error("Image {path} is {size} bytes, limit is {limit}")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("Failed to read image: {0}")]
    Io(#[from] io::Error),
}
