use std::path::{Path, PathBuf};

/// One source image discovered under the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub path: PathBuf,
    /// Path relative to the data directory, extension stripped, `/`-separated.
    pub id: String,
    /// Sibling `<stem>.json` the label is persisted to.
    pub label_path: PathBuf,
    /// A label already exists for this image.
    pub already_labeled: bool,
    /// Field value implied by the parent directory name (field, value).
    pub hint: Option<(String, String)>,
}

impl ImageRef {
    pub fn new(data_dir: &Path, path: PathBuf) -> Self {
        let label_path = path.with_extension("json");
        let already_labeled = label_path.is_file();
        let relative = path.strip_prefix(data_dir).unwrap_or(&path).with_extension("");
        let id = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        Self {
            path,
            id,
            label_path,
            already_labeled,
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: Option<(String, String)>) -> Self {
        self.hint = hint;
        self
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Name of the immediate parent directory, if any.
    pub fn parent_name(&self) -> Option<String> {
        self.path
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// An image encoded for embedding in a remote API request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: &'static str,
    /// Standard base64 of the file contents.
    pub payload: String,
    /// Size of the original file in bytes.
    pub byte_len: u64,
}

impl InlineImage {
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.payload)
    }
}
