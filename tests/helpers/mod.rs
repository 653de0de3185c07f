//! Test helper utilities: a scripted engine and a data directory builder

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::Value;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use promo_labeler::models::image::InlineImage;
use promo_labeler::models::schema::LabelSchema;
use promo_labeler::services::engine::{
    parse_reply, EngineError, EngineResponse, ExtractionContext, LabelEngine,
};
use promo_labeler::services::encoder::DEFAULT_MAX_IMAGE_BYTES;
use promo_labeler::services::pipeline::{Pipeline, PipelineOptions};
use promo_labeler::services::transport::TransportError;
use promo_labeler::services::validation::CompiledSchema;

use crate::fixtures::{image_bytes, JPEG_MAGIC, PNG_MAGIC};

/// What the scripted engine answers for one image.
#[derive(Debug, Clone)]
pub enum Reply {
    Label(Value),
    Raw(String),
    Fail(TransportError),
}

/// Engine that answers from a script keyed by the tag embedded in each image.
#[derive(Default)]
pub struct ScriptedEngine {
    replies: HashMap<String, Reply>,
    cancel_on: Option<(String, CancellationToken)>,
    calls: Mutex<Vec<(String, ExtractionContext)>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, tag: &str, reply: Reply) -> Self {
        self.replies.insert(tag.to_string(), reply);
        self
    }

    /// Cancel `token` while extracting the image tagged `tag`.
    pub fn cancel_on(mut self, tag: &str, token: CancellationToken) -> Self {
        self.cancel_on = Some((tag.to_string(), token));
        self
    }

    /// Tags and contexts of every extraction request, in call order.
    pub fn calls(&self) -> Vec<(String, ExtractionContext)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn tag_of(image: &InlineImage) -> String {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&image.payload)
        .unwrap();
    let body = bytes
        .strip_prefix(PNG_MAGIC)
        .or_else(|| bytes.strip_prefix(JPEG_MAGIC))
        .unwrap_or(&bytes[..]);
    String::from_utf8_lossy(body).into_owned()
}

#[async_trait]
impl LabelEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn extract(
        &self,
        image: &InlineImage,
        context: &ExtractionContext,
    ) -> Result<EngineResponse, EngineError> {
        let tag = tag_of(image);
        self.calls.lock().unwrap().push((tag.clone(), context.clone()));

        if let Some((cancel_tag, token)) = &self.cancel_on {
            if *cancel_tag == tag {
                token.cancel();
            }
        }

        match self.replies.get(&tag) {
            Some(Reply::Label(label)) => parse_reply(label.to_string()),
            Some(Reply::Raw(raw)) => parse_reply(raw.clone()),
            Some(Reply::Fail(error)) => Err(EngineError::Transport(error.clone())),
            None => panic!("no scripted reply for image tagged {tag:?}"),
        }
    }
}

/// Temporary data directory populated with fake promotion images.
pub struct DataDir {
    pub dir: TempDir,
}

impl DataDir {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write an image at `relative`; its tag is the file stem.
    pub fn image(&self, relative: &str) -> PathBuf {
        let path = self.path().join(relative);
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("jpg").to_string();
        let tag = path.file_stem().unwrap().to_string_lossy().into_owned();
        self.write(relative, &image_bytes(&extension, &tag))
    }

    pub fn write(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub fn label_path(&self, relative_image: &str) -> PathBuf {
        self.path().join(relative_image).with_extension("json")
    }
}

pub fn promotion_schema() -> Arc<CompiledSchema> {
    Arc::new(CompiledSchema::compile(&LabelSchema::promotions()).unwrap())
}

pub fn skip_dirs() -> Vec<String> {
    vec!["UNKNOWN".to_string()]
}

pub fn options(data_dir: &Path, workers: usize) -> PipelineOptions {
    PipelineOptions {
        data_dir: data_dir.to_path_buf(),
        workers,
        language: "Polish".to_string(),
        max_output_tokens: 120,
        skip_dirs: skip_dirs(),
        max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
    }
}

pub fn pipeline(data_dir: &Path, engine: Arc<ScriptedEngine>, workers: usize) -> Pipeline {
    Pipeline::new(engine, promotion_schema(), options(data_dir, workers))
}
