//! Extraction engines: remote vision models that turn an inline image into a
//! candidate label.
//!
//! Every engine implements [`LabelEngine`] and is constructed by name through
//! an [`EngineRegistry`], so the pipeline never needs to know which variant
//! it is driving.

pub mod openai;
pub mod prompt;
pub mod workers_ai;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{AppConfig, ConfigError};
use crate::models::image::InlineImage;
use crate::services::transport::{RateLimitedTransport, TransportError};

/// Per-request extraction parameters.
#[derive(Debug, Clone)]
pub struct ExtractionContext {
    /// Language the product text on the image is written in.
    pub language: String,
    pub max_output_tokens: u32,
    /// Field value fixed by the caller, as (field, value).
    pub hint: Option<(String, String)>,
}

/// Raw model reply together with its parsed JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResponse {
    pub raw: String,
    pub candidate: Value,
}

#[async_trait]
pub trait LabelEngine: Send + Sync {
    /// Registry name of the engine.
    fn name(&self) -> &str;

    /// Send one image to the model and parse its reply. One request per call;
    /// retries happen only inside the transport.
    async fn extract(
        &self,
        image: &InlineImage,
        context: &ExtractionContext,
    ) -> Result<EngineResponse, EngineError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Model reply is not valid JSON ({source}); raw reply: {raw}")]
    Parse {
        raw: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse a model reply into a JSON candidate, tolerating a surrounding
/// markdown code fence.
pub fn parse_reply(raw: String) -> Result<EngineResponse, EngineError> {
    let parsed = serde_json::from_str::<Value>(strip_code_fence(&raw));
    match parsed {
        Ok(candidate) => Ok(EngineResponse { raw, candidate }),
        Err(source) => Err(EngineError::Parse { raw, source }),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening fence line.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Constructor for a registered engine.
pub type EngineBuilder =
    fn(&AppConfig, Arc<RateLimitedTransport>) -> Result<Arc<dyn LabelEngine>, ConfigError>;

/// Name to constructor map for extraction engines.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    builders: BTreeMap<String, EngineBuilder>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every engine shipped in this crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(openai::ENGINE_NAME, openai::build);
        registry.register(workers_ai::ENGINE_NAME, workers_ai::build);
        registry
    }

    /// Register (or replace) an engine under `name`.
    pub fn register(&mut self, name: &str, builder: EngineBuilder) {
        self.builders.insert(name.to_string(), builder);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    pub fn build(
        &self,
        name: &str,
        config: &AppConfig,
        transport: Arc<RateLimitedTransport>,
    ) -> Result<Arc<dyn LabelEngine>, ConfigError> {
        let builder = self
            .builders
            .get(name)
            .ok_or_else(|| ConfigError::UnknownEngine {
                name: name.to_string(),
                available: self.names().collect::<Vec<_>>().join(", "),
            })?;
        builder(config, transport)
    }
}

/// HTTP client shared by the engines' configuration.
pub(crate) fn http_client(config: &AppConfig) -> Result<reqwest::Client, ConfigError> {
    Ok(reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()?)
}
