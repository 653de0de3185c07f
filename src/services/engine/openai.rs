use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::prompt::{load_system_prompt, user_instruction};
use super::{parse_reply, EngineError, EngineResponse, ExtractionContext, LabelEngine};
use crate::config::{AppConfig, ConfigError};
use crate::models::image::InlineImage;
use crate::services::transport::{classify_response, CallError, RateLimitedTransport};

pub const ENGINE_NAME: &str = "openai";

/// Vision engine for OpenAI-compatible chat completion APIs.
pub struct OpenAiEngine {
    http: Client,
    transport: Arc<RateLimitedTransport>,
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiEngine {
    pub fn new(
        http: Client,
        transport: Arc<RateLimitedTransport>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            http,
            transport,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            system_prompt: system_prompt.into(),
        }
    }
}

/// Registry constructor.
pub fn build(
    config: &AppConfig,
    transport: Arc<RateLimitedTransport>,
) -> Result<Arc<dyn LabelEngine>, ConfigError> {
    let api_key = AppConfig::require(ENGINE_NAME, "OPENAI_API_KEY", &config.openai_api_key)?;
    let system_prompt = load_system_prompt(config.prompt_path.as_deref())
        .map_err(|e| ConfigError::Prompt(e.to_string()))?;

    Ok(Arc::new(OpenAiEngine::new(
        super::http_client(config)?,
        transport,
        config.openai_base_url.clone(),
        api_key,
        config.openai_model.clone(),
        system_prompt,
    )))
}

#[async_trait]
impl LabelEngine for OpenAiEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    async fn extract(
        &self,
        image: &InlineImage,
        context: &ExtractionContext,
    ) -> Result<EngineResponse, EngineError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let request_body = serde_json::json!({
            "model": self.model,
            "temperature": 0.0,
            "max_tokens": context.max_output_tokens,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": self.system_prompt },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": user_instruction(context) },
                        { "type": "image_url", "image_url": { "url": image.data_uri() } }
                    ]
                }
            ]
        });

        let (http, url, api_key, body) = (&self.http, url.as_str(), self.api_key.as_str(), &request_body);
        let text = self
            .transport
            .execute(|| async move {
                let response = http.post(url).bearer_auth(api_key).json(body).send().await?;
                let response = classify_response(response).await?;
                Ok::<_, CallError>(response.text().await?)
            })
            .await?;

        let completion: ChatCompletion = match serde_json::from_str(&text) {
            Ok(completion) => completion,
            Err(source) => return Err(EngineError::Parse { raw: text, source }),
        };

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        parse_reply(content)
    }
}
