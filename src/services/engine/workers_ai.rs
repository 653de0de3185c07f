use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::prompt::{load_system_prompt, user_instruction};
use super::{parse_reply, EngineError, EngineResponse, ExtractionContext, LabelEngine};
use crate::config::{AppConfig, ConfigError};
use crate::models::image::InlineImage;
use crate::services::transport::{classify_response, CallError, RateLimitedTransport};

pub const ENGINE_NAME: &str = "workers-ai";

/// Client for Cloudflare Workers AI image-to-text models (LLaVA).
pub struct WorkersAiEngine {
    http: Client,
    transport: Arc<RateLimitedTransport>,
    base_url: String,
    account_id: String,
    api_token: String,
    model: String,
    system_prompt: String,
}

#[derive(Deserialize)]
struct LlavaResponse {
    result: LlavaResult,
}

#[derive(Deserialize)]
struct LlavaResult {
    description: String,
}

/// Registry constructor.
pub fn build(
    config: &AppConfig,
    transport: Arc<RateLimitedTransport>,
) -> Result<Arc<dyn LabelEngine>, ConfigError> {
    let account_id = AppConfig::require(ENGINE_NAME, "CF_ACCOUNT_ID", &config.cf_account_id)?;
    let api_token = AppConfig::require(ENGINE_NAME, "CF_API_TOKEN", &config.cf_api_token)?;
    let system_prompt = load_system_prompt(config.prompt_path.as_deref())
        .map_err(|e| ConfigError::Prompt(e.to_string()))?;

    Ok(Arc::new(WorkersAiEngine {
        http: super::http_client(config)?,
        transport,
        base_url: config.cf_base_url.trim_end_matches('/').to_string(),
        account_id: account_id.to_string(),
        api_token: api_token.to_string(),
        model: config.cf_model.clone(),
        system_prompt,
    }))
}

#[async_trait]
impl LabelEngine for WorkersAiEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    /// LLaVA takes a single prompt, so the instruction and user turn are joined.
    async fn extract(
        &self,
        image: &InlineImage,
        context: &ExtractionContext,
    ) -> Result<EngineResponse, EngineError> {
        let url = format!(
            "{}/accounts/{}/ai/run/{}",
            self.base_url, self.account_id, self.model
        );

        let request_body = serde_json::json!({
            "image": image.payload,
            "prompt": format!("{}\n\n{}", self.system_prompt, user_instruction(context)),
            "max_tokens": context.max_output_tokens
        });

        let (http, url, api_token, body) = (&self.http, url.as_str(), self.api_token.as_str(), &request_body);
        let text = self
            .transport
            .execute(|| async move {
                let response = http.post(url).bearer_auth(api_token).json(body).send().await?;
                let response = classify_response(response).await?;
                Ok::<_, CallError>(response.text().await?)
            })
            .await?;

        let llava: LlavaResponse = match serde_json::from_str(&text) {
            Ok(llava) => llava,
            Err(source) => return Err(EngineError::Parse { raw: text, source }),
        };

        parse_reply(llava.result.description)
    }
}
