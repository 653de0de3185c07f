use std::path::PathBuf;
use std::time::Duration;

use garde::Validate;
use serde::Deserialize;

use crate::services::validation::SchemaError;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// Directory holding the promotion images (searched recursively).
    #[serde(default = "default_data_dir")]
    #[garde(skip)]
    pub data_dir: PathBuf,

    /// Registered engine name (e.g., "openai", "workers-ai").
    #[serde(default = "default_engine")]
    #[garde(length(min = 1, max = 64))]
    pub engine: String,

    /// Language the product names on the images are written in.
    #[serde(default = "default_label_language")]
    #[garde(length(min = 1, max = 64))]
    pub label_language: String,

    /// Response token cap per extraction request.
    #[serde(default = "default_max_output_tokens")]
    #[garde(range(min = 16, max = 4096))]
    pub max_output_tokens: u32,

    /// Outbound request ceiling shared by every extraction call.
    #[serde(default = "default_requests_per_minute")]
    #[garde(range(min = 1, max = 10_000))]
    pub requests_per_minute: u32,

    /// Fixed pause between requests; overrides the RPM-derived interval when set.
    #[serde(default)]
    #[garde(skip)]
    pub request_pause_ms: Option<u64>,

    /// Number of images processed concurrently.
    #[serde(default = "default_workers")]
    #[garde(range(min = 1, max = 32))]
    pub workers: usize,

    /// Images larger than this are rejected before encoding.
    #[serde(default = "default_max_image_bytes")]
    #[garde(range(min = 1))]
    pub max_image_bytes: u64,

    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    #[garde(range(min = 1, max = 600))]
    pub request_timeout_secs: u64,

    /// OpenAI API key (required by the "openai" engine)
    #[serde(default)]
    #[garde(skip)]
    pub openai_api_key: Option<String>,

    #[serde(default = "default_openai_model")]
    #[garde(length(min = 1))]
    pub openai_model: String,

    /// Base URL of an OpenAI-compatible chat completions API
    #[serde(default = "default_openai_base_url")]
    #[garde(length(min = 1))]
    pub openai_base_url: String,

    /// Cloudflare account ID (required by the "workers-ai" engine)
    #[serde(default)]
    #[garde(skip)]
    pub cf_account_id: Option<String>,

    /// Cloudflare Workers AI API token
    #[serde(default)]
    #[garde(skip)]
    pub cf_api_token: Option<String>,

    /// Workers AI vision model
    #[serde(default = "default_cf_model")]
    #[garde(length(min = 1))]
    pub cf_model: String,

    #[serde(default = "default_cf_base_url")]
    #[garde(length(min = 1))]
    pub cf_base_url: String,

    /// Text file replacing the built-in extraction instruction.
    #[serde(default)]
    #[garde(skip)]
    pub prompt_path: Option<PathBuf>,

    /// JSON file describing the label schema; the built-in promotion schema is used when unset.
    #[serde(default)]
    #[garde(skip)]
    pub label_schema_path: Option<PathBuf>,

    /// Directory names (case-insensitive) excluded from processing.
    #[serde(default = "default_skip_dirs")]
    #[garde(skip)]
    pub skip_dirs: Vec<String>,

    /// Prometheus text file written at the end of a run.
    #[serde(default)]
    #[garde(skip)]
    pub metrics_textfile: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("train_data")
}

fn default_engine() -> String {
    "openai".to_string()
}

fn default_label_language() -> String {
    "Polish".to_string()
}

fn default_max_output_tokens() -> u32 {
    120
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_workers() -> usize {
    1
}

fn default_max_image_bytes() -> u64 {
    crate::services::encoder::DEFAULT_MAX_IMAGE_BYTES
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_cf_model() -> String {
    "@cf/llava-hf/llava-1.5-7b-hf".to_string()
}

fn default_cf_base_url() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_skip_dirs() -> Vec<String> {
    vec!["UNKNOWN".to_string()]
}

impl AppConfig {
    /// Load from the process environment (and `.env`, if present), then validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::read_env()?.validated()
    }

    /// Build from an explicit key/value iterator, then validate. Keys use the env-var spelling.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self::read_vars(vars)?.validated()
    }

    /// Deserialize the process environment without validating, so overrides can be applied first.
    pub fn read_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(envy::from_env()?)
    }

    pub fn read_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::from_iter(vars)?)
    }

    /// Apply command-line overrides, then validate the merged result once.
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        if let Some(data_dir) = overrides.data_dir {
            self.data_dir = data_dir;
        }
        if let Some(engine) = overrides.engine {
            self.engine = engine;
        }
        if let Some(language) = overrides.label_language {
            self.label_language = language;
        }
        if let Some(max_tokens) = overrides.max_output_tokens {
            self.max_output_tokens = max_tokens;
        }
        if let Some(rpm) = overrides.requests_per_minute {
            self.requests_per_minute = rpm;
        }
        if overrides.request_pause_ms.is_some() {
            self.request_pause_ms = overrides.request_pause_ms;
        }
        if let Some(workers) = overrides.workers {
            self.workers = workers;
        }
        self.validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn request_pause(&self) -> Option<Duration> {
        self.request_pause_ms.map(Duration::from_millis)
    }

    /// Returns the value of a credential or a config error naming the env var.
    pub fn require<'a>(
        engine: &str,
        variable: &'static str,
        value: &'a Option<String>,
    ) -> Result<&'a str, ConfigError> {
        match value.as_deref().map(str::trim) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(ConfigError::MissingCredential {
                engine: engine.to_string(),
                variable,
            }),
        }
    }
}

/// Values supplied on the command line; `None` keeps the environment's value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub data_dir: Option<PathBuf>,
    pub engine: Option<String>,
    pub label_language: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub requests_per_minute: Option<u32>,
    pub request_pause_ms: Option<u64>,
    pub workers: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),

    #[error("Engine '{engine}' requires {variable} to be set")]
    MissingCredential {
        engine: String,
        variable: &'static str,
    },

    #[error("Unknown engine '{name}'. Available: {available}")]
    UnknownEngine { name: String, available: String },

    #[error("Label schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Failed to read extraction prompt: {0}")]
    Prompt(String),

    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_apply() {
        let config = AppConfig::from_vars(Vec::new()).unwrap();
        assert_eq!(config.engine, "openai");
        assert_eq!(config.max_output_tokens, 120);
        assert_eq!(config.requests_per_minute, 60);
        assert_eq!(config.workers, 1);
        assert_eq!(config.skip_dirs, vec!["UNKNOWN".to_string()]);
        assert!(config.request_pause().is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = AppConfig::from_vars(vars(&[
            ("DATA_DIR", "/tmp/promos"),
            ("REQUESTS_PER_MINUTE", "20"),
            ("REQUEST_PAUSE_MS", "1500"),
            ("SKIP_DIRS", "UNKNOWN,REJECTED"),
        ]))
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/promos"));
        assert_eq!(config.requests_per_minute, 20);
        assert_eq!(config.request_pause(), Some(Duration::from_millis(1500)));
        assert_eq!(config.skip_dirs.len(), 2);
    }

    #[test]
    fn test_zero_rpm_rejected() {
        let result = AppConfig::from_vars(vars(&[("REQUESTS_PER_MINUTE", "0")]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_overrides_validated_after_merge() {
        let config = AppConfig::read_vars(vars(&[("REQUESTS_PER_MINUTE", "0"), ("WORKERS", "4")]))
            .unwrap()
            .with_overrides(ConfigOverrides {
                requests_per_minute: Some(10),
                ..ConfigOverrides::default()
            })
            .unwrap();
        assert_eq!(config.requests_per_minute, 10);
        assert_eq!(config.workers, 4);

        let result = AppConfig::read_vars(Vec::new()).unwrap().with_overrides(ConfigOverrides {
            workers: Some(0),
            ..ConfigOverrides::default()
        });
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_max_image_bytes_default_and_override() {
        let config = AppConfig::from_vars(Vec::new()).unwrap();
        assert_eq!(config.max_image_bytes, 100 * 1024 * 1024);
        let config = AppConfig::from_vars(vars(&[("MAX_IMAGE_BYTES", "2048")])).unwrap();
        assert_eq!(config.max_image_bytes, 2048);
    }

    #[test]
    fn test_missing_credential_named() {
        let config = AppConfig::from_vars(Vec::new()).unwrap();
        let err = AppConfig::require("openai", "OPENAI_API_KEY", &config.openai_api_key)
            .unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }
}
