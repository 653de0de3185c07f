use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ConfigError};
use crate::models::schema::LabelSchema;
use crate::services::{
    engine::{EngineRegistry, LabelEngine},
    pipeline::{Pipeline, PipelineOptions},
    transport::{RateLimitedTransport, RetryPolicy},
    validation::CompiledSchema,
};

/// Long-lived services shared by a labeling run.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub transport: Arc<RateLimitedTransport>,
    pub engine: Arc<dyn LabelEngine>,
    pub schema: Arc<CompiledSchema>,
}

impl AppState {
    /// Resolve the schema, transport and engine named by `config`.
    pub fn from_config(config: AppConfig, registry: &EngineRegistry) -> Result<Self, ConfigError> {
        let schema = match &config.label_schema_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading label schema");
                CompiledSchema::from_file(path)?
            }
            None => CompiledSchema::compile(&LabelSchema::default())?,
        };

        let transport = Arc::new(RateLimitedTransport::new(
            config.requests_per_minute,
            config.request_pause(),
            RetryPolicy::default(),
        ));
        let engine = registry.build(&config.engine, &config, Arc::clone(&transport))?;

        tracing::info!(
            engine = engine.name(),
            requests_per_minute = config.requests_per_minute,
            fields = ?schema.field_names().collect::<Vec<_>>(),
            "Services initialized"
        );

        Ok(Self {
            config,
            transport,
            engine,
            schema: Arc::new(schema),
        })
    }

    /// A pipeline over the configured data directory, stopped by `cancel`.
    pub fn pipeline(&self, cancel: CancellationToken) -> Pipeline {
        let options = PipelineOptions {
            data_dir: self.config.data_dir.clone(),
            workers: self.config.workers,
            language: self.config.label_language.clone(),
            max_output_tokens: self.config.max_output_tokens,
            skip_dirs: self.config.skip_dirs.clone(),
            max_image_bytes: self.config.max_image_bytes,
        };
        Pipeline::new(Arc::clone(&self.engine), Arc::clone(&self.schema), options).with_cancellation(cancel)
    }
}
