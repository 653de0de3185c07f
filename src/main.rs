use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use promo_labeler::{
    app_state::AppState,
    config::{AppConfig, ConfigError, ConfigOverrides},
    models::run::{format_duration, RunResult},
    services::{engine::EngineRegistry, export},
};

#[derive(Parser)]
#[command(name = "promo-labeler", version, about = "Label retail promotion images with a vision model")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Label every unlabeled image under the data directory
    Process(ProcessArgs),
    /// Merge label files into a JSONL training file
    Convert(ConvertArgs),
    /// List the available extraction engines
    Engines,
}

#[derive(Args)]
struct ProcessArgs {
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    engine: Option<String>,
    /// Language of the text on the images
    #[arg(long)]
    language: Option<String>,
    #[arg(long)]
    max_tokens: Option<u32>,
    /// Requests per minute across all workers
    #[arg(long)]
    rpm: Option<u32>,
    /// Fixed pause between requests in milliseconds
    #[arg(long)]
    pause_ms: Option<u64>,
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args)]
struct ConvertArgs {
    #[arg(long, env = "DATA_DIR", default_value = "train_data")]
    data_dir: PathBuf,
    #[arg(long, default_value = "training_data.jsonl")]
    output: PathBuf,
    /// Prefix prepended to each relative image path
    #[arg(long, default_value = "images/")]
    image_prefix: String,
    /// Directory names left out of the export
    #[arg(long, env = "SKIP_DIRS", value_delimiter = ',', default_value = "UNKNOWN")]
    skip_dirs: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    match cli.command {
        Command::Process(args) => process(args).await,
        Command::Convert(args) => convert(args),
        Command::Engines => {
            for name in EngineRegistry::with_defaults().names() {
                println!("{name}");
            }
            ExitCode::SUCCESS
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("pretty")) {
        builder.pretty().init();
    } else {
        builder.json().init();
    }
}

fn load_config(args: ProcessArgs) -> Result<AppConfig, ConfigError> {
    AppConfig::read_env()?.with_overrides(ConfigOverrides {
        data_dir: args.data_dir,
        engine: args.engine,
        label_language: args.language,
        max_output_tokens: args.max_tokens,
        requests_per_minute: args.rpm,
        request_pause_ms: args.pause_ms,
        workers: args.workers,
    })
}

async fn process(args: ProcessArgs) -> ExitCode {
    let config = match load_config(args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::from(2);
        }
    };

    let metrics = install_metrics();
    let metrics_textfile = config.metrics_textfile.clone();

    let state = match AppState::from_config(config, &EngineRegistry::with_defaults()) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize services");
            return ExitCode::from(2);
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight images");
            on_signal.cancel();
        }
    });

    let result = match state.pipeline(cancel).run().await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "Labeling run could not start");
            return ExitCode::from(2);
        }
    };

    let stats = state.transport.stats().await;
    tracing::info!(
        dispatched = stats.dispatched,
        throttled = stats.throttled,
        retries = stats.retries,
        "Transport summary"
    );

    if let (Some(handle), Some(path)) = (metrics, metrics_textfile) {
        if let Err(e) = std::fs::write(&path, handle.render()) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write metrics");
        }
    }

    print_summary(&result);
    if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn install_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            metrics::describe_counter!("labels_processed_total", "Images labeled and persisted");
            metrics::describe_counter!("labels_skipped_total", "Images skipped because a label exists");
            metrics::describe_counter!("labels_failed_total", "Images that failed, by kind");
            metrics::describe_histogram!("label_extraction_seconds", "Engine extraction latency");
            metrics::describe_counter!("transport_throttled_total", "Responses that signalled throttling");
            metrics::describe_counter!("transport_retries_total", "Requests retried by the transport");
            Some(handle)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install metrics recorder");
            None
        }
    }
}

fn print_summary(result: &RunResult) {
    println!("Run {}", result.run_id);
    println!("  processed: {}", result.processed);
    println!("  skipped:   {}", result.skipped);
    println!("  failed:    {}", result.failed);
    if result.cancelled > 0 {
        println!("  cancelled: {}", result.cancelled);
    }
    println!("  elapsed:   {}", format_duration(std::time::Duration::from_millis(result.elapsed_ms)));
    if let Some(reason) = &result.aborted {
        println!("  aborted:   {reason}");
    }
    for (id, kind, reason) in result.failures() {
        println!("  FAILED {id} [{kind}] {reason}");
    }
}

fn convert(args: ConvertArgs) -> ExitCode {
    match export::convert(&args.data_dir, &args.output, &args.image_prefix, &args.skip_dirs) {
        Ok(report) => {
            println!("Wrote {} records to {}", report.written, args.output.display());
            for (path, error) in &report.errors {
                println!("  ERROR {}: {}", path.display(), error);
            }
            if report.errors.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Conversion failed");
            ExitCode::from(2)
        }
    }
}
