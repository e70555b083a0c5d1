//! The `extract` subcommand.

use std::time::Duration;

use clap::Args;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::create_writer,
    config::{OcrCredentials, ServiceConfig},
    page_render::PageRenderOptions,
    prelude::*,
    reasoner::LlmOpts,
    service::{ExtractReport, ScanService},
    session::spawn_expiry_sweeper,
    ui::{ProgressConfig, Ui},
};

/// How often the session sweeper wakes up.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Extract command line arguments.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// The scanned document to process (PDF, PNG, JPEG, WebP or GIF).
    pub input_path: PathBuf,

    /// A field to extract. May be repeated.
    #[clap(short = 'f', long = "field", value_name = "NAME", required = true)]
    pub fields: Vec<String>,

    /// The model used to resolve fields the deterministic rules miss.
    #[clap(long, default_value = "gpt-4o-mini")]
    pub model: String,

    /// Max number of OCR requests to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "8")]
    pub job_count: usize,

    /// Google Vision API key. Defaults to the `VISION_API_KEY` environment
    /// variable.
    #[clap(long, value_name = "KEY")]
    pub vision_api_key: Option<String>,

    /// Override the Vision API endpoint.
    #[clap(long, value_name = "URL")]
    pub vision_endpoint: Option<String>,

    /// Layout segmentation endpoint. Defaults to the `LAYOUT_ENDPOINT`
    /// environment variable; without one, each page becomes a single text
    /// region.
    #[clap(long, value_name = "URL")]
    pub layout_endpoint: Option<String>,

    #[clap(flatten)]
    pub render: PageRenderOptions,

    #[clap(flatten)]
    pub llm: LlmOpts,

    /// The output path to write the report to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    // Build and configure our service.
    let config = ServiceConfig {
        render: opts.render.clone(),
        job_count: opts.job_count,
        ..ServiceConfig::default()
    };
    let service = ScanService::new(config);
    let _sweeper = spawn_expiry_sweeper(service.store(), SWEEP_INTERVAL);

    let api_key = match &opts.vision_api_key {
        Some(key) => key.clone(),
        None => std::env::var("VISION_API_KEY").context(
            "set --vision-api-key or the VISION_API_KEY environment variable",
        )?,
    };
    let credentials = OcrCredentials {
        api_key,
        endpoint: opts.vision_endpoint.clone(),
    };
    service.configure_vision_ocr(&credentials).await?;

    let layout_endpoint = opts
        .layout_endpoint
        .clone()
        .or_else(|| std::env::var("LAYOUT_ENDPOINT").ok());
    if let Some(endpoint) = layout_endpoint {
        service.configure_remote_segmenter(endpoint).await?;
    }

    service
        .configure_reasoner_from_env(&opts.model, &opts.llm)
        .await?;

    // Read and process the document.
    let data = tokio::fs::read(&opts.input_path)
        .await
        .with_context(|| format!("failed to read {}", opts.input_path.display()))?;
    let pb = ui.new_spinner(&ProgressConfig {
        emoji: "📄",
        msg: "Processing scan",
        done_msg: "Processed scan",
    });
    let receipt = service.upload(&data).await?;
    pb.finish_using_style();

    // Resolve the requested fields.
    let pb = ui.new_spinner(&ProgressConfig {
        emoji: "🔎",
        msg: "Extracting fields",
        done_msg: "Extracted fields",
    });
    let extracted = service
        .extract_fields(&receipt.session_id, &opts.fields)
        .await?;
    pb.finish_using_style();

    // Write out our report.
    let report = ExtractReport::new(&receipt, extracted);
    let mut wtr = create_writer(opts.output_path.as_deref()).await?;
    let report_str =
        serde_json::to_string_pretty(&report).context("failed to serialize report")?;
    wtr.write_all(report_str.as_bytes())
        .await
        .context("failed to write report")?;
    wtr.write_all(b"\n").await.context("failed to write report")?;
    wtr.flush().await.context("failed to flush report")?;
    Ok(())
}
