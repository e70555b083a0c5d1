//! The `prefill` subcommand.

use clap::Args;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use crate::{
    async_utils::create_writer,
    prefill::extract_prefill,
    prelude::*,
    textclean::{clean_ocr_text, pre_clean},
};

/// Prefill command line arguments.
#[derive(Debug, Args)]
pub struct PrefillOpts {
    /// A text file to scan, defaulting to standard input.
    pub input_path: Option<PathBuf>,

    /// Skip OCR cleanup and match the rules against the text as-is.
    #[clap(long)]
    pub raw: bool,

    /// The output path to write the matches to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `prefill` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_prefill(opts: &PrefillOpts) -> Result<()> {
    // Read our input text.
    let text = match &opts.input_path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buffer)
                .await
                .context("failed to read stdin")?;
            buffer
        }
    };

    // Clean it the way uploaded scans are cleaned, then run the rules.
    let cleaned = if opts.raw { text } else { clean_ocr_text(&text) };
    let matches = extract_prefill(&pre_clean(&cleaned));

    // Write out our matches.
    let mut wtr = create_writer(opts.output_path.as_deref()).await?;
    let json = serde_json::to_string_pretty(&matches)
        .context("failed to serialize prefill matches")?;
    wtr.write_all(json.as_bytes())
        .await
        .context("failed to write prefill matches")?;
    wtr.write_all(b"\n")
        .await
        .context("failed to write prefill matches")?;
    wtr.flush().await.context("failed to flush prefill matches")?;
    Ok(())
}
