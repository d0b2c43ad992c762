//! The `status` subcommand.

use std::fmt::Write as _;

use clap::Args;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::create_writer,
    config::LEDGER_FILE_NAME,
    ledger::LedgerData,
    prelude::*,
};

/// Status command line arguments.
#[derive(Debug, Args)]
pub struct StatusOpts {
    /// The output directory of a previous run.
    #[clap(default_value = "ocr_output")]
    pub output_dir: PathBuf,
}

/// The `status` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_status(opts: &StatusOpts) -> Result<()> {
    let path = opts.output_dir.join(LEDGER_FILE_NAME);
    let report = match LedgerData::read(&path).await? {
        Some(data) => format_status(&data),
        None => format!("No progress recorded in {}\n", opts.output_dir.display()),
    };
    let mut wtr = create_writer(None).await?;
    wtr.write_all(report.as_bytes())
        .await
        .context("failed to write status")?;
    wtr.flush().await.context("failed to flush status")?;
    Ok(())
}

/// Human-readable summary of a ledger.
fn format_status(data: &LedgerData) -> String {
    let failures = data.outstanding_failures();
    let mut out = String::new();
    let _ = writeln!(out, "Started:    {}", data.start_time.to_rfc3339());
    let _ = writeln!(out, "Completed:  {} documents", data.completed.len());
    let _ = writeln!(out, "Failed:     {} documents", failures.len());
    let _ = writeln!(out, "Pages:      {}", data.total_pages_processed);
    let _ = writeln!(out, "Requests:   {}", data.total_requests);
    let _ = writeln!(out, "Est. cost:  ${:.4}", data.total_cost());
    for (provider, cost) in &data.estimated_cost {
        let _ = writeln!(out, "  {provider}: ${cost:.4}");
    }
    if !failures.is_empty() {
        let _ = writeln!(out, "\nFailed documents:");
        for entry in failures {
            let _ = writeln!(out, "  {}: {}", entry.document, entry.error);
        }
    }
    out
}
