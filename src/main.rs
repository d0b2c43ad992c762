use std::str::FromStr;

use chrono::Local;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod backends;
mod cmd;
mod config;
mod coordinator;
mod document;
mod ledger;
mod output;
mod pipeline;
mod pool;
mod prelude;
mod quality;
mod rate_limit;
mod render;
mod retry;
mod scheduler;
#[cfg(test)]
mod test_support;
mod text_layer;
mod ui;

/// Convert directories of PDFs to text, using the embedded text layer where
/// there is one and OCR where there isn't.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - GOOGLE_VISION_API_KEY: API key for `--engine google` and for
    falling back to Google from `--engine aws`.

  Standard AWS environment variables and credential files
  are used for Textract.

  These variables may be set in a standard `.env` file.

External tools:
  - Poppler (`pdfinfo`, `pdftotext`, `pdftocairo`) is always required.
  - Tesseract is required for `--engine local`.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Convert every document in a directory, resuming where we left off.
    Run(cmd::run::RunOpts),
    /// Summarize the progress ledger of an output directory.
    Status(cmd::status::StatusOpts),
    /// Print schemas for our output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Run(_) => false,
            Cmd::Status(_) => true,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();
    let opts = Opts::parse();

    // `run` also logs to a file in its output directory.
    let log_path = match &opts.subcmd {
        Cmd::Run(run_opts) => Some(run_opts.log_path(Local::now())),
        Cmd::Status(_) | Cmd::Schema(_) => None,
    };
    let _log_guard = init_tracing(&ui, log_path.as_deref())?;

    real_main(ui, opts).await
}

/// Build a filter from `RUST_LOG`, defaulting to `info`.
fn env_filter() -> EnvFilter {
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy()
}

/// Send logs to stderr, and to `log_path` if given. Logs are flushed to the
/// file until the returned guard is dropped.
fn init_tracing(ui: &Ui, log_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter());

    let (file_layer, guard) = match log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create log directory {:?}", parent))?;
            }
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot create log file {:?}", path))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    if let Some(path) = log_path {
        info!(path = %path.display(), "Writing log file");
    }
    Ok(guard)
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui, opts: Opts) -> Result<()> {
    // Load credentials from a `.env` file, if it exists.
    dotenvy::dotenv().ok();
    debug!("Parsed options: {:?}", opts);

    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Run(opts) => cmd::run::cmd_run(ui, opts).await?,
        Cmd::Status(opts) => cmd::status::cmd_status(opts).await?,
        Cmd::Schema(opts) => cmd::schema::cmd_schema(opts).await?,
    }
    Ok(())
}
