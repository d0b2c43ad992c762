//! The `run` subcommand.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone};
use clap::Args;

use crate::{
    backends::build_backend,
    config::{Config, EngineKind},
    coordinator::{RunCoordinator, enumerate_documents, resume_filter},
    ledger::ProgressLedger,
    pipeline::DocumentPipeline,
    prelude::*,
    rate_limit::RateLimit,
    render::PopplerRenderer,
    retry::RetryPolicy,
    scheduler::BatchScheduler,
    text_layer::PdfTextLayer,
    ui::Ui,
};

/// Run command line arguments.
#[derive(Debug, Args)]
pub struct RunOpts {
    /// Directory containing the documents to convert.
    pub input_dir: PathBuf,

    /// Directory for texts, stats and the progress ledger.
    #[clap(short = 'o', long, default_value = "ocr_output")]
    pub output_dir: PathBuf,

    /// File extension to process, matched case-insensitively. May be
    /// repeated. Only PDF documents are supported.
    #[clap(long = "extension", value_name = "EXT", default_value = "pdf")]
    pub extensions: Vec<String>,

    /// Resolution for rendering scanned pages.
    #[clap(long, default_value = "300")]
    pub dpi: u32,

    /// Maximum number of rendered pages held at once.
    #[clap(long, default_value = "40")]
    pub batch_size: u32,

    /// Number of concurrent renderer processes.
    #[clap(long, default_value = "2")]
    pub render_jobs: usize,

    /// Number of pages recognized at once. Defaults to one less than the
    /// number of CPUs for local OCR, and 10 for cloud OCR.
    #[clap(short = 'j', long)]
    pub ocr_jobs: Option<usize>,

    /// Confidence (0-100) below which local OCR makes a second pass and pages
    /// are flagged as low quality.
    #[clap(long, default_value = "55")]
    pub confidence_threshold: f64,

    /// Pages with fewer characters than this are flagged as low quality.
    #[clap(long, default_value = "20")]
    pub min_page_chars: usize,

    /// Number of leading pages to check for a digital text layer.
    #[clap(long, default_value = "6")]
    pub native_sample_pages: u32,

    /// Characters the sampled pages must contain to skip OCR.
    #[clap(long, default_value = "120")]
    pub native_min_chars: usize,

    /// Cloud request limit, as "N/s" or "N/m".
    #[clap(long, default_value = "1800/m")]
    pub rate_limit: RateLimit,

    /// Reprocess documents even if the ledger says they are done.
    #[clap(long)]
    pub no_resume: bool,

    /// OCR engine for scanned pages.
    #[clap(long, value_enum, default_value = "local")]
    pub engine: EngineKind,

    /// Don't fall back to the other cloud provider.
    #[clap(long)]
    pub no_fallback: bool,

    /// Tesseract language code. May be repeated.
    #[clap(long = "lang", value_name = "LANG", default_value = "eng")]
    pub languages: Vec<String>,

    /// Detect rotation and deskew before the second local pass.
    #[clap(long)]
    pub fix_orientation: bool,

    /// Seconds allowed for one page, including retries and fallback. Time a
    /// cloud page spends waiting for the rate limit doesn't count.
    #[clap(long, value_name = "SECS", default_value = "120")]
    pub page_timeout: u64,

    /// Seconds allowed for one cloud request.
    #[clap(long, value_name = "SECS", default_value = "30")]
    pub request_timeout: u64,

    /// Keep the local engine's TSV output for each page.
    #[clap(long)]
    pub write_tsv: bool,

    /// Collapse runs of whitespace in recognized text.
    #[clap(long)]
    pub normalize_whitespace: bool,

    /// AWS region for Textract. Defaults to the standard AWS configuration.
    #[clap(long)]
    pub aws_region: Option<String>,
}

impl RunOpts {
    /// Where this run's log file goes, given when the run started.
    pub fn log_path<Tz: TimeZone>(&self, started: DateTime<Tz>) -> PathBuf
    where
        Tz::Offset: std::fmt::Display,
    {
        self.output_dir
            .join("logs")
            .join(format!("run_{}.log", started.format("%Y%m%d_%H%M%S")))
    }

    /// Build a validated [`Config`].
    pub fn to_config(&self) -> Result<Config> {
        let config = Config {
            input_dir: self.input_dir.clone(),
            output_dir: self.output_dir.clone(),
            extensions: self
                .extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_owned())
                .collect(),
            dpi: self.dpi,
            batch_size: self.batch_size,
            render_jobs: self.render_jobs,
            ocr_jobs: self
                .ocr_jobs
                .unwrap_or_else(|| Config::default_ocr_jobs(self.engine)),
            confidence_threshold: self.confidence_threshold,
            min_page_chars: self.min_page_chars,
            native_sample_pages: self.native_sample_pages,
            native_min_chars: self.native_min_chars,
            rate_limit: self.rate_limit.clone(),
            resume: !self.no_resume,
            engine: self.engine,
            fallback: !self.no_fallback,
            languages: self.languages.clone(),
            fix_orientation: self.fix_orientation,
            page_timeout: Duration::from_secs(self.page_timeout),
            request_timeout: Duration::from_secs(self.request_timeout),
            write_tsv: self.write_tsv,
            normalize_whitespace: self.normalize_whitespace,
            aws_region: self.aws_region.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// The `run` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(ui: Ui, opts: &RunOpts) -> Result<()> {
    let config = Arc::new(opts.to_config()?);
    if config.engine.is_cloud() {
        let retry_budget = RetryPolicy::default().max_total_backoff() + config.request_timeout;
        if config.page_timeout < retry_budget {
            warn!(
                "--page-timeout of {}s may cut off cloud retries, which can take {}s",
                config.page_timeout.as_secs(),
                retry_budget.as_secs()
            );
        }
    }

    let sources = enumerate_documents(&config.input_dir, &config.extensions).await?;
    let found = sources.len();
    if found == 0 {
        ui.display_message(
            "📭",
            &format!("No matching documents in {}", config.input_dir.display()),
        );
        return Ok(());
    }

    let ledger = Arc::new(ProgressLedger::open(&config.ledger_path()).await?);
    let (pending, skipped) = resume_filter(&ledger, sources, config.resume).await;
    info!(
        found,
        pending = pending.len(),
        skipped = skipped.len(),
        engine = ?config.engine,
        "Starting run"
    );
    if pending.is_empty() {
        let totals = ledger.snapshot().await;
        ui.display_message(
            "✅",
            &format!(
                "All {} documents are already complete ({} pages, estimated cost ${:.4})",
                found,
                totals.total_pages_processed,
                totals.total_cost()
            ),
        );
        return Ok(());
    }

    // Check our tools and credentials before we touch any document.
    PdfTextLayer::ensure_installed().await?;
    PopplerRenderer::ensure_installed().await?;
    let backend = build_backend(&config).await?;

    let renderer = Arc::new(PopplerRenderer::new(config.dpi, config.render_jobs));
    let scheduler = BatchScheduler::new(renderer, backend, &config, ui.clone());
    let pipeline = DocumentPipeline::new(
        config.clone(),
        Arc::new(PdfTextLayer),
        scheduler,
        ledger.clone(),
    );
    let summary = RunCoordinator::new(ledger, pipeline, ui.clone())
        .run(pending, found, skipped.len())
        .await?;

    for line in summary.to_string().lines() {
        ui.display_message("📊", line);
    }
    if summary.failed > 0 {
        ui.display_message(
            "⚠️",
            &format!(
                "{} documents failed. Run `status` for details, and rerun to retry them.",
                summary.failed
            ),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::rate_limit::RateLimitPeriod;

    use super::*;

    #[derive(Debug, Parser)]
    struct TestOpts {
        #[clap(flatten)]
        run: RunOpts,
    }

    fn parse(args: &[&str]) -> Result<Config> {
        let opts = TestOpts::try_parse_from(std::iter::once("test").chain(args.iter().copied()))?;
        opts.run.to_config()
    }

    #[test]
    fn defaults_match_config_defaults() -> Result<()> {
        let config = parse(&["scans"])?;
        let defaults = Config::default();
        assert_eq!(config.input_dir, PathBuf::from("scans"));
        assert_eq!(config.output_dir, defaults.output_dir);
        assert_eq!(config.batch_size, defaults.batch_size);
        assert_eq!(config.ocr_jobs, Config::default_ocr_jobs(EngineKind::Local));
        assert_eq!(config.rate_limit, defaults.rate_limit);
        assert!(config.resume);
        assert!(config.fallback);
        Ok(())
    }

    #[test]
    fn cloud_engine_gets_more_workers() -> Result<()> {
        let config = parse(&["scans", "--engine", "google", "--rate-limit", "10/s"])?;
        assert_eq!(config.engine, EngineKind::Google);
        assert_eq!(config.ocr_jobs, 10);
        assert_eq!(config.rate_limit, RateLimit::new(10, RateLimitPeriod::Second));
        Ok(())
    }

    #[test]
    fn extensions_and_languages_repeat() -> Result<()> {
        let config = parse(&[
            "scans", "--extension", ".pdf", "--extension", "PDF", "--lang", "eng", "--lang", "hin",
        ])?;
        assert_eq!(config.extensions, vec!["pdf", "PDF"]);
        assert_eq!(config.languages, vec!["eng", "hin"]);
        Ok(())
    }

    #[test]
    fn log_file_goes_in_output_dir() -> Result<()> {
        let opts = TestOpts::try_parse_from(["test", "scans", "-o", "out"])?;
        let started = chrono::Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            opts.run.log_path(started),
            Path::new("out/logs/run_20240309_140507.log")
        );
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(parse(&["scans", "--extension", "tif"]).is_err());
        assert!(parse(&["scans", "--batch-size", "0"]).is_err());
        assert!(parse(&["scans", "--confidence-threshold", "150"]).is_err());
        assert!(parse(&["scans", "--rate-limit", "0/m"]).is_err());
    }
}
