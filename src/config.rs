//! Run configuration.
//!
//! A [`Config`] is built once from the command line, validated, and then
//! shared read-only as an `Arc<Config>` by every component of a run.

use std::time::Duration;

use clap::ValueEnum;

use crate::{prelude::*, rate_limit::RateLimit};

/// Name of the progress ledger file inside the output directory.
pub const LEDGER_FILE_NAME: &str = "progress.json";

/// Which recognition engine handles scanned pages.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum EngineKind {
    /// Local `tesseract`, with a second pass for low-confidence pages.
    #[default]
    Local,
    /// Google Cloud Vision, falling back to AWS Textract.
    Google,
    /// AWS Textract, falling back to Google Cloud Vision.
    Aws,
}

impl EngineKind {
    /// Is this a network-bound cloud engine?
    pub fn is_cloud(self) -> bool {
        !matches!(self, EngineKind::Local)
    }
}

/// Immutable configuration for a run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the source documents.
    pub input_dir: PathBuf,
    /// Base directory for texts, stats, TSV dumps and the ledger.
    pub output_dir: PathBuf,
    /// File extensions (without the dot) to pick up from `input_dir`.
    pub extensions: Vec<String>,
    /// Rasterization resolution.
    pub dpi: u32,
    /// Maximum number of pages rendered and held in memory at once.
    pub batch_size: u32,
    /// Number of concurrent renderer processes per batch.
    pub render_jobs: usize,
    /// Number of concurrent page recognitions.
    pub ocr_jobs: usize,
    /// Confidence below which a page is retried (local) and flagged, on a
    /// 0–100 scale.
    pub confidence_threshold: f64,
    /// Pages with fewer characters than this are flagged.
    pub min_page_chars: usize,
    /// How many leading pages to sample when looking for a text layer.
    pub native_sample_pages: u32,
    /// How many characters the sampled pages must contain in total.
    pub native_min_chars: usize,
    /// Shared request cap for cloud providers.
    pub rate_limit: RateLimit,
    /// Skip documents already recorded as completed in the ledger.
    pub resume: bool,
    /// Primary recognition engine.
    pub engine: EngineKind,
    /// Try the other cloud provider when the primary one fails.
    pub fallback: bool,
    /// Tesseract language codes, e.g. `eng` or `hin`.
    pub languages: Vec<String>,
    /// Run orientation detection and deskew before the second local pass.
    pub fix_orientation: bool,
    /// Upper bound on the time spent recognizing one page.
    pub page_timeout: Duration,
    /// Upper bound on a single cloud request.
    pub request_timeout: Duration,
    /// Keep the local engine's TSV output for each page.
    pub write_tsv: bool,
    /// Collapse runs of whitespace in recognized text.
    pub normalize_whitespace: bool,
    /// AWS region override for Textract.
    pub aws_region: Option<String>,
}

impl Config {
    /// Default number of recognition workers for an engine.
    ///
    /// Local recognition is CPU-bound, so we leave a core free for the
    /// coordinator and the renderer.
    pub fn default_ocr_jobs(engine: EngineKind) -> usize {
        match engine {
            EngineKind::Local => num_cpus::get().saturating_sub(1).max(1),
            EngineKind::Google | EngineKind::Aws => 10,
        }
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("--batch-size must be at least 1");
        }
        if self.render_jobs == 0 || self.ocr_jobs == 0 {
            bail!("job counts must be at least 1");
        }
        if !(0.0..=100.0).contains(&self.confidence_threshold) {
            bail!(
                "--confidence-threshold must be between 0 and 100, got {}",
                self.confidence_threshold
            );
        }
        if self.rate_limit.max_requests == 0 {
            bail!("--rate-limit must allow at least one request");
        }
        if self.extensions.is_empty() {
            bail!("at least one --extension is required");
        }
        // Page counts, text layers and rendering all come from Poppler.
        if let Some(ext) = self
            .extensions
            .iter()
            .find(|ext| !ext.eq_ignore_ascii_case("pdf"))
        {
            bail!("--extension {ext:?} is not supported: only PDF documents can be processed");
        }
        if self.languages.is_empty() {
            bail!("at least one --lang is required");
        }
        Ok(())
    }

    /// Where per-document text files go.
    pub fn texts_dir(&self) -> PathBuf {
        self.output_dir.join("texts")
    }

    /// Where per-document stats files go.
    pub fn stats_dir(&self) -> PathBuf {
        self.output_dir.join("stats")
    }

    /// Where TSV dumps go, if enabled.
    pub fn tsv_dir(&self) -> Option<PathBuf> {
        self.write_tsv.then(|| self.output_dir.join("tsv"))
    }

    /// Path to the progress ledger.
    pub fn ledger_path(&self) -> PathBuf {
        self.output_dir.join(LEDGER_FILE_NAME)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("."),
            output_dir: PathBuf::from("ocr_output"),
            extensions: vec!["pdf".to_owned()],
            dpi: 300,
            batch_size: 40,
            render_jobs: 2,
            ocr_jobs: Self::default_ocr_jobs(EngineKind::Local),
            confidence_threshold: 55.0,
            min_page_chars: 20,
            native_sample_pages: 6,
            native_min_chars: 120,
            rate_limit: RateLimit::default(),
            resume: true,
            engine: EngineKind::Local,
            fallback: true,
            languages: vec!["eng".to_owned()],
            fix_orientation: false,
            page_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(30),
            write_tsv: false,
            normalize_whitespace: false,
            aws_region: None,
        }
    }
}
