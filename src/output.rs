//! Per-document output: the text file, optional TSV sidecars and the stats
//! file.
//!
//! Text is written to `<id>.txt.partial` as pages arrive, and renamed to
//! `<id>.txt` only once every page has been written.

use std::{collections::BTreeMap, mem, sync::LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use schemars::JsonSchema;
use tokio::{
    fs::{self, File},
    io::{AsyncWriteExt as _, BufWriter},
};

use crate::{
    async_utils::io::{ensure_dir, sibling_with_suffix, write_atomically},
    document::{Document, DocumentId, PageResult, ProviderId},
    ledger::UsageDelta,
    prelude::*,
};

static WHITESPACE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("failed to compile regex"));

/// Collapse every run of whitespace into a single space.
pub fn normalize_whitespace(text: &str) -> String {
    WHITESPACE_REGEX.replace_all(text, " ").trim().to_owned()
}

/// How page delimiter lines are formatted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionStyle {
    /// Digital text: `--- Page N ---`.
    Native,
    /// Local OCR: `--- Page N (conf: C, chars: K) ---`.
    Local,
    /// Cloud OCR: `--- Page N (provider: P, confidence: C) ---`.
    Cloud,
}

/// Format one page section: a delimiter line, then the text, ending in a
/// newline.
pub fn format_section(style: SectionStyle, result: &PageResult) -> String {
    let flag = if result.warning.is_some() {
        ", low quality"
    } else {
        ""
    };
    let header = match style {
        SectionStyle::Native if result.warning.is_some() => {
            format!("--- Page {} (low quality) ---", result.page)
        }
        SectionStyle::Native => format!("--- Page {} ---", result.page),
        SectionStyle::Local => format!(
            "--- Page {} (conf: {:.1}, chars: {}{}) ---",
            result.page,
            result.confidence,
            result.char_count(),
            flag
        ),
        SectionStyle::Cloud => format!(
            "--- Page {} (provider: {}, confidence: {:.1}{}) ---",
            result.page,
            result.provider_label(),
            result.confidence,
            flag
        ),
    };
    let mut section = format!("{header}\n{}", result.text);
    if !section.ends_with('\n') {
        section.push('\n');
    }
    section
}

/// How a document's text was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ProcessingPath {
    /// Copied from the document's text layer.
    NativeExtract,
    /// Rendered and recognized.
    Recognizing,
}

/// Summary statistics for one document, written to `<id>_stats.json`.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct DocumentStats {
    pub document: DocumentId,
    pub total_pages: u32,
    /// Pages with text, excluding failed pages.
    pub processed_pages: u32,
    /// Mean confidence over pages with non-zero confidence, 0–100.
    pub mean_confidence: f64,
    /// Pages per provider label, such as `google` or `aws_fallback`.
    pub provider_usage: BTreeMap<String, u32>,
    pub total_characters: u64,
    pub low_quality_pages: u32,
    pub failed_pages: u32,
    /// Recognition requests or engine passes used.
    pub recognition_requests: u64,
    /// Estimated spend in US dollars, by provider.
    pub estimated_cost: BTreeMap<ProviderId, f64>,
    pub path: ProcessingPath,
    pub finished_at: DateTime<Utc>,
    #[serde(skip)]
    pages_by_provider: BTreeMap<ProviderId, u64>,
}

impl DocumentStats {
    /// The label which produced the most pages. Ties go to the first label
    /// alphabetically.
    pub fn dominant_provider(&self) -> String {
        let mut best: Option<(&String, u32)> = None;
        for (label, &count) in &self.provider_usage {
            if best.is_none_or(|(_, best_count)| count > best_count) {
                best = Some((label, count));
            }
        }
        best.map(|(label, _)| label.clone())
            .unwrap_or_else(|| "none".to_owned())
    }

    /// What this document adds to the ledger's running totals.
    pub fn usage(&self) -> UsageDelta {
        UsageDelta {
            requests: self.recognition_requests,
            pages_by_provider: self.pages_by_provider.clone(),
        }
    }
}

/// Running totals while a document is written.
#[derive(Debug, Default)]
struct StatsAccumulator {
    pages: u32,
    processed_pages: u32,
    confidence_sum: f64,
    confident_pages: u32,
    provider_usage: BTreeMap<String, u32>,
    pages_by_provider: BTreeMap<ProviderId, u64>,
    total_characters: u64,
    low_quality_pages: u32,
    failed_pages: u32,
    requests: u64,
}

impl StatsAccumulator {
    fn add(&mut self, result: &PageResult) {
        self.pages += 1;
        self.requests += u64::from(result.requests);
        *self
            .provider_usage
            .entry(result.provider_label())
            .or_default() += 1;
        if result.is_error() {
            self.failed_pages += 1;
            return;
        }
        self.processed_pages += 1;
        if result.confidence > 0.0 {
            self.confidence_sum += result.confidence;
            self.confident_pages += 1;
        }
        if let Some(provider) = result.provider {
            *self.pages_by_provider.entry(provider).or_default() += 1;
        }
        self.total_characters += result.char_count() as u64;
        if result.warning.is_some() {
            self.low_quality_pages += 1;
        }
    }

    fn finish(self, document: &Document, path: ProcessingPath) -> DocumentStats {
        let mean_confidence = if self.confident_pages == 0 {
            0.0
        } else {
            self.confidence_sum / f64::from(self.confident_pages)
        };
        let estimated_cost = self
            .pages_by_provider
            .iter()
            .filter(|(provider, _)| provider.estimated_page_cost() > 0.0)
            .map(|(&provider, &pages)| (provider, provider.estimated_page_cost() * pages as f64))
            .collect();
        DocumentStats {
            document: document.id.clone(),
            total_pages: document.total_pages,
            processed_pages: self.processed_pages,
            mean_confidence,
            provider_usage: self.provider_usage,
            total_characters: self.total_characters,
            low_quality_pages: self.low_quality_pages,
            failed_pages: self.failed_pages,
            recognition_requests: self.requests,
            estimated_cost,
            path,
            finished_at: Utc::now(),
            pages_by_provider: self.pages_by_provider,
        }
    }
}

/// Writes one document's pages, strictly in page order.
pub struct DocumentWriter {
    document: Document,
    style: SectionStyle,
    partial_path: PathBuf,
    out: BufWriter<File>,
    tsv_dir: Option<PathBuf>,
    next_page: u32,
    stats: StatsAccumulator,
}

impl DocumentWriter {
    /// Start writing `document`. If `tsv_root` is set, raw engine output is
    /// saved under `tsv_root/<id>/`.
    pub async fn create(
        document: &Document,
        style: SectionStyle,
        tsv_root: Option<&Path>,
    ) -> Result<Self> {
        if let Some(parent) = document.text_path.parent() {
            ensure_dir(parent).await?;
        }
        let partial_path = sibling_with_suffix(&document.text_path, ".partial");
        let file = File::create(&partial_path)
            .await
            .with_context(|| format!("cannot create {:?}", partial_path))?;
        let tsv_dir = tsv_root.map(|root| root.join(document.id.as_str()));
        if let Some(dir) = &tsv_dir {
            ensure_dir(dir).await?;
        }
        Ok(Self {
            document: document.clone(),
            style,
            partial_path,
            out: BufWriter::new(file),
            tsv_dir,
            next_page: 1,
            stats: StatsAccumulator::default(),
        })
    }

    /// Append the next page. Pages must arrive in order, with no gaps.
    pub async fn write_page(&mut self, result: &PageResult) -> Result<()> {
        if result.page != self.next_page {
            bail!(
                "page {} of {} written out of order (expected page {})",
                result.page,
                self.document.id,
                self.next_page
            );
        }
        self.out
            .write_all(format_section(self.style, result).as_bytes())
            .await
            .with_context(|| format!("cannot write {:?}", self.partial_path))?;
        if let (Some(dir), Some(tsv)) = (&self.tsv_dir, &result.detail) {
            let tsv_path = dir.join(format!("page_{:04}.tsv", result.page));
            fs::write(&tsv_path, tsv)
                .await
                .with_context(|| format!("cannot write {:?}", tsv_path))?;
        }
        self.stats.add(result);
        self.next_page += 1;
        Ok(())
    }

    /// Write the stats file and move the text file into place.
    ///
    /// The text file only appears once its stats are on disk. On failure,
    /// neither file is left behind.
    pub async fn finish(mut self, path: ProcessingPath) -> Result<DocumentStats> {
        match self.write_outputs(path).await {
            Ok(stats) => Ok(stats),
            Err(err) => {
                self.abandon().await;
                Err(err)
            }
        }
    }

    async fn write_outputs(&mut self, path: ProcessingPath) -> Result<DocumentStats> {
        if self.stats.pages != self.document.total_pages {
            bail!(
                "wrote {} of {} pages for {}",
                self.stats.pages,
                self.document.total_pages,
                self.document.id
            );
        }
        self.out
            .flush()
            .await
            .with_context(|| format!("cannot flush {:?}", self.partial_path))?;
        self.out
            .get_ref()
            .sync_all()
            .await
            .with_context(|| format!("cannot sync {:?}", self.partial_path))?;

        let stats = mem::take(&mut self.stats).finish(&self.document, path);
        if let Some(parent) = self.document.stats_path.parent() {
            ensure_dir(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&stats).context("cannot serialize stats")?;
        write_atomically(&self.document.stats_path, &json).await?;

        if let Err(err) = fs::rename(&self.partial_path, &self.document.text_path).await {
            if let Err(remove_err) = fs::remove_file(&self.document.stats_path).await {
                debug!("cannot remove {:?}: {}", self.document.stats_path, remove_err);
            }
            return Err(err).with_context(|| {
                format!(
                    "cannot move {:?} to {:?}",
                    self.partial_path, self.document.text_path
                )
            });
        }
        Ok(stats)
    }

    /// Give up on this document, removing the partial text file.
    pub async fn abandon(self) {
        drop(self.out);
        if let Err(err) = fs::remove_file(&self.partial_path).await {
            debug!("cannot remove {:?}: {}", self.partial_path, err);
        }
    }
}
