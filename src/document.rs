//! Documents, pages and page results.

use std::{fmt, ops::RangeInclusive};

use schemars::JsonSchema;

use crate::{
    backends::{Recognition, RecognitionError},
    prelude::*,
    quality::{QualityGate, QualityWarning},
};

/// Stable identity of a document, derived from its file stem.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Derive an ID from a source path.
    pub fn from_path(path: &Path) -> Result<Self> {
        let stem = path
            .file_stem()
            .ok_or_else(|| anyhow!("cannot derive a document name from {:?}", path))?;
        Ok(Self(stem.to_string_lossy().into_owned()))
    }

    /// The ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A document found in the input directory, before we've opened it.
#[derive(Clone, Debug)]
pub struct DocumentSource {
    pub id: DocumentId,
    pub path: PathBuf,
}

impl DocumentSource {
    /// Create a source for `path`.
    pub fn new(path: PathBuf) -> Result<Self> {
        Ok(Self {
            id: DocumentId::from_path(&path)?,
            path,
        })
    }
}

/// An opened document with a known page count.
#[derive(Clone, Debug)]
pub struct Document {
    pub id: DocumentId,
    pub path: PathBuf,
    pub total_pages: u32,
    pub text_path: PathBuf,
    pub stats_path: PathBuf,
}

impl Document {
    /// Create a document, placing its outputs under `texts_dir` and `stats_dir`.
    pub fn new(
        source: &DocumentSource,
        total_pages: u32,
        texts_dir: &Path,
        stats_dir: &Path,
    ) -> Self {
        Self {
            id: source.id.clone(),
            path: source.path.clone(),
            total_pages,
            text_path: texts_dir.join(format!("{}.txt", source.id)),
            stats_path: stats_dir.join(format!("{}_stats.json", source.id)),
        }
    }
}

/// A contiguous, inclusive, 1-based range of pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    /// Create a new range. `start` must be at least 1 and not after `end`.
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start >= 1 && start <= end);
        Self { start, end }
    }

    /// Number of pages in the range.
    pub fn len(&self) -> u32 {
        self.end - self.start + 1
    }

    /// Page numbers in ascending order.
    pub fn pages(&self) -> RangeInclusive<u32> {
        self.start..=self.end
    }

    /// Does this range include `page`?
    pub fn contains(&self, page: u32) -> bool {
        self.pages().contains(&page)
    }

    /// Split into at most `parts` contiguous, nearly equal sub-ranges.
    pub fn split(&self, parts: u32) -> Vec<PageRange> {
        let parts = parts.clamp(1, self.len());
        let base = self.len() / parts;
        let extra = self.len() % parts;
        let mut start = self.start;
        (0..parts)
            .map(|i| {
                let len = base + u32::from(i < extra);
                let range = PageRange::new(start, start + len - 1);
                start += len;
                range
            })
            .collect()
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Split `[1, total_pages]` into consecutive batches of at most `batch_size`
/// pages.
pub fn plan_batches(total_pages: u32, batch_size: u32) -> Vec<PageRange> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::new();
    let mut start = 1;
    while start <= total_pages {
        let end = total_pages.min(start.saturating_add(batch_size - 1));
        batches.push(PageRange::new(start, end));
        start = end + 1;
    }
    batches
}

/// Handle to a rendered page image, owned by the batch that produced it.
#[derive(Clone, Debug)]
pub struct PageImage {
    path: PathBuf,
}

impl PageImage {
    /// Wrap an image file.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Where the image lives on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the encoded image.
    pub async fn read_bytes(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("cannot read page image {:?}", self.path))
    }
}

/// One page waiting for recognition.
#[derive(Clone, Debug)]
pub struct PageTask {
    pub document: DocumentId,
    pub page: u32,
    pub image: PageImage,
}

/// Engines and services which can produce page text.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    /// Digital text read straight from the document.
    Native,
    /// Local `tesseract`.
    Tesseract,
    /// Google Cloud Vision.
    Google,
    /// AWS Textract.
    Aws,
}

impl ProviderId {
    /// Short name used in output files and the ledger.
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::Native => "native",
            ProviderId::Tesseract => "tesseract",
            ProviderId::Google => "google",
            ProviderId::Aws => "aws",
        }
    }

    /// Approximate price of one page, in US dollars.
    pub fn estimated_page_cost(self) -> f64 {
        match self {
            ProviderId::Google => 0.0015,
            ProviderId::Aws => 0.0010,
            ProviderId::Native | ProviderId::Tesseract => 0.0,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The final result for one page. Every page of a document gets exactly one.
#[derive(Clone, Debug)]
pub struct PageResult {
    /// 1-based page number.
    pub page: u32,
    /// Page text, or a placeholder describing the failure.
    pub text: String,
    /// Confidence on a 0–100 scale. Always 0 for failed pages.
    pub confidence: f64,
    /// Who produced the text. `None` if recognition failed.
    pub provider: Option<ProviderId>,
    /// Did the text come from a fallback provider?
    pub fallback: bool,
    /// Why recognition failed, if it did.
    pub error: Option<String>,
    /// Set if the text is present but below our quality thresholds.
    pub warning: Option<QualityWarning>,
    /// Raw engine output kept for QA, if any.
    pub detail: Option<String>,
    /// How many recognition requests this page needed.
    pub requests: u32,
}

impl PageResult {
    /// A page read from the document's text layer.
    pub fn native(page: u32, text: String) -> Self {
        Self {
            page,
            text,
            confidence: 100.0,
            provider: Some(ProviderId::Native),
            fallback: false,
            error: None,
            warning: None,
            detail: None,
            requests: 0,
        }
    }

    /// A placeholder for a page we could not recognize.
    pub fn failed(page: u32, error: impl fmt::Display) -> Self {
        let error = error.to_string();
        Self {
            page,
            text: format!("[OCR ERROR: {error}]"),
            confidence: 0.0,
            provider: None,
            fallback: false,
            error: Some(error),
            warning: None,
            detail: None,
            requests: 0,
        }
    }

    /// Build a result from a backend outcome, applying our quality gate.
    pub fn from_outcome(
        page: u32,
        outcome: Result<Recognition, RecognitionError>,
        gate: &QualityGate,
    ) -> Self {
        match outcome {
            Ok(recognition) => {
                let warning = gate.assess(&recognition.text, recognition.confidence);
                Self {
                    page,
                    text: recognition.text,
                    confidence: recognition.confidence,
                    provider: Some(recognition.provider),
                    fallback: recognition.fallback,
                    error: None,
                    warning,
                    detail: recognition.detail,
                    requests: recognition.requests,
                }
            }
            Err(err) => {
                let mut result = Self::failed(page, &err);
                result.requests = err.requests();
                result
            }
        }
    }

    /// Did recognition fail for this page?
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Label used for provider usage counts, e.g. `aws_fallback`.
    pub fn provider_label(&self) -> String {
        match (self.provider, self.fallback) {
            (None, _) => "error".to_owned(),
            (Some(provider), false) => provider.as_str().to_owned(),
            (Some(provider), true) => format!("{provider}_fallback"),
        }
    }

    /// Number of characters of real text on this page.
    pub fn char_count(&self) -> usize {
        if self.is_error() {
            0
        } else {
            self.text.chars().count()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_cover_every_page_once() {
        let batches = plan_batches(101, 40);
        assert_eq!(
            batches,
            vec![
                PageRange::new(1, 40),
                PageRange::new(41, 80),
                PageRange::new(81, 101),
            ]
        );
        let pages = batches.iter().flat_map(|b| b.pages()).collect::<Vec<_>>();
        assert_eq!(pages, (1..=101).collect::<Vec<_>>());
    }

    #[test]
    fn empty_document_has_no_batches() {
        assert!(plan_batches(0, 40).is_empty());
    }

    #[test]
    fn batch_size_larger_than_document() {
        assert_eq!(plan_batches(3, 50), vec![PageRange::new(1, 3)]);
    }

    #[test]
    fn split_range_for_parallel_rendering() {
        let parts = PageRange::new(11, 20).split(3);
        assert_eq!(
            parts,
            vec![
                PageRange::new(11, 14),
                PageRange::new(15, 17),
                PageRange::new(18, 20),
            ]
        );
        assert_eq!(PageRange::new(5, 6).split(4).len(), 2);
    }

    #[test]
    fn document_id_is_file_stem() {
        let id = DocumentId::from_path(Path::new("/in/Annual Report.pdf")).unwrap();
        assert_eq!(id.as_str(), "Annual Report");
    }

    #[test]
    fn failed_page_is_placeholder_with_zero_confidence() {
        let result = PageResult::failed(7, "boom");
        assert_eq!(result.text, "[OCR ERROR: boom]");
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.provider_label(), "error");
        assert_eq!(result.char_count(), 0);
    }
}
