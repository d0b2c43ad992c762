//! Per-document control flow.
//!
//! ```text
//! Pending ─┬─> NativeExtract ─┬─> Written ──> Recorded
//!          └─> Recognizing  ──┘
//!    any step ──> Failed
//! ```

use std::{fmt, sync::Arc};

use crate::{
    backends::BackendKind,
    config::Config,
    document::{Document, DocumentId, DocumentSource, PageResult},
    ledger::ProgressLedger,
    output::{DocumentStats, DocumentWriter, ProcessingPath, SectionStyle, normalize_whitespace},
    prelude::*,
    scheduler::BatchScheduler,
    text_layer::TextLayerReader,
};

/// Where a document is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentState {
    Pending,
    NativeExtract,
    Recognizing,
    Written,
    Recorded,
    Failed,
}

impl DocumentState {
    /// Is `next` a legal next state?
    pub fn can_advance_to(self, next: DocumentState) -> bool {
        use DocumentState::*;
        matches!(
            (self, next),
            (Pending, NativeExtract | Recognizing)
                | (NativeExtract | Recognizing, Written)
                | (Written, Recorded)
                | (Pending | NativeExtract | Recognizing | Written, Failed)
        )
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks and logs one document's state changes.
struct StateTracker {
    id: DocumentId,
    state: DocumentState,
}

impl StateTracker {
    fn new(id: DocumentId) -> Self {
        Self {
            id,
            state: DocumentState::Pending,
        }
    }

    fn advance(&mut self, next: DocumentState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!(document = %self.id, from = %self.state, to = %next, "Document state");
        self.state = next;
    }
}

/// How a document ended.
#[derive(Debug)]
pub enum DocumentOutcome {
    /// Output and stats written, and the ledger updated.
    Recorded(DocumentStats),
    /// The document could not be processed. The ledger records why.
    Failed(String),
}

/// Runs one document from source file to ledger entry.
pub struct DocumentPipeline {
    config: Arc<Config>,
    text_layer: Arc<dyn TextLayerReader>,
    scheduler: BatchScheduler,
    ledger: Arc<ProgressLedger>,
}

impl DocumentPipeline {
    pub fn new(
        config: Arc<Config>,
        text_layer: Arc<dyn TextLayerReader>,
        scheduler: BatchScheduler,
        ledger: Arc<ProgressLedger>,
    ) -> Self {
        Self {
            config,
            text_layer,
            scheduler,
            ledger,
        }
    }

    /// Process one document. Document failures are recorded in the ledger and
    /// returned as [`DocumentOutcome::Failed`]. Only a failure to update the
    /// ledger itself is returned as an error.
    #[instrument(level = "info", skip_all, fields(document = %source.id))]
    pub async fn process(&self, source: &DocumentSource) -> Result<DocumentOutcome> {
        let mut tracker = StateTracker::new(source.id.clone());
        match self.convert(source, &mut tracker).await {
            Ok(stats) => {
                self.ledger
                    .mark_completed(
                        &source.id,
                        stats.total_pages,
                        &stats.dominant_provider(),
                        &stats.usage(),
                    )
                    .await?;
                tracker.advance(DocumentState::Recorded);
                info!(
                    pages = stats.total_pages,
                    mean_confidence = stats.mean_confidence,
                    low_quality = stats.low_quality_pages,
                    failed_pages = stats.failed_pages,
                    "Document complete"
                );
                Ok(DocumentOutcome::Recorded(stats))
            }
            Err(err) => {
                let msg = format!("{err:#}");
                error!("Document failed: {}", msg);
                tracker.advance(DocumentState::Failed);
                self.ledger.mark_failed(&source.id, &msg).await?;
                Ok(DocumentOutcome::Failed(msg))
            }
        }
    }

    async fn convert(
        &self,
        source: &DocumentSource,
        tracker: &mut StateTracker,
    ) -> Result<DocumentStats> {
        let total_pages = self
            .text_layer
            .page_count(&source.path)
            .await
            .with_context(|| format!("cannot open {:?}", source.path))?;
        let document = Document::new(
            source,
            total_pages,
            &self.config.texts_dir(),
            &self.config.stats_dir(),
        );
        let native = self
            .text_layer
            .has_native_text(
                &document,
                self.config.native_sample_pages,
                self.config.native_min_chars,
            )
            .await;

        let (style, path) = if native {
            tracker.advance(DocumentState::NativeExtract);
            (SectionStyle::Native, ProcessingPath::NativeExtract)
        } else {
            tracker.advance(DocumentState::Recognizing);
            let style = match self.scheduler.backend_kind() {
                BackendKind::Local => SectionStyle::Local,
                BackendKind::Cloud => SectionStyle::Cloud,
            };
            (style, ProcessingPath::Recognizing)
        };
        info!(pages = total_pages, ?path, "Processing document");

        let tsv_dir = self.config.tsv_dir();
        let mut writer = DocumentWriter::create(&document, style, tsv_dir.as_deref()).await?;
        let written = match path {
            ProcessingPath::NativeExtract => self.extract_native(&document, &mut writer).await,
            ProcessingPath::Recognizing => self.scheduler.run(&document, &mut writer).await,
        };
        if let Err(err) = written {
            writer.abandon().await;
            return Err(err);
        }
        tracker.advance(DocumentState::Written);
        writer.finish(path).await
    }

    /// Copy each page's digital text, in order.
    async fn extract_native(&self, document: &Document, writer: &mut DocumentWriter) -> Result<()> {
        for page in 1..=document.total_pages {
            let result = match self.text_layer.page_text(&document.path, page).await {
                Ok(text) if self.config.normalize_whitespace => {
                    PageResult::native(page, normalize_whitespace(&text))
                }
                Ok(text) => PageResult::native(page, text),
                Err(err) => {
                    warn!(document = %document.id, page, "Cannot extract page text: {:#}", err);
                    PageResult::failed(page, format!("{err:#}"))
                }
            };
            writer.write_page(&result).await?;
        }
        Ok(())
    }
}
