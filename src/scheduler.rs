//! Memory-bounded, ordered, concurrent recognition of a whole document.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    backends::{BackendKind, RecognitionBackend},
    config::Config,
    document::{Document, PageResult, PageTask, plan_batches},
    output::{DocumentWriter, normalize_whitespace},
    pool::{TaskGranularity, WorkerPool},
    prelude::*,
    quality::QualityGate,
    render::{RenderedBatch, Renderer},
    ui::{ProgressConfig, Ui},
};

/// Splits a document into batches, renders and recognizes each batch, and
/// writes the results in page order.
///
/// Batches run strictly one after another, so at most one batch of images
/// exists at a time. Pages within a batch are recognized in parallel.
pub struct BatchScheduler {
    renderer: Arc<dyn Renderer>,
    backend: Arc<dyn RecognitionBackend>,
    pool: WorkerPool,
    batch_size: u32,
    gate: QualityGate,
    normalize: bool,
    ui: Ui,
}

impl BatchScheduler {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        backend: Arc<dyn RecognitionBackend>,
        config: &Config,
        ui: Ui,
    ) -> Self {
        let granularity = match backend.kind() {
            BackendKind::Local => TaskGranularity::CpuBound,
            BackendKind::Cloud => TaskGranularity::IoBound,
        };
        // Backends that queue for rate-limit slots time their own pages, so
        // that waiting in the queue doesn't count against the page.
        let page_timeout = (!backend.manages_page_timeout()).then_some(config.page_timeout);
        Self {
            renderer,
            backend,
            pool: WorkerPool::new(granularity, config.ocr_jobs, page_timeout),
            batch_size: config.batch_size,
            gate: QualityGate {
                min_chars: config.min_page_chars,
                min_confidence: config.confidence_threshold,
            },
            normalize: config.normalize_whitespace,
            ui,
        }
    }

    /// The kind of backend we're scheduling for.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Recognize every page of `document`, writing results to `writer`.
    ///
    /// A render failure fails the whole document. Page failures become
    /// placeholder pages.
    #[instrument(level = "debug", skip_all, fields(document = %document.id))]
    pub async fn run(&self, document: &Document, writer: &mut DocumentWriter) -> Result<()> {
        let batches = plan_batches(document.total_pages, self.batch_size);
        debug!(
            batches = batches.len(),
            workers = self.pool.concurrency(),
            granularity = %self.pool.granularity(),
            "Scheduling document"
        );
        for range in batches {
            let batch = self
                .renderer
                .render(&document.path, range)
                .await
                .with_context(|| format!("cannot render pages {range} of {}", document.id))?;
            let results = self.recognize_batch(document, &batch).await;

            // Release this batch's images before we touch the next one.
            drop(batch);
            trace!(%range, "Released batch images");

            for result in &results {
                writer.write_page(result).await?;
            }
        }
        Ok(())
    }

    /// Recognize one rendered batch, returning exactly one result per page in
    /// ascending page order.
    async fn recognize_batch(&self, document: &Document, batch: &RenderedBatch) -> Vec<PageResult> {
        let range = batch.range;
        let msg = format!("{} p{}", document.id, range);
        let pb = self.ui.new_progress_bar(
            &ProgressConfig {
                emoji: "🔍",
                msg: &msg,
                done_msg: &msg,
            },
            u64::from(range.len()),
        );

        let items = batch
            .pages
            .iter()
            .filter(|rendered| range.contains(rendered.page))
            .map(|rendered| {
                let task = PageTask {
                    document: document.id.clone(),
                    page: rendered.page,
                    image: rendered.image.clone(),
                };
                (rendered.page, task)
            })
            .collect::<Vec<_>>();

        let backend = self.backend.clone();
        let outcomes = self
            .pool
            .run_all(
                items,
                move |task: PageTask| {
                    let backend = backend.clone();
                    async move { backend.recognize(&task).await }
                },
                || pb.inc(1),
            )
            .await;
        pb.finish_using_style();

        let mut by_page = outcomes
            .into_iter()
            .map(|(page, outcome)| (page, PageResult::from_outcome(page, outcome, &self.gate)))
            .collect::<BTreeMap<_, _>>();

        range
            .pages()
            .map(|page| {
                let mut result = by_page
                    .remove(&page)
                    .unwrap_or_else(|| PageResult::failed(page, "no image was rendered for this page"));
                if let Some(error) = &result.error {
                    warn!(document = %document.id, page, "Page failed: {}", error);
                } else {
                    if self.normalize {
                        result.text = normalize_whitespace(&result.text);
                    }
                    if let Some(warning) = &result.warning {
                        warn!(document = %document.id, page, "Low quality page: {}", warning);
                    }
                }
                result
            })
            .collect()
    }
}
