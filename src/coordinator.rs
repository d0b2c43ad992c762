//! Finding documents and driving a whole run.

use std::{
    collections::BTreeSet,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    document::DocumentSource,
    ledger::ProgressLedger,
    pipeline::{DocumentOutcome, DocumentPipeline},
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// List the documents in `dir` whose extension is one of `extensions`
/// (case-insensitive), sorted by file name. Not recursive.
///
/// Two files with the same stem would share outputs and a ledger entry, so
/// only the first (by name) is kept.
pub async fn enumerate_documents(dir: &Path, extensions: &[String]) -> Result<Vec<DocumentSource>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("cannot read input directory {:?}", dir))?;
    let mut paths = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("cannot read input directory {:?}", dir))?
    {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let matches = path.extension().is_some_and(|ext| {
            let ext = ext.to_string_lossy();
            extensions.iter().any(|want| want.eq_ignore_ascii_case(&ext))
        });
        if matches {
            paths.push(path);
        }
    }
    paths.sort();

    let mut seen = BTreeSet::new();
    let mut sources = vec![];
    for path in paths {
        let source = DocumentSource::new(path)?;
        if !seen.insert(source.id.clone()) {
            warn!(
                "Skipping {:?}: another document is already named {:?}",
                source.path, source.id.as_str()
            );
            continue;
        }
        sources.push(source);
    }
    Ok(sources)
}

/// Split `sources` into documents to process and documents to skip because
/// the ledger already has them.
pub async fn resume_filter(
    ledger: &ProgressLedger,
    sources: Vec<DocumentSource>,
    resume: bool,
) -> (Vec<DocumentSource>, Vec<DocumentSource>) {
    if !resume {
        return (sources, vec![]);
    }
    let mut pending = vec![];
    let mut skipped = vec![];
    for source in sources {
        if ledger.is_completed(&source.id).await {
            debug!(document = %source.id, "Already completed, skipping");
            skipped.push(source);
        } else {
            pending.push(source);
        }
    }
    (pending, skipped)
}

/// What happened during one run.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    pub found: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Pages written during this run.
    pub pages: u64,
    pub elapsed: Duration,
    /// Ledger totals after the run.
    pub cumulative_pages: u64,
    pub cumulative_requests: u64,
    pub cumulative_cost: f64,
}

impl RunSummary {
    /// Throughput for this run.
    pub fn pages_per_minute(&self) -> f64 {
        let minutes = self.elapsed.as_secs_f64() / 60.0;
        if minutes > 0.0 {
            self.pages as f64 / minutes
        } else {
            0.0
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Documents: {} found, {} skipped, {} succeeded, {} failed",
            self.found, self.skipped, self.succeeded, self.failed
        )?;
        writeln!(
            f,
            "Pages: {} in {:.1}s ({:.1} pages/min)",
            self.pages,
            self.elapsed.as_secs_f64(),
            self.pages_per_minute()
        )?;
        write!(
            f,
            "All runs: {} pages, {} requests, estimated cost ${:.4}",
            self.cumulative_pages, self.cumulative_requests, self.cumulative_cost
        )
    }
}

/// Processes documents one at a time, in order.
pub struct RunCoordinator {
    ledger: Arc<ProgressLedger>,
    pipeline: DocumentPipeline,
    ui: Ui,
}

impl RunCoordinator {
    pub fn new(ledger: Arc<ProgressLedger>, pipeline: DocumentPipeline, ui: Ui) -> Self {
        Self {
            ledger,
            pipeline,
            ui,
        }
    }

    /// Process every document in `pending`. A failed document does not stop
    /// the run. A ledger that can't be saved does, since we could no longer
    /// resume correctly.
    #[instrument(level = "debug", skip_all, fields(pending = pending.len()))]
    pub async fn run(
        &self,
        pending: Vec<DocumentSource>,
        found: usize,
        skipped: usize,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary {
            found,
            skipped,
            ..RunSummary::default()
        };

        let pb = self.ui.new_progress_bar(
            &ProgressConfig {
                emoji: "📄",
                msg: "Documents",
                done_msg: "Documents done",
            },
            pending.len() as u64,
        );
        for source in &pending {
            let outcome = self
                .pipeline
                .process(source)
                .await
                .with_context(|| format!("cannot record progress for {}", source.id))?;
            match outcome {
                DocumentOutcome::Recorded(stats) => {
                    summary.succeeded += 1;
                    summary.pages += u64::from(stats.total_pages);
                }
                DocumentOutcome::Failed(_) => summary.failed += 1,
            }
            pb.inc(1);
        }
        pb.finish_using_style();

        summary.elapsed = started.elapsed();
        let totals = self.ledger.snapshot().await;
        summary.cumulative_pages = totals.total_pages_processed;
        summary.cumulative_requests = totals.total_requests;
        summary.cumulative_cost = totals.total_cost();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::{
        config::Config,
        scheduler::BatchScheduler,
        test_support::{FakeBackend, FakeRenderer, FakeTextLayer, Outcome},
    };

    use super::*;

    async fn touch(dir: &Path, names: &[&str]) -> Result<()> {
        for name in names {
            tokio::fs::write(dir.join(name), b"%PDF-1.4\n").await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn enumeration_is_sorted_filtered_and_case_insensitive() -> Result<()> {
        let dir = TempDir::with_prefix("input")?;
        touch(dir.path(), &["b.pdf", "a.PDF", "notes.txt", "c.pdf"]).await?;
        tokio::fs::create_dir(dir.path().join("nested.pdf")).await?;
        let docs = enumerate_documents(dir.path(), &["pdf".to_owned()]).await?;
        let ids = docs.iter().map(|d| d.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b", "c"]);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_stems_are_skipped() -> Result<()> {
        let dir = TempDir::with_prefix("input")?;
        touch(dir.path(), &["scan.pdf", "scan.tif"]).await?;
        let docs = enumerate_documents(dir.path(), &["pdf".to_owned(), "tif".to_owned()]).await?;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].path.file_name().unwrap(), "scan.pdf");
        Ok(())
    }

    #[tokio::test]
    async fn missing_input_dir_is_an_error() {
        let err = enumerate_documents(Path::new("/no/such/dir"), &["pdf".to_owned()])
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("cannot read input directory"));
    }

    #[test]
    fn summary_reports_throughput() {
        let summary = RunSummary {
            found: 3,
            skipped: 1,
            succeeded: 1,
            failed: 1,
            pages: 30,
            elapsed: Duration::from_secs(30),
            ..RunSummary::default()
        };
        assert_eq!(summary.pages_per_minute(), 60.0);
        let text = summary.to_string();
        assert!(text.contains("3 found, 1 skipped, 1 succeeded, 1 failed"));
        assert!(text.contains("60.0 pages/min"));
    }

    struct Run {
        input: TempDir,
        output: TempDir,
        backend: Arc<FakeBackend>,
    }

    impl Run {
        fn new() -> Result<Self> {
            Ok(Self {
                input: TempDir::with_prefix("input")?,
                output: TempDir::with_prefix("output")?,
                backend: Arc::new(FakeBackend::new(|page| {
                    Outcome::text(format!("scanned text {page}"), 90.0)
                })),
            })
        }

        fn config(&self) -> Arc<Config> {
            Arc::new(Config {
                input_dir: self.input.path().to_owned(),
                output_dir: self.output.path().to_owned(),
                batch_size: 2,
                ocr_jobs: 2,
                min_page_chars: 1,
                ..Config::default()
            })
        }

        /// Run once over the input directory, as the CLI would.
        async fn run(&self, text_layer: FakeTextLayer) -> Result<RunSummary> {
            let config = self.config();
            let sources = enumerate_documents(&config.input_dir, &config.extensions).await?;
            let found = sources.len();
            let ledger = Arc::new(ProgressLedger::open(&config.ledger_path()).await?);
            let (pending, skipped) = resume_filter(&ledger, sources, config.resume).await;
            let ui = Ui::init_for_tests();
            let scheduler = BatchScheduler::new(
                Arc::new(FakeRenderer::new()),
                self.backend.clone(),
                &config,
                ui.clone(),
            );
            let pipeline =
                DocumentPipeline::new(config.clone(), Arc::new(text_layer), scheduler, ledger.clone());
            RunCoordinator::new(ledger, pipeline, ui)
                .run(pending, found, skipped.len())
                .await
        }
    }

    fn scanned(pages: usize) -> Vec<String> {
        vec![String::new(); pages]
    }

    #[tokio::test]
    async fn failed_document_does_not_stop_the_run() -> Result<()> {
        let run = Run::new()?;
        touch(run.input.path(), &["a.pdf", "b.pdf", "c.pdf"]).await?;
        let layer = FakeTextLayer::unreadable()
            .with_document("a", scanned(3))
            .with_document("c", scanned(2));
        let summary = run.run(layer).await?;
        assert_eq!(summary.found, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pages, 5);
        assert_eq!(summary.cumulative_pages, 5);

        let ledger = ProgressLedger::open(&run.config().ledger_path()).await?;
        let data = ledger.snapshot().await;
        assert_eq!(data.completed.len(), 2);
        assert_eq!(data.outstanding_failures().len(), 1);
        assert_eq!(data.outstanding_failures()[0].document.as_str(), "b");
        Ok(())
    }

    #[tokio::test]
    async fn resumed_run_skips_completed_documents() -> Result<()> {
        let run = Run::new()?;
        touch(run.input.path(), &["a.pdf", "b.pdf"]).await?;
        let layer = || FakeTextLayer::with_pages(scanned(3));

        let first = run.run(layer()).await?;
        assert_eq!(first.succeeded, 2);
        assert_eq!(run.backend.calls(), 6);
        let texts = run.config().texts_dir();
        let before = tokio::fs::read_to_string(texts.join("a.txt")).await?;

        let second = run.run(layer()).await?;
        assert_eq!(second.skipped, 2);
        assert_eq!(second.succeeded, 0);
        assert_eq!(second.pages, 0);
        assert_eq!(run.backend.calls(), 6);
        assert_eq!(second.cumulative_pages, 6);
        let after = tokio::fs::read_to_string(texts.join("a.txt")).await?;
        assert_eq!(before, after);
        Ok(())
    }

    #[tokio::test]
    async fn previously_failed_document_is_retried() -> Result<()> {
        let run = Run::new()?;
        touch(run.input.path(), &["a.pdf"]).await?;

        let first = run.run(FakeTextLayer::unreadable()).await?;
        assert_eq!(first.failed, 1);

        let second = run.run(FakeTextLayer::with_pages(scanned(2))).await?;
        assert_eq!(second.succeeded, 1);
        let ledger = ProgressLedger::open(&run.config().ledger_path()).await?;
        assert!(ledger.snapshot().await.outstanding_failures().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn empty_input_dir_is_a_successful_run() -> Result<()> {
        let run = Run::new()?;
        let summary = run.run(FakeTextLayer::with_pages(vec![])).await?;
        assert_eq!(summary.found, 0);
        assert_eq!(summary.succeeded + summary.failed + summary.skipped, 0);
        Ok(())
    }
}
