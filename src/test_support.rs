//! Fakes for exercising the pipeline without external tools or services.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use image::{GrayImage, Luma};
use keen_retry::RetryResult;
use tempfile::TempDir;

use crate::{
    backends::{
        BackendKind, Recognition, RecognitionBackend, RecognitionError,
        cloud::{CloudProvider, ProviderText},
        tesseract::{PassEngine, PassOutput},
    },
    document::{DocumentId, PageImage, PageRange, PageTask, ProviderId},
    prelude::*,
    render::{RenderedBatch, RenderedPage, Renderer},
    retry::{ProviderRetryResult, retry_result_fatal, retry_result_ok, retry_result_transient},
    text_layer::TextLayerReader,
};

/// Write a small page image: white, with a few dark "lines" of text.
pub fn write_test_image(path: &Path) -> Result<()> {
    let mut image = GrayImage::from_pixel(120, 80, Luma([255]));
    for row in [15u32, 35, 55] {
        for y in row..row + 6 {
            for x in 10..110 {
                image.put_pixel(x, y, Luma([20]));
            }
        }
    }
    image
        .save(path)
        .with_context(|| format!("cannot write {:?}", path))
}

/// Write a page image into `dir` and build a task for it.
pub fn write_test_page(dir: &Path, document: &str, page: u32) -> Result<PageTask> {
    let path = dir.join(format!("{document}-{page}.png"));
    write_test_image(&path)?;
    Ok(PageTask {
        document: DocumentId::from(document),
        page,
        image: PageImage::new(path),
    })
}

/// A [`PassEngine`] which returns canned outputs in order, recording the
/// page segmentation mode of each call.
pub struct FakePassEngine {
    outputs: Mutex<VecDeque<PassOutput>>,
    psms: Arc<Mutex<Vec<u8>>>,
}

impl FakePassEngine {
    pub fn new(outputs: Vec<(&str, f64)>, psms: Arc<Mutex<Vec<u8>>>) -> Self {
        let outputs = outputs
            .into_iter()
            .map(|(text, confidence)| PassOutput {
                text: text.to_owned(),
                confidence,
                tsv: Some(format!("level\tconf\ttext\n5\t{confidence}\t{text}\n")),
            })
            .collect();
        Self {
            outputs: Mutex::new(outputs),
            psms,
        }
    }
}

#[async_trait]
impl PassEngine for FakePassEngine {
    async fn run_pass(&self, _image: &Path, psm: u8) -> Result<PassOutput> {
        self.psms.lock().expect("lock poisoned").push(psm);
        self.outputs
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .ok_or_else(|| anyhow!("no more fake passes"))
    }

    async fn detect_rotation(&self, _image: &Path) -> Result<u32> {
        Ok(0)
    }
}

/// One scripted response from a [`FakeProvider`].
#[derive(Clone, Debug)]
pub enum ScriptedResponse {
    Text(String, f64),
    Transient(String),
    Fatal(String),
}

enum ProviderBehavior {
    Always(String, f64),
    FailingOnPages(String, BTreeSet<u32>),
    Scripted(Mutex<VecDeque<ScriptedResponse>>),
    Slow(String, Duration),
}

/// A [`CloudProvider`] with canned behavior.
pub struct FakeProvider {
    id: ProviderId,
    behavior: ProviderBehavior,
    calls: AtomicUsize,
}

impl FakeProvider {
    /// Always succeed.
    pub fn always(id: ProviderId, text: &str, confidence: f64) -> Self {
        Self::with_behavior(id, ProviderBehavior::Always(text.to_owned(), confidence))
    }

    /// Fail fatally on `pages`, and succeed with confidence 90 elsewhere.
    pub fn failing_on_pages(id: ProviderId, text: &str, pages: &[u32]) -> Self {
        Self::with_behavior(
            id,
            ProviderBehavior::FailingOnPages(text.to_owned(), pages.iter().copied().collect()),
        )
    }

    /// Play back `responses` in order, then fail fatally.
    pub fn scripted(id: ProviderId, responses: Vec<ScriptedResponse>) -> Self {
        Self::with_behavior(id, ProviderBehavior::Scripted(Mutex::new(responses.into())))
    }

    /// Succeed, but only after `delay`.
    pub fn slow(id: ProviderId, text: &str, delay: Duration) -> Self {
        Self::with_behavior(id, ProviderBehavior::Slow(text.to_owned(), delay))
    }

    fn with_behavior(id: ProviderId, behavior: ProviderBehavior) -> Self {
        Self {
            id,
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    /// How many times we were called.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn provider_text(text: &str, confidence: f64) -> ProviderText {
    ProviderText {
        text: text.to_owned(),
        confidence,
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn annotate(&self, task: &PageTask, image: &[u8]) -> ProviderRetryResult<ProviderText> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if image.is_empty() {
            return retry_result_fatal(anyhow!("empty image"));
        }
        match &self.behavior {
            ProviderBehavior::Always(text, confidence) => {
                retry_result_ok(provider_text(text, *confidence))
            }
            ProviderBehavior::FailingOnPages(_, pages) if pages.contains(&task.page) => {
                retry_result_fatal(anyhow!("{} rejected page {}", self.id, task.page))
            }
            ProviderBehavior::FailingOnPages(text, _) => retry_result_ok(provider_text(text, 90.0)),
            ProviderBehavior::Slow(text, delay) => {
                tokio::time::sleep(*delay).await;
                retry_result_ok(provider_text(text, 90.0))
            }
            ProviderBehavior::Scripted(responses) => {
                let next = responses.lock().expect("lock poisoned").pop_front();
                match next {
                    Some(ScriptedResponse::Text(text, confidence)) => {
                        retry_result_ok(provider_text(&text, confidence))
                    }
                    Some(ScriptedResponse::Transient(msg)) => retry_result_transient(anyhow!(msg)),
                    Some(ScriptedResponse::Fatal(msg)) => retry_result_fatal(anyhow!(msg)),
                    None => RetryResult::Fatal {
                        input: (),
                        error: anyhow!("script exhausted"),
                    },
                }
            }
        }
    }
}

/// A [`TextLayerReader`] serving canned page text.
pub struct FakeTextLayer {
    default_pages: Option<Vec<String>>,
    documents: BTreeMap<String, Vec<String>>,
    /// Page count to report when page text can't be read.
    failing_pages: Option<u32>,
}

impl FakeTextLayer {
    /// Every document has these pages.
    pub fn with_pages(pages: Vec<String>) -> Self {
        Self {
            default_pages: Some(pages),
            documents: BTreeMap::new(),
            failing_pages: None,
        }
    }

    /// Documents have `pages` pages, but their text can't be read.
    pub fn failing(pages: u32) -> Self {
        Self {
            default_pages: None,
            documents: BTreeMap::new(),
            failing_pages: Some(pages),
        }
    }

    /// Documents can't be opened at all.
    pub fn unreadable() -> Self {
        Self {
            default_pages: None,
            documents: BTreeMap::new(),
            failing_pages: None,
        }
    }

    /// Give the document with file stem `stem` its own pages.
    pub fn with_document(mut self, stem: &str, pages: Vec<String>) -> Self {
        self.documents.insert(stem.to_owned(), pages);
        self
    }

    fn pages_for(&self, path: &Path) -> Option<&Vec<String>> {
        let stem = path.file_stem()?.to_string_lossy();
        self.documents
            .get(stem.as_ref())
            .or(self.default_pages.as_ref())
    }
}

#[async_trait]
impl TextLayerReader for FakeTextLayer {
    async fn page_count(&self, path: &Path) -> Result<u32> {
        if let Some(pages) = self.pages_for(path) {
            return Ok(u32::try_from(pages.len())?);
        }
        self.failing_pages
            .ok_or_else(|| anyhow!("cannot open {:?}: file is damaged", path))
    }

    async fn page_text(&self, path: &Path, page: u32) -> Result<String> {
        let pages = self
            .pages_for(path)
            .ok_or_else(|| anyhow!("no text layer in {:?}", path))?;
        pages
            .get(page as usize - 1)
            .cloned()
            .ok_or_else(|| anyhow!("no page {} in {:?}", page, path))
    }
}

/// A [`Renderer`] which writes real (tiny) page images to a temporary
/// directory.
#[derive(Default)]
pub struct FakeRenderer {
    skip_page: Option<u32>,
    fail_from_page: Option<u32>,
    ranges: Mutex<Vec<String>>,
}

impl FakeRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Silently leave out one page.
    pub fn skipping_page(mut self, page: u32) -> Self {
        self.skip_page = Some(page);
        self
    }

    /// Fail any batch which reaches `page`.
    pub fn failing_from_page(mut self, page: u32) -> Self {
        self.fail_from_page = Some(page);
        self
    }

    /// The ranges we were asked to render, as `a-b`.
    pub fn ranges(&self) -> Vec<String> {
        self.ranges.lock().expect("lock poisoned").clone()
    }

    /// How many batches we were asked to render.
    pub fn calls(&self) -> usize {
        self.ranges.lock().expect("lock poisoned").len()
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, path: &Path, range: PageRange) -> Result<RenderedBatch> {
        self.ranges
            .lock()
            .expect("lock poisoned")
            .push(range.to_string());
        if self.fail_from_page.is_some_and(|page| range.end >= page) {
            bail!("fake renderer cannot read {:?}", path);
        }
        let tmpdir = TempDir::with_prefix("fake-render")?;
        let mut pages = vec![];
        for page in range.pages() {
            if self.skip_page == Some(page) {
                continue;
            }
            let image = tmpdir.path().join(format!("page-{page}.png"));
            write_test_image(&image)?;
            pages.push(RenderedPage {
                page,
                image: PageImage::new(image),
            });
        }
        Ok(RenderedBatch {
            range,
            pages,
            tmpdir: Some(tmpdir),
        })
    }
}

/// What a [`FakeBackend`] does for one page.
pub struct Outcome {
    result: std::result::Result<(String, f64), String>,
    delay: Duration,
}

impl Outcome {
    pub fn text(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            result: Ok((text.into(), confidence)),
            delay: Duration::ZERO,
        }
    }

    pub fn error(msg: &str) -> Self {
        Self {
            result: Err(msg.to_owned()),
            delay: Duration::ZERO,
        }
    }

    /// Take `delay` before answering.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Script = dyn Fn(u32) -> Outcome + Send + Sync;

/// A [`RecognitionBackend`] driven by a per-page script. Answers as Google.
pub struct FakeBackend {
    script: Box<Script>,
    kind: BackendKind,
    calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(script: impl Fn(u32) -> Outcome + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            kind: BackendKind::Cloud,
            calls: AtomicUsize::new(0),
        }
    }

    /// How many pages we were asked to recognize.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecognitionBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn recognize(&self, task: &PageTask) -> Result<Recognition, RecognitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = (self.script)(task.page);
        if !outcome.delay.is_zero() {
            tokio::time::sleep(outcome.delay).await;
        }
        match outcome.result {
            Ok((text, confidence)) => Ok(Recognition {
                text,
                confidence,
                provider: ProviderId::Google,
                fallback: false,
                detail: None,
                requests: 1,
            }),
            Err(message) => Err(RecognitionError::Engine {
                message,
                requests: 1,
            }),
        }
    }
}
