//! Local recognition with `tesseract`, using a fast pass and an optional
//! second pass for low-confidence pages.

use std::time::Instant;

use image::GrayImage;
use tempfile::TempDir;
use tokio::process::Command;

use crate::{
    async_utils::{
        check_for_command_failure, ensure_command_available,
        spawn_blocking_propagating_panics,
    },
    config::Config,
    document::{PageTask, ProviderId},
    prelude::*,
};

use super::{
    BackendKind, Recognition, RecognitionBackend, RecognitionError, preprocess,
};

/// Page segmentation mode for the first pass: one uniform block of text.
pub const FAST_PASS_PSM: u8 = 6;

/// Page segmentation mode for the second pass: sparse text with orientation
/// detection, which copes better with columns, stamps and scattered text.
pub const SECOND_PASS_PSM: u8 = 12;

/// Output of one engine pass over a page.
#[derive(Clone, Debug, PartialEq)]
pub struct PassOutput {
    pub text: String,
    /// Mean word confidence, 0–100.
    pub confidence: f64,
    /// Raw TSV output, if the engine produces it.
    pub tsv: Option<String>,
}

/// One way of running a local recognition pass.
#[async_trait]
pub trait PassEngine: Send + Sync + 'static {
    /// Recognize the image at `image` using page segmentation mode `psm`.
    async fn run_pass(&self, image: &Path, psm: u8) -> Result<PassOutput>;

    /// Detect how many degrees clockwise the page must be rotated to be
    /// upright.
    async fn detect_rotation(&self, image: &Path) -> Result<u32>;
}

/// The `tesseract` command-line tool.
pub struct TesseractCli {
    program: PathBuf,
    languages: String,
}

impl TesseractCli {
    /// Create an engine using the given language codes.
    pub fn new(languages: Vec<String>) -> Self {
        Self {
            program: PathBuf::from("tesseract"),
            languages: languages.join("+"),
        }
    }

    /// Run `program` instead of the `tesseract` on the `PATH`.
    #[cfg(test)]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Fail unless `tesseract` is on the `PATH`.
    pub async fn ensure_installed() -> Result<()> {
        ensure_command_available(
            "tesseract",
            "--version",
            "Install Tesseract OCR (for example `apt install tesseract-ocr`) and make sure it is on your PATH.",
        )
        .await
    }
}

#[async_trait]
impl PassEngine for TesseractCli {
    #[instrument(level = "trace", skip_all, fields(psm))]
    async fn run_pass(&self, image: &Path, psm: u8) -> Result<PassOutput> {
        let tmpdir = TempDir::with_prefix("tesseract")?;
        let out_base = tmpdir.path().join("page");
        let output = Command::new(&self.program)
            .arg(image)
            .arg(&out_base)
            .args(["--oem", "1", "--psm"])
            .arg(psm.to_string())
            .arg("-l")
            .arg(&self.languages)
            .args(["-c", "preserve_interword_spaces=1", "txt", "tsv"])
            .kill_on_drop(true)
            .output()
            .await
            .context("cannot run tesseract")?;
        check_for_command_failure("tesseract", &output, None)?;

        let text = tokio::fs::read_to_string(out_base.with_extension("txt"))
            .await
            .context("cannot read tesseract text output")?;
        let tsv = tokio::fs::read_to_string(out_base.with_extension("tsv"))
            .await
            .context("cannot read tesseract TSV output")?;
        Ok(PassOutput {
            text,
            confidence: mean_confidence_from_tsv(&tsv),
            tsv: Some(tsv),
        })
    }

    async fn detect_rotation(&self, image: &Path) -> Result<u32> {
        let output = Command::new(&self.program)
            .arg(image)
            .arg("stdout")
            .args(["--psm", "0"])
            .kill_on_drop(true)
            .output()
            .await
            .context("cannot run tesseract orientation detection")?;
        check_for_command_failure("tesseract", &output, None)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_rotation(&stdout)
            .ok_or_else(|| anyhow!("no rotation in tesseract orientation output"))
    }
}

/// Mean of the word confidences in Tesseract TSV output. Non-word rows carry
/// `-1` and are skipped. Returns 0 if there are no words.
pub fn mean_confidence_from_tsv(tsv: &str) -> f64 {
    let (sum, count) = tsv
        .lines()
        .filter(|line| !line.starts_with("level"))
        .filter_map(|line| line.split('\t').nth(10)?.trim().parse::<f64>().ok())
        .filter(|conf| *conf >= 0.0)
        .fold((0.0, 0usize), |(sum, count), conf| (sum + conf, count + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

/// Find the `Rotate: N` line in orientation detection output.
fn parse_rotation(osd: &str) -> Option<u32> {
    osd.lines()
        .find_map(|line| line.trim().strip_prefix("Rotate:"))
        .and_then(|value| value.trim().parse().ok())
}

/// Keep the second pass only if it's strictly more confident.
pub fn choose_better(first: PassOutput, second: PassOutput) -> PassOutput {
    if second.confidence > first.confidence {
        second
    } else {
        first
    }
}

/// Settings for [`LocalTwoPassBackend`].
#[derive(Clone, Debug)]
pub struct TwoPassOptions {
    /// Run a second pass when the first is below this confidence.
    pub confidence_threshold: f64,
    /// Correct orientation and skew before the second pass.
    pub fix_orientation: bool,
}

impl TwoPassOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            fix_orientation: config.fix_orientation,
        }
    }
}

/// Local two-pass recognition.
///
/// Each page is cleaned up once. The fast pass runs first, and if its
/// confidence is below the threshold we run a second, more permissive pass
/// and keep whichever result is more confident.
pub struct LocalTwoPassBackend<E> {
    engine: E,
    options: TwoPassOptions,
}

impl<E: PassEngine> LocalTwoPassBackend<E> {
    pub fn new(engine: E, options: TwoPassOptions) -> Self {
        Self { engine, options }
    }

    async fn recognize_inner(&self, task: &PageTask) -> Result<Recognition, RecognitionError> {
        let started = Instant::now();
        let (tmpdir, clean) = prepare_page(task.image.path())
            .await
            .map_err(|err| RecognitionError::engine(&err, 0))?;
        let clean_path = tmpdir.path().join("clean.png");

        let first = self
            .engine
            .run_pass(&clean_path, FAST_PASS_PSM)
            .await
            .map_err(|err| RecognitionError::engine(&err, 1))?;
        let mut passes = 1;
        debug!(confidence = first.confidence, "Fast pass finished");

        let best = if first.confidence < self.options.confidence_threshold {
            passes += 1;
            match self.second_pass(&tmpdir, clean).await {
                Ok(second) => {
                    debug!(
                        first = first.confidence,
                        second = second.confidence,
                        "Second pass finished"
                    );
                    choose_better(first, second)
                }
                Err(err) => {
                    warn!(
                        document = %task.document,
                        page = task.page,
                        "Second pass failed, keeping first pass: {:#}",
                        err
                    );
                    first
                }
            }
        } else {
            first
        };

        trace!(elapsed = ?started.elapsed(), "Local recognition finished");
        Ok(Recognition {
            text: best.text,
            confidence: best.confidence,
            provider: ProviderId::Tesseract,
            fallback: false,
            detail: best.tsv,
            requests: passes,
        })
    }

    async fn second_pass(&self, tmpdir: &TempDir, clean: GrayImage) -> Result<PassOutput> {
        let clean_path = tmpdir.path().join("clean.png");
        if !self.options.fix_orientation {
            return self.engine.run_pass(&clean_path, SECOND_PASS_PSM).await;
        }

        let rotation = match self.engine.detect_rotation(&clean_path).await {
            Ok(rotation) => rotation,
            Err(err) => {
                debug!("Orientation detection failed, assuming upright: {:#}", err);
                0
            }
        };
        let fixed_path = tmpdir.path().join("fixed.png");
        let save_path = fixed_path.clone();
        spawn_blocking_propagating_panics(move || -> Result<()> {
            let upright = preprocess::rotate_clockwise(&clean, rotation);
            preprocess::deskew(&upright)
                .save(&save_path)
                .context("cannot save corrected page image")
        })
        .await?;
        self.engine.run_pass(&fixed_path, SECOND_PASS_PSM).await
    }
}

/// Binarize a page image once, saving it as `clean.png` in a new temporary
/// directory.
async fn prepare_page(path: &Path) -> Result<(TempDir, GrayImage)> {
    let tmpdir = TempDir::with_prefix("page")?;
    let clean_path = tmpdir.path().join("clean.png");
    let path = path.to_owned();
    let clean = spawn_blocking_propagating_panics(move || -> Result<GrayImage> {
        let clean = preprocess::load_and_binarize(&path)?;
        clean
            .save(&clean_path)
            .context("cannot save cleaned page image")?;
        Ok(clean)
    })
    .await?;
    Ok((tmpdir, clean))
}

#[async_trait]
impl<E: PassEngine> RecognitionBackend for LocalTwoPassBackend<E> {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    #[instrument(level = "debug", skip_all, fields(document = %task.document, page = task.page))]
    async fn recognize(&self, task: &PageTask) -> Result<Recognition, RecognitionError> {
        self.recognize_inner(task).await
    }
}
