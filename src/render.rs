//! Rasterizing PDF pages with Poppler's `pdftocairo`.

use std::{collections::BTreeMap, sync::LazyLock};

use futures::future::try_join_all;
use regex::Regex;
use tempfile::TempDir;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, ensure_command_available},
    document::{PageImage, PageRange},
    prelude::*,
};

/// Anything containing "error" is an error.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// ...except for damaged cross-reference tables, which Poppler repairs.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// `pdftocairo` names its output `<prefix>-<page>.png`, zero-padding the page
/// number to the width of the document's page count.
static PAGE_SUFFIX_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-(\d+)\.png$").expect("failed to compile regex"));

/// Does this line of Poppler output indicate a real error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// One rendered page.
#[derive(Clone, Debug)]
pub struct RenderedPage {
    pub page: u32,
    pub image: PageImage,
}

/// The rendered images for one batch. The images are deleted when this is
/// dropped.
#[derive(Debug)]
pub struct RenderedBatch {
    pub range: PageRange,
    pub pages: Vec<RenderedPage>,
    /// Owns the image files, if they live in a temporary directory.
    pub tmpdir: Option<TempDir>,
}

/// Turns a range of document pages into images.
#[async_trait]
pub trait Renderer: Send + Sync + 'static {
    /// Render every page in `range`. Failure fails the whole batch.
    async fn render(&self, path: &Path, range: PageRange) -> Result<RenderedBatch>;
}

/// Renders pages with `pdftocairo`.
pub struct PopplerRenderer {
    dpi: u32,
    render_jobs: usize,
}

impl PopplerRenderer {
    pub fn new(dpi: u32, render_jobs: usize) -> Self {
        Self {
            dpi,
            render_jobs: render_jobs.max(1),
        }
    }

    /// Fail unless `pdftocairo` is on the `PATH`.
    pub async fn ensure_installed() -> Result<()> {
        ensure_command_available(
            "pdftocairo",
            "-v",
            "Install Poppler (for example `apt install poppler-utils`) and make sure it is on your PATH.",
        )
        .await
    }

    /// Render one contiguous sub-range into `dir`.
    async fn render_part(&self, path: &Path, part: PageRange, dir: &Path) -> Result<()> {
        let prefix = dir.join(format!("part{}", part.start));
        let output = Command::new("pdftocairo")
            .arg("-png")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-f")
            .arg(part.start.to_string())
            .arg("-l")
            .arg(part.end.to_string())
            .arg(path)
            .arg(&prefix)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run pdftocairo on {:?}", path.display()))?;
        check_for_command_failure("pdftocairo", &output, Some(&is_error_line))
    }
}

#[async_trait]
impl Renderer for PopplerRenderer {
    #[instrument(level = "debug", skip_all, fields(path = %path.display(), range = %range))]
    async fn render(&self, path: &Path, range: PageRange) -> Result<RenderedBatch> {
        let tmpdir = TempDir::with_prefix("pages")?;
        let parts = range.split(u32::try_from(self.render_jobs).unwrap_or(u32::MAX));
        try_join_all(
            parts
                .iter()
                .map(|&part| self.render_part(path, part, tmpdir.path())),
        )
        .await
        .with_context(|| format!("failed to render pages {range} of {:?}", path.display()))?;

        let pages = collect_rendered_pages(tmpdir.path(), range).await?;
        Ok(RenderedBatch {
            range,
            pages,
            tmpdir: Some(tmpdir),
        })
    }
}

/// Find the images for `range` in `dir`, by their page-number suffix.
async fn collect_rendered_pages(dir: &Path, range: PageRange) -> Result<Vec<RenderedPage>> {
    let mut by_page = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read temporary directory {:?}", dir.display()))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed to read entry in {:?}", dir.display()))?
    {
        let path = entry.path();
        let Some(page) = page_number_from_file_name(&path) else {
            continue;
        };
        if range.contains(page) {
            by_page.insert(page, PageImage::new(path));
        }
    }
    if by_page.len() != range.len() as usize {
        let missing = range
            .pages()
            .filter(|p| !by_page.contains_key(p))
            .map(|p| p.to_string())
            .collect::<Vec<_>>();
        bail!("renderer produced no image for pages {}", missing.join(", "));
    }
    Ok(by_page
        .into_iter()
        .map(|(page, image)| RenderedPage { page, image })
        .collect())
}

/// Parse the page number from a name like `part1-007.png`.
fn page_number_from_file_name(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    PAGE_SUFFIX_REGEX
        .captures(name)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<u32> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;
    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_pdfinfo_pages(&output)
        .with_context(|| format!("failed to find page count for {:?}", path.display()))
}

fn parse_pdfinfo_pages(output: &str) -> Result<u32> {
    let value = output
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == "Pages").then(|| value.trim())
        })
        .ok_or_else(|| anyhow!("no \"Pages\" line in pdfinfo output"))?;
    value
        .parse::<u32>()
        .with_context(|| format!("invalid page count {:?}", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_error_line_works() {
        assert!(is_error_line("error: something went wrong"));
        assert!(is_error_line("ERROR: something went wrong"));
        assert!(!is_error_line("Warning: something is odd"));
        assert!(!is_error_line(
            "Internal Error: xref num 1234 not found but needed, document has changes, reconstruct aborted"
        ));
    }

    #[test]
    fn page_numbers_come_from_suffix() {
        assert_eq!(page_number_from_file_name(Path::new("/t/part41-041.png")), Some(41));
        assert_eq!(page_number_from_file_name(Path::new("/t/part1-7.png")), Some(7));
        assert_eq!(page_number_from_file_name(Path::new("/t/notes.txt")), None);
    }

    #[test]
    fn pdfinfo_pages_are_parsed() {
        let output = "Title:          Report\nPages:          12\nEncrypted:      no\n";
        assert_eq!(parse_pdfinfo_pages(output).unwrap(), 12);
        assert!(parse_pdfinfo_pages("Title: x\n").is_err());
    }

    #[tokio::test]
    async fn collected_pages_are_sorted_and_complete() -> Result<()> {
        let dir = TempDir::with_prefix("pages")?;
        for name in ["part3-05.png", "part3-03.png", "part3-04.png", "other.txt"] {
            std::fs::write(dir.path().join(name), b"")?;
        }
        let pages = collect_rendered_pages(dir.path(), PageRange::new(3, 5)).await?;
        assert_eq!(pages.iter().map(|p| p.page).collect::<Vec<_>>(), vec![3, 4, 5]);

        let err = collect_rendered_pages(dir.path(), PageRange::new(3, 6))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("6"));
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn missing_pdf_fails_to_render() {
        let renderer = PopplerRenderer::new(72, 2);
        let result = renderer
            .render(Path::new("/nonexistent/input.pdf"), PageRange::new(1, 2))
            .await;
        assert!(result.is_err());
    }
}
