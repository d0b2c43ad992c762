//! Reading the digital text layer of a document.

use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, ensure_command_available},
    document::Document,
    prelude::*,
    render::get_pdf_page_count,
};

/// Reads page counts and embedded text from documents.
#[async_trait]
pub trait TextLayerReader: Send + Sync + 'static {
    /// Number of pages in the document at `path`.
    async fn page_count(&self, path: &Path) -> Result<u32>;

    /// Digital text of one page, which may be empty.
    async fn page_text(&self, path: &Path, page: u32) -> Result<String>;

    /// Do the first `sample_pages` pages hold at least `min_chars`
    /// non-whitespace characters between them?
    ///
    /// Read errors count as "no text", so the document goes to recognition.
    async fn has_native_text(
        &self,
        document: &Document,
        sample_pages: u32,
        min_chars: usize,
    ) -> bool {
        let mut found = 0;
        for page in 1..=sample_pages.min(document.total_pages) {
            match self.page_text(&document.path, page).await {
                Ok(text) => found += text.chars().filter(|c| !c.is_whitespace()).count(),
                Err(err) => {
                    debug!(document = %document.id, page, "Cannot read text layer: {:#}", err);
                    return false;
                }
            }
            if found >= min_chars {
                return true;
            }
        }
        trace!(document = %document.id, found, "Not enough native text");
        found >= min_chars
    }
}

/// Reads PDFs using Poppler's `pdfinfo` and `pdftotext`.
pub struct PdfTextLayer;

impl PdfTextLayer {
    /// Fail unless the Poppler text tools are on the `PATH`.
    pub async fn ensure_installed() -> Result<()> {
        for tool in ["pdfinfo", "pdftotext"] {
            ensure_command_available(
                tool,
                "-v",
                "Install Poppler (for example `apt install poppler-utils`) and make sure it is on your PATH.",
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TextLayerReader for PdfTextLayer {
    async fn page_count(&self, path: &Path) -> Result<u32> {
        get_pdf_page_count(path).await
    }

    #[instrument(level = "trace", skip_all, fields(path = %path.display(), page))]
    async fn page_text(&self, path: &Path, page: u32) -> Result<String> {
        let output = Command::new("pdftotext")
            .args(["-layout", "-enc", "UTF-8", "-f"])
            .arg(page.to_string())
            .arg("-l")
            .arg(page.to_string())
            .arg(path)
            .arg("-")
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run pdftotext on {:?}", path.display()))?;
        check_for_command_failure("pdftotext", &output, None)?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .trim_end_matches('\u{c}')
            .to_owned())
    }
}
