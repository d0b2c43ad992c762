//! Recognition backends.
//!
//! A [`RecognitionBackend`] turns one rendered page into text. The scheduler
//! doesn't care which kind it's talking to. Backends never panic or return
//! `anyhow` errors past this boundary: every failure becomes a
//! [`RecognitionError`] for that page alone.

use std::{error, fmt, sync::Arc, time::Duration};

use crate::{
    config::{Config, EngineKind},
    document::{PageTask, ProviderId},
    prelude::*,
    retry::RetryPolicy,
};

pub mod cloud;
pub mod google;
pub mod preprocess;
pub mod tesseract;
pub mod textract;

use cloud::CloudTimeouts;

/// How a backend's work is scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Runs on our own CPUs.
    Local,
    /// Waits on a remote service.
    Cloud,
}

/// Text recognized on one page.
#[derive(Clone, Debug, PartialEq)]
pub struct Recognition {
    pub text: String,
    /// Confidence on a 0–100 scale.
    pub confidence: f64,
    pub provider: ProviderId,
    /// Did a fallback provider produce this text?
    pub fallback: bool,
    /// Raw engine output worth keeping, such as Tesseract's TSV.
    pub detail: Option<String>,
    /// Number of requests or engine passes used.
    pub requests: u32,
}

/// Why a page could not be recognized.
#[derive(Debug)]
pub enum RecognitionError {
    /// The engine or provider reported an error.
    Engine { message: String, requests: u32 },
    /// The page took longer than we allow.
    Timeout(Duration),
    /// The task running the page died.
    Crashed(String),
}

impl RecognitionError {
    /// Wrap an engine error, keeping its full context chain.
    pub fn engine(err: &anyhow::Error, requests: u32) -> Self {
        RecognitionError::Engine {
            message: format!("{err:#}"),
            requests,
        }
    }

    /// Requests spent before giving up, if known.
    pub fn requests(&self) -> u32 {
        match self {
            RecognitionError::Engine { requests, .. } => *requests,
            RecognitionError::Timeout(_) | RecognitionError::Crashed(_) => 0,
        }
    }
}

impl fmt::Display for RecognitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecognitionError::Engine { message, .. } => write!(f, "{message}"),
            RecognitionError::Timeout(limit) => {
                write!(f, "timed out after {}s", limit.as_secs())
            }
            RecognitionError::Crashed(msg) => write!(f, "worker crashed: {msg}"),
        }
    }
}

impl error::Error for RecognitionError {}

/// Something which can recognize the text on a page.
#[async_trait]
pub trait RecognitionBackend: Send + Sync + 'static {
    /// Is this CPU-bound or network-bound?
    fn kind(&self) -> BackendKind;

    /// Does [`RecognitionBackend::recognize`] enforce the page timeout itself?
    /// If not, the caller must.
    fn manages_page_timeout(&self) -> bool {
        false
    }

    /// Recognize a single page.
    async fn recognize(&self, task: &PageTask) -> Result<Recognition, RecognitionError>;
}

/// Build the backend selected by `config`. Fails if a required tool or
/// credential is missing.
pub async fn build_backend(config: &Config) -> Result<Arc<dyn RecognitionBackend>> {
    match config.engine {
        EngineKind::Local => {
            tesseract::TesseractCli::ensure_installed().await?;
            let engine = tesseract::TesseractCli::new(config.languages.clone());
            Ok(Arc::new(tesseract::LocalTwoPassBackend::new(
                engine,
                tesseract::TwoPassOptions::from_config(config),
            )))
        }
        EngineKind::Google | EngineKind::Aws => {
            let google = || -> Result<Arc<dyn cloud::CloudProvider>> {
                Ok(Arc::new(google::GoogleVisionProvider::from_env(
                    &config.languages,
                )?))
            };
            let (primary, secondary): (Arc<dyn cloud::CloudProvider>, _) =
                match config.engine {
                    EngineKind::Google => {
                        let secondary = if config.fallback {
                            Some(textract_provider(config).await?)
                        } else {
                            None
                        };
                        (google()?, secondary)
                    }
                    _ => {
                        let secondary = if config.fallback {
                            Some(google()?)
                        } else {
                            None
                        };
                        (textract_provider(config).await?, secondary)
                    }
                };
            Ok(Arc::new(cloud::CloudFallbackBackend::new(
                primary,
                secondary,
                Arc::new(config.rate_limit.to_limiter()),
                CloudTimeouts {
                    request: config.request_timeout,
                    page: config.page_timeout,
                },
                RetryPolicy::default(),
            )))
        }
    }
}

async fn textract_provider(config: &Config) -> Result<Arc<dyn cloud::CloudProvider>> {
    Ok(Arc::new(
        textract::TextractProvider::new(config.aws_region.clone()).await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_describe_the_cause() {
        let err = RecognitionError::engine(&anyhow!("bad image").context("tesseract failed"), 1);
        assert_eq!(err.to_string(), "tesseract failed: bad image");
        assert_eq!(err.requests(), 1);
        assert_eq!(
            RecognitionError::Timeout(Duration::from_secs(120)).to_string(),
            "timed out after 120s"
        );
    }
}
