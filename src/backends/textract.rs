//! OCR using AWS Textract.

use aws_config::{BehaviorVersion, Region};
use aws_sdk_textract::{
    error::SdkError,
    operation::detect_document_text::{DetectDocumentTextError, DetectDocumentTextOutput},
    primitives::Blob,
    types::{BlockType, Document},
};

use crate::{
    document::{PageTask, ProviderId},
    prelude::*,
    retry::{IsKnownTransient, ProviderRetryResult, retry_result_ok, try_potentially_transient},
};

use super::cloud::{CloudProvider, ProviderText};

/// Line confidence to assume when Textract doesn't report one, on a 0–100
/// scale.
const DEFAULT_CONFIDENCE: f64 = 90.0;

/// AWS Textract `DetectDocumentText`.
pub struct TextractProvider {
    client: aws_sdk_textract::Client,
}

impl TextractProvider {
    /// Create a provider using the standard AWS credential chain.
    pub async fn new(region: Option<String>) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::v2025_01_17());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let config = loader.load().await;
        if config.region().is_none() {
            bail!("no AWS region configured; set AWS_REGION or pass --aws-region");
        }
        if config.credentials_provider().is_none() {
            bail!("no AWS credentials found");
        }
        Ok(Self {
            client: aws_sdk_textract::Client::new(&config),
        })
    }
}

impl<R> IsKnownTransient for SdkError<DetectDocumentTextError, R> {
    fn is_known_transient(&self) -> bool {
        match self {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => true,
            SdkError::ServiceError(err) => matches!(
                err.err(),
                DetectDocumentTextError::ThrottlingException(_)
                    | DetectDocumentTextError::ProvisionedThroughputExceededException(_)
                    | DetectDocumentTextError::InternalServerError(_)
            ),
            _ => false,
        }
    }
}

/// Join `LINE` blocks into text, and average their confidence.
fn lines_to_text(output: &DetectDocumentTextOutput) -> ProviderText {
    let mut lines = Vec::new();
    let mut confidences = Vec::new();
    for block in output.blocks() {
        if block.block_type() != Some(&BlockType::Line) {
            continue;
        }
        if let Some(text) = block.text() {
            lines.push(text);
        }
        if let Some(confidence) = block.confidence() {
            confidences.push(f64::from(confidence));
        }
    }
    let confidence = if confidences.is_empty() {
        DEFAULT_CONFIDENCE
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };
    ProviderText {
        text: lines.join("\n").trim().to_owned(),
        confidence,
    }
}

#[async_trait]
impl CloudProvider for TextractProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Aws
    }

    #[instrument(level = "trace", skip_all, fields(page = task.page))]
    async fn annotate(&self, task: &PageTask, image: &[u8]) -> ProviderRetryResult<ProviderText> {
        let document = Document::builder().bytes(Blob::new(image)).build();
        let output = try_potentially_transient!(
            self.client
                .detect_document_text()
                .document(document)
                .send()
                .await
        );
        trace!("Textract returned {} blocks", output.blocks().len());
        retry_result_ok(lines_to_text(&output))
    }
}
