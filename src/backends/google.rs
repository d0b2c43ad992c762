//! Google Cloud Vision, via its REST API.

use std::env;

use base64::{Engine as _, prelude::BASE64_STANDARD};

use crate::{
    document::{PageTask, ProviderId},
    prelude::*,
    retry::{
        IsKnownTransient, ProviderRetryResult, retry_result_fatal, retry_result_ok,
        retry_result_transient, try_fatal, try_potentially_transient,
    },
};

use super::cloud::{CloudProvider, ProviderText};

/// Environment variable holding our API key.
pub const API_KEY_VAR: &str = "GOOGLE_VISION_API_KEY";

/// Default endpoint for batch image annotation.
const ENDPOINT: &str = "https://vision.googleapis.com/v1/images:annotate";

/// Block confidence to assume when Google doesn't report one, on a 0–1 scale.
const DEFAULT_CONFIDENCE: f64 = 0.9;

/// gRPC status codes which are worth retrying: `DEADLINE_EXCEEDED`,
/// `RESOURCE_EXHAUSTED` and `UNAVAILABLE`.
const TRANSIENT_RPC_CODES: &[i32] = &[4, 8, 14];

/// Google Cloud Vision `DOCUMENT_TEXT_DETECTION`.
pub struct GoogleVisionProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    language_hints: Vec<String>,
}

impl GoogleVisionProvider {
    /// Create a provider using the API key in [`API_KEY_VAR`].
    pub fn from_env(languages: &[String]) -> Result<Self> {
        let api_key = env::var(API_KEY_VAR).with_context(|| {
            format!("{API_KEY_VAR} must be set to use Google Cloud Vision")
        })?;
        Ok(Self::new(api_key, ENDPOINT.to_owned(), languages))
    }

    /// Create a provider with an explicit key and endpoint.
    pub fn new(api_key: String, endpoint: String, languages: &[String]) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            endpoint,
            language_hints: languages.iter().filter_map(|l| language_hint(l)).collect(),
        }
    }
}

/// Map a Tesseract language code to the BCP-47 code Google expects.
fn language_hint(tesseract_code: &str) -> Option<String> {
    let hint = match tesseract_code {
        "eng" => "en",
        "hin" => "hi",
        "spa" => "es",
        "fra" => "fr",
        "deu" => "de",
        "ita" => "it",
        "por" => "pt",
        "rus" => "ru",
        "ara" => "ar",
        "jpn" => "ja",
        "kor" => "ko",
        "chi_sim" => "zh",
        "chi_tra" => "zh-Hant",
        code if code.len() == 2 => code,
        other => {
            debug!("No Google language hint for {:?}", other);
            return None;
        }
    };
    Some(hint.to_owned())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateRequest<'a> {
    requests: Vec<ImageRequest<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageRequest<'a> {
    image: ImageContent,
    features: Vec<Feature>,
    image_context: ImageContext<'a>,
}

#[derive(Debug, Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    feature_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageContext<'a> {
    language_hints: &'a [String],
}

#[derive(Debug, Default, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<RpcStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
    #[serde(default)]
    pages: Vec<AnnotatedPage>,
}

#[derive(Debug, Default, Deserialize)]
struct AnnotatedPage {
    #[serde(default)]
    blocks: Vec<Block>,
}

#[derive(Debug, Default, Deserialize)]
struct Block {
    confidence: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

impl ImageResponse {
    /// Extract text and a 0–100 confidence.
    fn into_provider_text(self) -> ProviderText {
        let annotation = self.full_text_annotation.unwrap_or_default();
        let confidences = annotation
            .pages
            .iter()
            .flat_map(|page| &page.blocks)
            .filter_map(|block| block.confidence)
            .collect::<Vec<_>>();
        let confidence = if confidences.is_empty() {
            DEFAULT_CONFIDENCE
        } else {
            confidences.iter().sum::<f64>() / confidences.len() as f64
        };
        ProviderText {
            text: annotation.text.trim().to_owned(),
            confidence: confidence * 100.0,
        }
    }
}

#[async_trait]
impl CloudProvider for GoogleVisionProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Google
    }

    #[instrument(level = "trace", skip_all, fields(page = task.page))]
    async fn annotate(&self, task: &PageTask, image: &[u8]) -> ProviderRetryResult<ProviderText> {
        let request = AnnotateRequest {
            requests: vec![ImageRequest {
                image: ImageContent {
                    content: BASE64_STANDARD.encode(image),
                },
                features: vec![Feature {
                    feature_type: "DOCUMENT_TEXT_DETECTION",
                }],
                image_context: ImageContext {
                    language_hints: &self.language_hints,
                },
            }],
        };
        let response = try_potentially_transient!(
            self.client
                .post(&self.endpoint)
                .query(&[("key", &self.api_key)])
                .json(&request)
                .send()
                .await
        );

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = anyhow!("Google Vision returned {}: {}", status, body);
            return if status.is_known_transient() {
                retry_result_transient(err)
            } else {
                retry_result_fatal(err)
            };
        }

        let parsed = try_fatal!(
            response
                .json::<AnnotateResponse>()
                .await
                .context("cannot parse Google Vision response")
        );
        let Some(image_response) = parsed.responses.into_iter().next() else {
            return retry_result_fatal(anyhow!("Google Vision returned no responses"));
        };
        if let Some(error) = &image_response.error {
            let err = anyhow!("Google Vision error {}: {}", error.code, error.message);
            return if TRANSIENT_RPC_CODES.contains(&error.code) {
                retry_result_transient(err)
            } else {
                retry_result_fatal(err)
            };
        }
        retry_result_ok(image_response.into_provider_text())
    }
}
