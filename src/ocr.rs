//! Region OCR strategy and the Vision engine.
//!
//! Two things live here: the pure decision of *how* to OCR a region
//! ([`recognition_mode`]), and the engine that actually does it
//! ([`GoogleVisionOcr`], speaking the `images:annotate` REST API).

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use base64::{Engine as _, prelude::BASE64_STANDARD};
use leaky_bucket::RateLimiter;

use crate::{config::OcrCredentials, layout::RegionKind, prelude::*};

/// Default endpoint for the Vision REST API.
pub const DEFAULT_VISION_ENDPOINT: &str =
    "https://vision.googleapis.com/v1/images:annotate";

/// Region area, in pixels, at or above which dense document recognition
/// beats sparse text recognition. Equivalent to a 600x300 crop at scan
/// resolution.
pub const DOCUMENT_AREA_THRESHOLD: u64 = 180_000;

/// How a region should be recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionMode {
    /// Sparse text recognition, best for small labels and stamps.
    SparseText,
    /// Dense document recognition, best for paragraphs and tables.
    DocumentText,
}

impl RecognitionMode {
    /// The Vision API feature implementing this mode.
    fn vision_feature(self) -> &'static str {
        match self {
            RecognitionMode::SparseText => "TEXT_DETECTION",
            RecognitionMode::DocumentText => "DOCUMENT_TEXT_DETECTION",
        }
    }
}

/// Decide how to recognize a region of the given kind and size.
///
/// Tables and lists always get dense document recognition, because sparse
/// recognition scrambles their cell and item structure. Everything else
/// switches on area: at or above [`DOCUMENT_AREA_THRESHOLD`] a region is
/// treated as a document, below it as sparse text. No I/O, no state.
pub fn recognition_mode(kind: RegionKind, width: u32, height: u32) -> RecognitionMode {
    if matches!(kind, RegionKind::Table | RegionKind::List) {
        return RecognitionMode::DocumentText;
    }
    if u64::from(width) * u64::from(height) >= DOCUMENT_AREA_THRESHOLD {
        RecognitionMode::DocumentText
    } else {
        RecognitionMode::SparseText
    }
}

/// Interface to an OCR engine capable of both recognition modes.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Recognize text in an image, given as PNG bytes.
    async fn recognize(&self, image_png: &[u8], mode: RecognitionMode) -> Result<String>;
}

/// OCR engine wrapping the Google Cloud Vision REST API.
pub struct GoogleVisionOcr {
    /// HTTP client, carrying the request timeout.
    client: reqwest::Client,

    /// API key, passed as a query parameter.
    api_key: String,

    /// Endpoint URL. Overridable for gateways and tests.
    endpoint: String,

    /// A rate limiter to avoid hitting API limits.
    rate_limiter: RateLimiter,
}

impl GoogleVisionOcr {
    /// Create a new Vision engine from configured credentials.
    pub fn new(
        credentials: &OcrCredentials,
        timeout: Duration,
        requests_per_second: usize,
    ) -> Result<GoogleVisionOcr> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Vision HTTP client")?;
        let endpoint = credentials
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_VISION_ENDPOINT.to_owned());
        Ok(GoogleVisionOcr {
            client,
            api_key: credentials.api_key.clone(),
            endpoint,
            rate_limiter: per_second_rate_limiter(requests_per_second),
        })
    }

    /// One `images:annotate` round trip.
    async fn annotate(&self, image_png: &[u8], mode: RecognitionMode) -> Result<String> {
        let body = json!({
            "requests": [{
                "image": { "content": BASE64_STANDARD.encode(image_png) },
                "features": [{ "type": mode.vision_feature() }],
            }]
        });
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .context("Vision API request failed")?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Vision API returned HTTP {status}"));
        }
        let payload: Value = response
            .json()
            .await
            .context("Vision API returned invalid JSON")?;
        parse_annotate_response(&payload, mode)
    }
}

#[async_trait]
impl OcrEngine for GoogleVisionOcr {
    #[instrument(level = "debug", skip_all, fields(mode = ?mode, bytes = image_png.len()))]
    async fn recognize(&self, image_png: &[u8], mode: RecognitionMode) -> Result<String> {
        self.rate_limiter.acquire_one().await;
        match self.annotate(image_png, mode).await {
            Ok(text) => Ok(text),
            // Sparse recognition fails on some degraded crops where the
            // dense model still copes, so give it one more chance.
            Err(err) if mode == RecognitionMode::SparseText => {
                warn!("Sparse recognition failed, retrying as document: {err:#}");
                self.rate_limiter.acquire_one().await;
                self.annotate(image_png, RecognitionMode::DocumentText).await
            }
            Err(err) => Err(err),
        }
    }
}

/// Extract recognized text from an `images:annotate` response.
///
/// Document mode prefers the full text annotation; sparse mode prefers the
/// first (whole-image) text annotation. Either way we fall back to the other
/// shape, since gateways are not always strict about which one they return.
/// No recognized text at all is an empty string, not an error.
fn parse_annotate_response(payload: &Value, mode: RecognitionMode) -> Result<String> {
    #[derive(Default, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct AnnotateResponse {
        full_text_annotation: Option<FullTextAnnotation>,
        text_annotations: Vec<TextAnnotation>,
        error: Option<ResponseError>,
    }
    #[derive(Deserialize)]
    struct FullTextAnnotation {
        text: String,
    }
    #[derive(Deserialize)]
    struct TextAnnotation {
        description: String,
    }
    #[derive(Deserialize)]
    struct ResponseError {
        message: String,
    }
    #[derive(Deserialize)]
    struct AnnotateResponses {
        responses: Vec<AnnotateResponse>,
    }

    let mut parsed: AnnotateResponses = serde_json::from_value(payload.clone())
        .context("unexpected Vision API response shape")?;
    let response = match parsed.responses.len() {
        0 => return Err(anyhow!("Vision API response contained no results")),
        _ => parsed.responses.swap_remove(0),
    };
    if let Some(err) = response.error {
        return Err(anyhow!("Vision API error: {}", err.message));
    }

    let full_text = response.full_text_annotation.map(|a| a.text);
    let sparse_text = response
        .text_annotations
        .into_iter()
        .next()
        .map(|a| a.description);
    let text = match mode {
        RecognitionMode::DocumentText => full_text.or(sparse_text),
        RecognitionMode::SparseText => sparse_text.or(full_text),
    };
    Ok(text.unwrap_or_default())
}

/// A limiter refilled once per second.
fn per_second_rate_limiter(requests_per_second: usize) -> RateLimiter {
    RateLimiter::builder()
        .initial(requests_per_second)
        .refill(requests_per_second)
        .max(requests_per_second)
        .interval(Duration::from_secs(1))
        .build()
}
