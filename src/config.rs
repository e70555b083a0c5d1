//! Service configuration.
//!
//! Capability credentials are deliberately separate from the rest of the
//! configuration: a [`crate::service::ScanService`] is constructed with a
//! [`ServiceConfig`] but stays unusable until the OCR and LLM capabilities
//! are configured explicitly. That keeps "forgot to set a key" a clear,
//! typed failure instead of a mystery deep inside the pipeline.

use std::time::Duration;

use crate::page_render::PageRenderOptions;

/// Default maximum upload size: 16 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Credentials for the Vision OCR capability.
#[derive(Debug, Clone)]
pub struct OcrCredentials {
    /// The API key, passed as a query parameter.
    pub api_key: String,
    /// Endpoint override, for gateways and tests.
    pub endpoint: Option<String>,
}

impl OcrCredentials {
    /// Credentials for the standard endpoint.
    pub fn new(api_key: impl Into<String>) -> OcrCredentials {
        OcrCredentials {
            api_key: api_key.into(),
            endpoint: None,
        }
    }
}

/// Tunable limits and timeouts for the extraction service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Reject uploads larger than this before doing any work.
    pub max_upload_bytes: usize,

    /// How documents become page images.
    pub render: PageRenderOptions,

    /// Max number of regions to OCR at a time within one page.
    pub job_count: usize,

    /// Timeout for a single OCR request.
    pub ocr_timeout: Duration,

    /// Rate limit for OCR requests, per second.
    pub ocr_requests_per_second: usize,

    /// Timeout for a layout segmentation request.
    pub segmenter_timeout: Duration,

    /// Per-region text stored in session summaries is capped at this many
    /// characters.
    pub region_text_cap: usize,

    /// How long a session stays retrievable after creation.
    pub session_retention: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            render: PageRenderOptions::default(),
            job_count: 8,
            ocr_timeout: Duration::from_secs(30),
            ocr_requests_per_second: 8,
            segmenter_timeout: Duration::from_secs(30),
            region_text_cap: 3000,
            session_retention: Duration::from_secs(30 * 60),
        }
    }
}
