//! Error types for the extraction pipeline.

use thiserror::Error;

use crate::session::SessionId;

/// Errors surfaced by the extraction service.
///
/// The first three variants are hard failures: the request cannot proceed and
/// the caller must fix something. The remaining variants describe capability
/// failures the pipeline recovers from by degrading (empty region text, a
/// whole-page region, null field values), so they normally show up in logs
/// rather than as returned errors.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// A required capability has not been configured yet.
    #[error("{capability} capability is not configured")]
    ConfigurationMissing {
        /// Which capability was missing, e.g. "OCR" or "LLM".
        capability: &'static str,
    },

    /// The uploaded document cannot be processed at all.
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    /// The session id is unknown or past its retention window.
    #[error("session {0} not found (unknown or expired)")]
    SessionNotFound(SessionId),

    /// OCR failed for a single region.
    #[error("OCR failed for region {region_index}: {source}")]
    RegionOcrFailure {
        /// 1-based reading-order index of the region on its page.
        region_index: usize,
        source: anyhow::Error,
    },

    /// The LLM call failed or returned something unusable.
    #[error("field reasoning failed: {0}")]
    ReasoningFailure(#[source] anyhow::Error),

    /// The layout capability was missing, errored, or found nothing.
    #[error("layout segmentation unavailable: {0}")]
    SegmentationUnavailable(#[source] anyhow::Error),
}

impl ExtractError {
    /// Can the pipeline continue with a degraded result after this error?
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExtractError::ConfigurationMissing { .. }
            | ExtractError::UnsupportedInput(_)
            | ExtractError::SessionNotFound(_) => false,
            ExtractError::RegionOcrFailure { .. }
            | ExtractError::ReasoningFailure(_)
            | ExtractError::SegmentationUnavailable(_) => true,
        }
    }
}
