//! Layout segmentation: carving a page into typed regions.
//!
//! The segmentation model itself lives behind an HTTP capability (see
//! [`RemoteLayoutSegmenter`]). This module owns everything around it: the
//! region types, reading order, crop geometry, and the whole-page fallback
//! used when the capability is missing or comes back empty.

use std::{fmt, time::Duration};

use anyhow::anyhow;
use async_trait::async_trait;
use base64::{Engine as _, prelude::BASE64_STANDARD};
use image::GrayImage;

use crate::prelude::*;

/// The kinds of region the segmenter can label.
///
/// Anything else the model reports (figures, stamps, photographs) carries no
/// extractable text for our purposes and is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Text,
    Title,
    List,
    Table,
}

impl RegionKind {
    /// Parse a label from the segmentation capability, case-insensitively.
    pub fn from_label(label: &str) -> Option<RegionKind> {
        match label.to_ascii_lowercase().as_str() {
            "text" => Some(RegionKind::Text),
            "title" => Some(RegionKind::Title),
            "list" => Some(RegionKind::List),
            "table" => Some(RegionKind::Table),
            _ => None,
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::Text => write!(f, "Text"),
            RegionKind::Title => write!(f, "Title"),
            RegionKind::List => write!(f, "List"),
            RegionKind::Table => write!(f, "Table"),
        }
    }
}

/// A bounding box in pixel coordinates, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    /// Build a box from possibly unordered, possibly negative corners.
    ///
    /// Segmentation models occasionally emit coordinates a pixel or two
    /// outside the page, or with the corners swapped.
    pub fn from_corners(x1: i64, y1: i64, x2: i64, y2: i64) -> BoundingBox {
        let clamp = |v: i64| v.max(0).min(i64::from(u32::MAX)) as u32;
        BoundingBox {
            x1: clamp(x1.min(x2)),
            y1: clamp(y1.min(y2)),
            x2: clamp(x1.max(x2)),
            y2: clamp(y1.max(y2)),
        }
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    /// Pixel area, used by the OCR mode decision.
    pub fn area(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    /// A box with no interior cannot be cropped or recognized.
    pub fn is_degenerate(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// A region as reported by the segmentation capability, before ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedRegion {
    pub kind: RegionKind,
    pub bbox: BoundingBox,
}

/// A region in reading order. `text` stays empty until OCR fills it in and
/// is never changed afterward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    /// 1-based reading-order index within the page.
    pub index: usize,
    pub kind: RegionKind,
    pub bbox: BoundingBox,
    pub text: String,
}

impl Region {
    /// The marker injected into the aggregate text ahead of this region's
    /// recognized text, so downstream consumers keep the layout context.
    pub fn marker(&self) -> String {
        format!(
            "[REGION:{}|{}|bbox:{},{},{},{}]",
            self.kind, self.index, self.bbox.x1, self.bbox.y1, self.bbox.x2, self.bbox.y2
        )
    }
}

/// Sort detected regions into reading order and assign indices.
///
/// Top-to-bottom, then left-to-right. The sort is stable, so regions with
/// identical coordinates keep their detection order.
pub fn order_regions(mut detected: Vec<DetectedRegion>) -> Vec<Region> {
    detected.sort_by_key(|r| (r.bbox.y1, r.bbox.x1));
    detected
        .into_iter()
        .enumerate()
        .map(|(i, d)| Region {
            index: i + 1,
            kind: d.kind,
            bbox: d.bbox,
            text: String::new(),
        })
        .collect()
}

/// The single whole-page region used when segmentation is unavailable.
pub fn full_page_region(width: u32, height: u32) -> Region {
    Region {
        index: 1,
        kind: RegionKind::Text,
        bbox: BoundingBox {
            x1: 0,
            y1: 0,
            x2: width,
            y2: height,
        },
        text: String::new(),
    }
}

/// Crop a region out of the normalized page, with 5% padding per side.
///
/// The padding pulls in label text that the segmenter trimmed too tightly.
/// It is clamped to the page, and a box with no interior yields `None`.
pub fn padded_crop(page: &GrayImage, bbox: &BoundingBox) -> Option<GrayImage> {
    if bbox.is_degenerate() {
        return None;
    }
    let (page_w, page_h) = page.dimensions();
    let pad_x = bbox.width() / 20;
    let pad_y = bbox.height() / 20;
    let x1 = bbox.x1.saturating_sub(pad_x);
    let y1 = bbox.y1.saturating_sub(pad_y);
    let x2 = bbox.x2.saturating_add(pad_x).min(page_w);
    let y2 = bbox.y2.saturating_add(pad_y).min(page_h);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(image::imageops::crop_imm(page, x1, y1, x2 - x1, y2 - y1).to_image())
}

/// Interface to a layout segmentation capability.
#[async_trait]
pub trait LayoutSegmenter: Send + Sync + 'static {
    /// Detect typed regions in a page image, given as PNG bytes.
    async fn detect_regions(&self, page_png: &[u8]) -> Result<Vec<DetectedRegion>>;
}

/// Client for an HTTP layout segmentation capability.
///
/// The capability accepts `{"image": "<base64 PNG>"}` and answers
/// `{"regions": [{"kind": "text", "bbox": [x1, y1, x2, y2]}, ...]}`.
pub struct RemoteLayoutSegmenter {
    endpoint: String,
    client: reqwest::Client,
}

impl RemoteLayoutSegmenter {
    /// Create a client for the capability at `endpoint`.
    pub fn new(endpoint: String, timeout: Duration) -> Result<RemoteLayoutSegmenter> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build layout segmenter HTTP client")?;
        Ok(RemoteLayoutSegmenter { endpoint, client })
    }
}

#[async_trait]
impl LayoutSegmenter for RemoteLayoutSegmenter {
    #[instrument(level = "debug", skip_all, fields(endpoint = %self.endpoint))]
    async fn detect_regions(&self, page_png: &[u8]) -> Result<Vec<DetectedRegion>> {
        let body = json!({ "image": BASE64_STANDARD.encode(page_png) });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .context("layout segmentation request failed")?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("layout capability returned HTTP {status}"));
        }
        let payload: Value = response
            .json()
            .await
            .context("layout capability returned invalid JSON")?;
        parse_segmenter_response(&payload)
    }
}

/// Parse the capability's response payload into detected regions.
///
/// Unknown kinds are skipped rather than treated as errors; the model is
/// allowed to know about more of the world than we do.
pub fn parse_segmenter_response(payload: &Value) -> Result<Vec<DetectedRegion>> {
    #[derive(Deserialize)]
    struct RemoteRegion {
        kind: String,
        bbox: [i64; 4],
    }
    #[derive(Deserialize)]
    struct RemoteResponse {
        regions: Vec<RemoteRegion>,
    }

    let response: RemoteResponse = serde_json::from_value(payload.clone())
        .context("unexpected layout capability response shape")?;
    let mut detected = Vec::with_capacity(response.regions.len());
    for region in response.regions {
        let Some(kind) = RegionKind::from_label(&region.kind) else {
            trace!(kind = %region.kind, "Skipping region of unhandled kind");
            continue;
        };
        let [x1, y1, x2, y2] = region.bbox;
        detected.push(DetectedRegion {
            kind,
            bbox: BoundingBox::from_corners(x1, y1, x2, y2),
        });
    }
    Ok(detected)
}
