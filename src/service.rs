//! The scan service facade.
//!
//! Owns the pipeline from uploaded bytes to a stored session, and from a
//! session to resolved fields. Capabilities (OCR, layout segmentation, field
//! reasoning) are injected after construction; operations that need a missing
//! capability fail with [`ExtractError::ConfigurationMissing`] instead of
//! guessing.

use std::sync::Arc;

use anyhow::anyhow;
use futures::StreamExt as _;
use image::GrayImage;
use schemars::JsonSchema;
use tokio::sync::RwLock;

use crate::{
    config::{OcrCredentials, ServiceConfig},
    error::ExtractError,
    layout::{self, LayoutSegmenter, Region, RemoteLayoutSegmenter},
    ocr::{self, GoogleVisionOcr, OcrEngine},
    page_render::{self, PageImage},
    prefill, preprocess,
    prelude::*,
    reasoner::{FieldReasoner, LlmFieldReasoner, LlmOpts},
    reconcile::{self, ExtractedField},
    session::{
        InMemorySessionStore, PageSummary, RegionSummary, SessionData, SessionId,
        SessionStore,
    },
    textclean,
};

/// Receipt for a processed upload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UploadReceipt {
    /// Handle for later extraction calls against this document.
    pub session_id: SessionId,
    /// Number of page images that were processed.
    pub pages_processed: usize,
    /// Total number of regions detected across all pages.
    pub regions_detected: usize,
}

/// Report emitted by the `extract` command.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractReport {
    pub session_id: SessionId,
    pub pages_processed: usize,
    pub regions_detected: usize,
    /// Resolved values keyed by requested field name, null when unresolved.
    pub fields: Value,
    /// Per-field provenance.
    pub details: Vec<ExtractedField>,
}

impl ExtractReport {
    pub fn new(receipt: &UploadReceipt, fields: Vec<ExtractedField>) -> ExtractReport {
        ExtractReport {
            session_id: receipt.session_id.clone(),
            pages_processed: receipt.pages_processed,
            regions_detected: receipt.regions_detected,
            fields: reconcile::fields_as_mapping(&fields),
            details: fields,
        }
    }
}

/// Region-aware scan processing service.
pub struct ScanService {
    config: ServiceConfig,
    ocr: RwLock<Option<Arc<dyn OcrEngine>>>,
    segmenter: RwLock<Option<Arc<dyn LayoutSegmenter>>>,
    reasoner: RwLock<Option<Arc<dyn FieldReasoner>>>,
    store: Arc<dyn SessionStore>,
}

impl ScanService {
    /// Create a service with a fresh in-memory session store.
    pub fn new(config: ServiceConfig) -> ScanService {
        let store = Arc::new(InMemorySessionStore::new(config.session_retention));
        ScanService::with_store(config, store)
    }

    /// Create a service over an existing session store.
    pub fn with_store(
        config: ServiceConfig,
        store: Arc<dyn SessionStore>,
    ) -> ScanService {
        ScanService {
            config,
            ocr: RwLock::new(None),
            segmenter: RwLock::new(None),
            reasoner: RwLock::new(None),
            store,
        }
    }

    /// The session store backing this service.
    pub fn store(&self) -> Arc<dyn SessionStore> {
        self.store.clone()
    }

    /// Recognize text with the Google Vision API using these credentials.
    pub async fn configure_vision_ocr(
        &self,
        credentials: &OcrCredentials,
    ) -> Result<()> {
        let engine = GoogleVisionOcr::new(
            credentials,
            self.config.ocr_timeout,
            self.config.ocr_requests_per_second,
        )?;
        self.configure_ocr(Arc::new(engine)).await;
        Ok(())
    }

    /// Recognize text with a custom engine.
    pub async fn configure_ocr(&self, engine: Arc<dyn OcrEngine>) {
        *self.ocr.write().await = Some(engine);
    }

    /// Segment pages with a remote layout analysis endpoint.
    pub async fn configure_remote_segmenter(&self, endpoint: String) -> Result<()> {
        let segmenter =
            RemoteLayoutSegmenter::new(endpoint, self.config.segmenter_timeout)?;
        self.configure_segmenter(Arc::new(segmenter)).await;
        Ok(())
    }

    /// Segment pages with a custom segmenter.
    pub async fn configure_segmenter(&self, segmenter: Arc<dyn LayoutSegmenter>) {
        *self.segmenter.write().await = Some(segmenter);
    }

    /// Resolve fields with an LLM reached through `OPENAI_API_KEY` /
    /// `OPENAI_API_BASE`.
    pub async fn configure_reasoner_from_env(
        &self,
        model: &str,
        opts: &LlmOpts,
    ) -> Result<()> {
        let reasoner = LlmFieldReasoner::from_env(model, opts.clone())?;
        self.configure_reasoner(Arc::new(reasoner)).await;
        Ok(())
    }

    /// Resolve fields with a custom reasoner.
    pub async fn configure_reasoner(&self, reasoner: Arc<dyn FieldReasoner>) {
        *self.reasoner.write().await = Some(reasoner);
    }

    /// Process an uploaded document into a session.
    ///
    /// Validates size and format, renders pages, normalizes and segments each
    /// page, recognizes every region, and freezes the assembled result into
    /// the session store. All the expensive work happens here, exactly once;
    /// extractions against the returned session id only read.
    #[instrument(level = "debug", skip_all, fields(bytes = data.len()))]
    pub async fn upload(&self, data: &[u8]) -> Result<UploadReceipt, ExtractError> {
        let engine = self.ocr.read().await.clone().ok_or(
            ExtractError::ConfigurationMissing { capability: "OCR" },
        )?;

        if data.len() > self.config.max_upload_bytes {
            return Err(ExtractError::UnsupportedInput(format!(
                "upload is {} bytes, limit is {} bytes",
                data.len(),
                self.config.max_upload_bytes
            )));
        }
        match page_render::sniff_mime_type(data) {
            Some(mime)
                if page_render::SUPPORTED_IMAGE_TYPES.contains(&mime)
                    || mime == page_render::PDF_MIME_TYPE => {}
            Some(mime) => {
                return Err(ExtractError::UnsupportedInput(format!(
                    "unsupported file type {mime}"
                )));
            }
            None => {
                return Err(ExtractError::UnsupportedInput(
                    "unrecognized file type".to_owned(),
                ));
            }
        }

        let rendered = page_render::render_pages(data, &self.config.render)
            .await
            .map_err(|err| ExtractError::UnsupportedInput(format!("{err:#}")))?;
        for warning in &rendered.warnings {
            warn!("{warning}");
        }

        let segmenter = self.segmenter.read().await.clone();
        let session = self
            .process_pages(&rendered.pages, &engine, segmenter.as_ref())
            .await;

        let pages_processed = session.pages.len();
        let regions_detected = session.regions.len();
        let session_id = self.store.create(session).await;
        debug!(
            session = %session_id,
            pages = pages_processed,
            regions = regions_detected,
            "upload processed"
        );
        Ok(UploadReceipt {
            session_id,
            pages_processed,
            regions_detected,
        })
    }

    /// Resolve the requested fields against a stored session.
    #[instrument(level = "debug", skip_all, fields(session = %id))]
    pub async fn extract_fields(
        &self,
        id: &SessionId,
        requested: &[String],
    ) -> Result<Vec<ExtractedField>, ExtractError> {
        let reasoner = self.reasoner.read().await.clone().ok_or(
            ExtractError::ConfigurationMissing { capability: "LLM" },
        )?;
        if requested.is_empty() {
            return Err(ExtractError::UnsupportedInput(
                "no fields requested".to_owned(),
            ));
        }
        let bundle = self.store.get(id).await?;
        Ok(reconcile::reconcile_fields(&bundle, requested, reasoner.as_ref()).await)
    }

    /// Normalize, segment, and recognize a rendered document.
    ///
    /// Pages stay in order; the regions of one page are recognized
    /// concurrently with an order-preserving buffer. Capability failures
    /// degrade (whole-page region, empty region text) rather than fail the
    /// upload.
    #[instrument(level = "debug", skip_all, fields(pages = pages.len()))]
    async fn process_pages(
        &self,
        pages: &[PageImage],
        engine: &Arc<dyn OcrEngine>,
        segmenter: Option<&Arc<dyn LayoutSegmenter>>,
    ) -> SessionData {
        let mut session = SessionData::default();
        let mut page_texts = Vec::with_capacity(pages.len());

        for page in pages {
            let normalized = preprocess::normalize_page(&page.image);
            let (width, height) = normalized.dimensions();
            session.pages.push(PageSummary {
                index: page.index,
                width,
                height,
            });

            let regions = detect_page_regions(segmenter, &normalized).await;
            debug!(
                page = page.index,
                regions = regions.len(),
                "recognizing page regions"
            );

            let recognized: Vec<Region> = futures::stream::iter(regions)
                .map(|mut region| {
                    let engine = engine.clone();
                    let normalized = &normalized;
                    async move {
                        match recognize_region(engine.as_ref(), normalized, &region)
                            .await
                        {
                            Ok(text) => region.text = text,
                            Err(err) => {
                                let err = ExtractError::RegionOcrFailure {
                                    region_index: region.index,
                                    source: err,
                                };
                                warn!("{err:#}; continuing with empty text");
                            }
                        }
                        region
                    }
                })
                .buffered(self.config.job_count)
                .collect()
                .await;

            let blocks: Vec<String> = recognized
                .iter()
                .map(|region| format!("{}\n{}", region.marker(), region.text.trim()))
                .collect();
            page_texts.push(blocks.join("\n\n"));

            for region in recognized {
                session.regions.push(RegionSummary {
                    page_index: page.index,
                    index: region.index,
                    kind: region.kind,
                    bbox: region.bbox,
                    chars: region.text.chars().count(),
                    text: region
                        .text
                        .chars()
                        .take(self.config.region_text_cap)
                        .collect(),
                });
            }
        }

        session.aggregate_text = textclean::clean_ocr_text(&page_texts.join("\n\n"));
        session.prefill =
            prefill::extract_prefill(&textclean::pre_clean(&session.aggregate_text));
        session
    }
}

/// Detect the regions of one page, or fall back to a single whole-page
/// region when segmentation is unconfigured, fails, or finds nothing usable.
async fn detect_page_regions(
    segmenter: Option<&Arc<dyn LayoutSegmenter>>,
    normalized: &GrayImage,
) -> Vec<Region> {
    let (width, height) = normalized.dimensions();
    let detected = match segmenter {
        None => Err(anyhow!("no layout segmentation endpoint configured")),
        Some(segmenter) => match page_render::encode_png(normalized) {
            Ok(png) => segmenter.detect_regions(&png).await,
            Err(err) => Err(err),
        },
    };
    let mut detected = match detected {
        Ok(detected) => detected,
        Err(err) => {
            let err = ExtractError::SegmentationUnavailable(err);
            warn!("{err:#}; falling back to a whole-page region");
            return vec![layout::full_page_region(width, height)];
        }
    };
    detected.retain(|region| !region.bbox.is_degenerate());
    if detected.is_empty() {
        let err = ExtractError::SegmentationUnavailable(anyhow!(
            "segmenter returned no usable regions"
        ));
        warn!("{err:#}; falling back to a whole-page region");
        return vec![layout::full_page_region(width, height)];
    }
    layout::order_regions(detected)
}

/// Crop one region out of the normalized page and recognize it.
async fn recognize_region(
    engine: &dyn OcrEngine,
    page: &GrayImage,
    region: &Region,
) -> Result<String> {
    let crop = layout::padded_crop(page, &region.bbox)
        .ok_or_else(|| anyhow!("region box lies outside the page"))?;
    let png = page_render::encode_png(&crop)?;
    let mode = ocr::recognition_mode(region.kind, crop.width(), crop.height());
    engine.recognize(&png, mode).await
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use image::{DynamicImage, Luma};

    use super::*;
    use crate::{
        layout::{BoundingBox, DetectedRegion, RegionKind},
        ocr::RecognitionMode,
        reasoner::ReasoningRequest,
    };

    struct FakeOcr {
        reply: String,
        calls: AtomicUsize,
    }

    impl FakeOcr {
        fn new(reply: &str) -> FakeOcr {
            FakeOcr {
                reply: reply.to_owned(),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OcrEngine for FakeOcr {
        async fn recognize(
            &self,
            _image_png: &[u8],
            _mode: RecognitionMode,
        ) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    struct BrokenOcr;

    #[async_trait]
    impl OcrEngine for BrokenOcr {
        async fn recognize(
            &self,
            _image_png: &[u8],
            _mode: RecognitionMode,
        ) -> Result<String> {
            Err(anyhow!("vision gateway returned HTTP 500"))
        }
    }

    /// Segmenter that reports a fixed number of regions per page, in call
    /// order.
    struct FakeSegmenter {
        per_page: Vec<usize>,
        call: AtomicUsize,
    }

    impl FakeSegmenter {
        fn new(per_page: &[usize]) -> FakeSegmenter {
            FakeSegmenter {
                per_page: per_page.to_vec(),
                call: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LayoutSegmenter for FakeSegmenter {
        async fn detect_regions(
            &self,
            _page_png: &[u8],
        ) -> Result<Vec<DetectedRegion>> {
            let call = self.call.fetch_add(1, Ordering::SeqCst);
            let count = self.per_page[call % self.per_page.len()];
            Ok((0..count as u32)
                .map(|n| DetectedRegion {
                    kind: RegionKind::Text,
                    bbox: BoundingBox {
                        x1: 10,
                        y1: n * 60,
                        x2: 200,
                        y2: n * 60 + 40,
                    },
                })
                .collect())
        }
    }

    struct FixedSegmenter(Vec<DetectedRegion>);

    #[async_trait]
    impl LayoutSegmenter for FixedSegmenter {
        async fn detect_regions(
            &self,
            _page_png: &[u8],
        ) -> Result<Vec<DetectedRegion>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenSegmenter;

    #[async_trait]
    impl LayoutSegmenter for BrokenSegmenter {
        async fn detect_regions(
            &self,
            _page_png: &[u8],
        ) -> Result<Vec<DetectedRegion>> {
            Err(anyhow!("connection refused"))
        }
    }

    /// Reasoner that resolves nothing.
    struct NullReasoner;

    #[async_trait]
    impl FieldReasoner for NullReasoner {
        async fn infer_fields(
            &self,
            _request: ReasoningRequest<'_>,
        ) -> Result<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }
    }

    fn test_config() -> ServiceConfig {
        ServiceConfig {
            session_retention: Duration::from_secs(60),
            ..ServiceConfig::default()
        }
    }

    fn sample_png() -> Vec<u8> {
        let image = GrayImage::from_pixel(64, 64, Luma([200u8]));
        page_render::encode_png(&image).unwrap()
    }

    fn page(index: usize, width: u32, height: u32) -> PageImage {
        PageImage {
            index,
            image: DynamicImage::ImageLuma8(GrayImage::from_pixel(
                width,
                height,
                Luma([180u8]),
            )),
        }
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_owned()).collect()
    }

    #[tokio::test]
    async fn two_pages_of_regions_are_counted() {
        let service = ScanService::new(test_config());
        let engine: Arc<dyn OcrEngine> = Arc::new(FakeOcr::new("Span P16-P17"));
        let segmenter: Arc<dyn LayoutSegmenter> =
            Arc::new(FakeSegmenter::new(&[8, 7]));
        let pages = vec![page(0, 800, 600), page(1, 800, 600)];

        let session = service
            .process_pages(&pages, &engine, Some(&segmenter))
            .await;

        assert_eq!(session.pages.len(), 2);
        assert_eq!(session.regions.len(), 15);
        let second_page: Vec<usize> = session
            .regions
            .iter()
            .filter(|r| r.page_index == 1)
            .map(|r| r.index)
            .collect();
        assert_eq!(second_page, (1..=7).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn upload_builds_a_session_with_prefill() {
        let service = ScanService::new(test_config());
        let ocr = Arc::new(FakeOcr::new("RFI No: 0000220949"));
        service.configure_ocr(ocr.clone()).await;

        let receipt = service.upload(&sample_png()).await.unwrap();
        assert_eq!(receipt.pages_processed, 1);
        assert_eq!(receipt.regions_detected, 1);

        let bundle = service.store().get(&receipt.session_id).await.unwrap();
        assert!(bundle.data.aggregate_text.starts_with("[REGION:Text|1|"));
        assert_eq!(
            bundle.data.prefill.get("RFI No").map(String::as_str),
            Some("0000220949")
        );
    }

    #[tokio::test]
    async fn extraction_reads_the_stored_session_only() {
        let service = ScanService::new(test_config());
        let ocr = Arc::new(FakeOcr::new("RFI No: 0000220949"));
        service.configure_ocr(ocr.clone()).await;
        service.configure_reasoner(Arc::new(NullReasoner)).await;

        let receipt = service.upload(&sample_png()).await.unwrap();
        let after_upload = ocr.calls();

        let first = service
            .extract_fields(&receipt.session_id, &fields(&["RFI No"]))
            .await
            .unwrap();
        let second = service
            .extract_fields(&receipt.session_id, &fields(&["RFI No", "Contractor"]))
            .await
            .unwrap();

        assert_eq!(ocr.calls(), after_upload);
        assert_eq!(first[0].value.as_deref(), Some("0000220949"));
        assert_eq!(second[1].value, None);
    }

    #[tokio::test]
    async fn operations_require_configured_capabilities() {
        let service = ScanService::new(test_config());
        let err = service.upload(&sample_png()).await.unwrap_err();
        assert!(matches!(err, ExtractError::ConfigurationMissing { .. }));
        assert!(!err.is_recoverable());

        let err = service
            .extract_fields(&SessionId::from_raw("x"), &fields(&["Date"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::ConfigurationMissing { .. }));
    }

    #[tokio::test]
    async fn bad_uploads_are_rejected_before_processing() {
        let service = ScanService::new(test_config());
        service.configure_ocr(Arc::new(FakeOcr::new("x"))).await;
        let err = service.upload(b"just some text").await.unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedInput(_)));

        let mut config = test_config();
        config.max_upload_bytes = 16;
        let service = ScanService::new(config);
        service.configure_ocr(Arc::new(FakeOcr::new("x"))).await;
        let err = service.upload(&sample_png()).await.unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedInput(_)));
    }

    #[tokio::test]
    async fn extraction_validates_fields_and_session() {
        let service = ScanService::new(test_config());
        service.configure_reasoner(Arc::new(NullReasoner)).await;

        let err = service
            .extract_fields(&SessionId::from_raw("x"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedInput(_)));

        let err = service
            .extract_fields(&SessionId::from_raw("missing"), &fields(&["Date"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn failed_regions_still_count_with_empty_text() {
        let service = ScanService::new(test_config());
        let engine: Arc<dyn OcrEngine> = Arc::new(BrokenOcr);
        let segmenter: Arc<dyn LayoutSegmenter> = Arc::new(FakeSegmenter::new(&[3]));

        let session = service
            .process_pages(&[page(0, 800, 600)], &engine, Some(&segmenter))
            .await;

        assert_eq!(session.regions.len(), 3);
        assert!(session.regions.iter().all(|r| r.text.is_empty()));
        assert!(session.aggregate_text.contains("[REGION:Text|3|"));
    }

    #[tokio::test]
    async fn segmenter_failure_falls_back_to_whole_page() {
        let service = ScanService::new(test_config());
        let engine: Arc<dyn OcrEngine> = Arc::new(FakeOcr::new("hello"));
        let segmenter: Arc<dyn LayoutSegmenter> = Arc::new(BrokenSegmenter);

        let session = service
            .process_pages(&[page(0, 640, 480)], &engine, Some(&segmenter))
            .await;

        assert_eq!(session.regions.len(), 1);
        let region = &session.regions[0];
        assert_eq!(region.kind, RegionKind::Text);
        assert_eq!((region.bbox.x2, region.bbox.y2), (640, 480));
    }

    #[tokio::test]
    async fn degenerate_boxes_are_dropped() {
        let service = ScanService::new(test_config());
        let engine: Arc<dyn OcrEngine> = Arc::new(FakeOcr::new("hello"));
        let segmenter: Arc<dyn LayoutSegmenter> = Arc::new(FixedSegmenter(vec![
            DetectedRegion {
                kind: RegionKind::Title,
                bbox: BoundingBox {
                    x1: 10,
                    y1: 10,
                    x2: 200,
                    y2: 80,
                },
            },
            DetectedRegion {
                kind: RegionKind::Text,
                bbox: BoundingBox {
                    x1: 50,
                    y1: 50,
                    x2: 50,
                    y2: 90,
                },
            },
        ]));

        let session = service
            .process_pages(&[page(0, 640, 480)], &engine, Some(&segmenter))
            .await;

        assert_eq!(session.regions.len(), 1);
        assert_eq!(session.regions[0].kind, RegionKind::Title);
    }
}
