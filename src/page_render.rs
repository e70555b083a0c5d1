//! Turning uploaded bytes into page images.
//!
//! Plain raster images decode directly as a single page. PDFs are written to
//! a temporary file and rasterized one PNG per page using Poppler's
//! `pdftocairo` CLI tool.

use std::{io::Cursor, sync::LazyLock};

use anyhow::anyhow;
use clap::Args;
use image::{DynamicImage, GrayImage, ImageFormat};
use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore, prelude::*,
};

/// Image types supported as-is.
pub const SUPPORTED_IMAGE_TYPES: &[&str] =
    &["image/png", "image/jpeg", "image/webp", "image/gif"];

/// PDF MIME type, handled by rasterizing.
pub const PDF_MIME_TYPE: &str = "application/pdf";

/// A default error regex for checking command output.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler reports recoverable xref reconstruction as an error, but still
/// produces usable output.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Options controlling how documents become page images.
#[derive(Debug, Clone, Args)]
pub struct PageRenderOptions {
    /// The DPI to use when rasterizing PDF pages.
    #[clap(long, default_value = "300")]
    pub rasterize_dpi: u32,

    /// The maximum number of pages to process. If this is set, we will
    /// stop after this many pages and record a warning.
    #[clap(long)]
    pub max_pages: Option<usize>,
}

impl Default for PageRenderOptions {
    fn default() -> Self {
        PageRenderOptions {
            rasterize_dpi: 300,
            max_pages: None,
        }
    }
}

/// One rendered page.
pub struct PageImage {
    /// 0-based page index within the document.
    pub index: usize,
    /// The decoded page image.
    pub image: DynamicImage,
}

/// All pages of a rendered document.
pub struct RenderedPages {
    pub pages: Vec<PageImage>,
    /// Page count before any `max_pages` truncation.
    pub total_pages: usize,
    /// Non-fatal notes from the rasterizer.
    pub warnings: Vec<String>,
}

/// Sniff the MIME type of uploaded bytes from their magic numbers.
pub fn sniff_mime_type(data: &[u8]) -> Option<&'static str> {
    infer::get(data).map(|kind| kind.mime_type())
}

/// Render uploaded bytes into page images.
#[instrument(level = "debug", skip_all, fields(bytes = data.len()))]
pub async fn render_pages(
    data: &[u8],
    options: &PageRenderOptions,
) -> Result<RenderedPages> {
    let mime_type =
        sniff_mime_type(data).ok_or_else(|| anyhow!("unrecognized file type"))?;
    if SUPPORTED_IMAGE_TYPES.contains(&mime_type) {
        let image = image::load_from_memory(data)
            .with_context(|| format!("failed to decode {mime_type} image"))?;
        Ok(RenderedPages {
            pages: vec![PageImage { index: 0, image }],
            total_pages: 1,
            warnings: vec![],
        })
    } else if mime_type == PDF_MIME_TYPE {
        render_pdf_pages(data, options).await
    } else {
        Err(anyhow!("unsupported file type {mime_type}"))
    }
}

/// Rasterize a PDF into one page image per page.
#[instrument(level = "debug", skip_all, fields(dpi = options.rasterize_dpi))]
async fn render_pdf_pages(
    data: &[u8],
    options: &PageRenderOptions,
) -> Result<RenderedPages> {
    // Write the upload into a temporary directory, with the rasterized pages
    // going into a subdirectory so we can list them without seeing the PDF.
    let tmpdir = tempfile::TempDir::with_prefix("scanfields")?;
    let pdf_path = tmpdir.path().join("upload.pdf");
    tokio::fs::write(&pdf_path, data)
        .await
        .context("failed to write uploaded PDF to temporary file")?;
    let pages_dir = tmpdir.path().join("pages");
    tokio::fs::create_dir(&pages_dir)
        .await
        .context("failed to create page output directory")?;

    let total_pages = pdf_page_count(&pdf_path).await?;
    let mut warnings = vec![];

    // Run pdftocairo to convert the PDF to PNG files. `pdftocairo` will use
    // _at least_ 100% of a CPU, so hold a CPU permit while it runs.
    let mut cmd = Command::new("pdftocairo");
    cmd.arg("-png")
        .arg("-r")
        .arg(options.rasterize_dpi.to_string());
    if let Some(max_pages) = options.max_pages
        && total_pages > max_pages
    {
        // Page numbers are 1-based and the range is inclusive.
        cmd.arg("-l").arg(max_pages.to_string());
        warnings.push(format!(
            "document has {total_pages} pages, processing only the first {max_pages}",
        ));
    }
    let out_prefix = pages_dir.join("page");
    let output = with_cpu_semaphore(|| async {
        cmd.arg(&pdf_path)
            .arg(&out_prefix)
            .output()
            .await
            .context("failed to run pdftocairo")
    })
    .await?;
    check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        let line = line.trim();
        if !line.is_empty() {
            warnings.push(line.to_owned());
        }
    }

    // `pdftocairo` zero-pads the page number, so a lexicographic sort is a
    // page-order sort.
    let mut page_paths = vec![];
    let mut dir = tokio::fs::read_dir(&pages_dir)
        .await
        .context("failed to read page output directory")?;
    while let Some(entry) = dir
        .next_entry()
        .await
        .context("failed to read page output directory")?
    {
        page_paths.push(entry.path());
    }
    page_paths.sort();

    let mut pages = Vec::with_capacity(page_paths.len());
    for (index, path) in page_paths.iter().enumerate() {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read rasterized page {:?}", path))?;
        let image = image::load_from_memory(&bytes)
            .with_context(|| format!("failed to decode rasterized page {:?}", path))?;
        pages.push(PageImage { index, image });
    }
    if pages.is_empty() {
        return Err(anyhow!("pdftocairo produced no pages"));
    }

    Ok(RenderedPages {
        pages,
        total_pages,
        warnings,
    })
}

/// Count the pages in a PDF using `pdfinfo`.
pub async fn pdf_page_count(path: &Path) -> Result<usize> {
    let mut cmd = Command::new("pdfinfo");
    let output = cmd
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    let page_count_str = output
        .lines()
        .find_map(|line| {
            let mut parts = line.splitn(2, ':');
            match (parts.next(), parts.next()) {
                (Some("Pages"), Some(value)) => Some(value.trim().to_owned()),
                _ => None,
            }
        })
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str
        .parse::<usize>()
        .with_context(|| format!("failed to parse page count {:?}", page_count_str))
}

/// Encode a grayscale image as PNG bytes.
pub fn encode_png(image: &GrayImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .context("failed to encode image as PNG")?;
    Ok(buf)
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
    fn mime_sniffing_recognizes_page_formats() {
        let png = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR";
        assert_eq!(sniff_mime_type(png), Some("image/png"));
        let jpeg = b"\xFF\xD8\xFF\xE0\x00\x10JFIF";
        assert_eq!(sniff_mime_type(jpeg), Some("image/jpeg"));
        let pdf = b"%PDF-1.4 rest of document";
        assert_eq!(sniff_mime_type(pdf), Some("application/pdf"));
        assert_eq!(sniff_mime_type(b"just some text"), None);
    }

    #[tokio::test]
    async fn single_image_renders_as_one_page() -> Result<()> {
        let image = GrayImage::from_pixel(40, 30, image::Luma([200]));
        let png = encode_png(&image)?;
        let rendered = render_pages(&png, &PageRenderOptions::default()).await?;
        assert_eq!(rendered.pages.len(), 1);
        assert_eq!(rendered.total_pages, 1);
        assert_eq!(rendered.pages[0].image.width(), 40);
        assert_eq!(rendered.pages[0].image.height(), 30);
        Ok(())
    }

    #[tokio::test]
    async fn unrecognized_bytes_are_rejected() {
        let result = render_pages(b"plain text", &PageRenderOptions::default()).await;
        assert!(result.is_err());
    }

    #[test]
    fn encoded_png_has_magic_number() -> Result<()> {
        let image = GrayImage::from_pixel(4, 4, image::Luma([0]));
        let png = encode_png(&image)?;
        assert_eq!(&png[..4], b"\x89PNG");
        Ok(())
    }
}
