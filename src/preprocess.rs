//! Page image normalization.
//!
//! Scanned engineering forms arrive as everything from crisp laser prints to
//! faint carbon copies photographed at an angle. We normalize each page once,
//! before layout segmentation, so that both the segmenter and the OCR engine
//! see the same cleaned-up image.

use image::{DynamicImage, GrayImage, Luma};
use imageproc::{
    contrast::equalize_histogram,
    filter::{median_filter, sharpen_gaussian},
};

/// Pages with a pixel standard deviation below this are treated as faint
/// (washed-out toner, pale carbon copies) and get an extra contrast boost.
const FAINT_PAGE_STD: f32 = 25.0;

/// Pages with a pixel standard deviation above this are already
/// high-contrast and can take more aggressive sharpening.
const SHARP_PAGE_STD: f32 = 40.0;

/// Linear gain applied to faint pages after histogram equalization.
const FAINT_BOOST_GAIN: f32 = 1.8;

/// Linear offset applied to faint pages after histogram equalization.
const FAINT_BOOST_OFFSET: f32 = 10.0;

/// Normalize a page image for segmentation and OCR.
///
/// The output is always grayscale with the same dimensions as the input.
/// This function is deterministic and never fails; an unusable image just
/// produces an unusable (but valid) output image.
pub fn normalize_page(image: &DynamicImage) -> GrayImage {
    let gray = image.to_luma8();

    // One contrast estimate, taken on the raw grayscale, drives both the
    // faint-page check and the sharpening radius. Equalization inflates the
    // measured std, so re-measuring later would defeat the second decision.
    let contrast = pixel_std_dev(&gray);

    // Faint pages need both equalization and a linear boost to pull the ink
    // away from the paper. Everything else gets plain equalization.
    let equalized = if contrast < FAINT_PAGE_STD {
        linear_boost(&equalize_histogram(&gray), FAINT_BOOST_GAIN, FAINT_BOOST_OFFSET)
    } else {
        equalize_histogram(&gray)
    };

    // 3x3 median filter knocks out salt-and-pepper scanner noise without
    // blurring character edges the way a box filter would.
    let denoised = median_filter(&equalized, 1, 1);

    // Unsharp masking. High-contrast pages tolerate a wider radius.
    let sigma = if contrast > SHARP_PAGE_STD { 1.5 } else { 1.0 };
    sharpen_gaussian(&denoised, sigma, 0.5)
}

/// Standard deviation of the pixel values, used as a cheap contrast estimate.
pub fn pixel_std_dev(image: &GrayImage) -> f32 {
    let n = image.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for p in image.as_raw() {
        let v = f64::from(*p);
        sum += v;
        sum_sq += v * v;
    }
    let n = n as f64;
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    variance.sqrt() as f32
}

/// Apply `gain * pixel + offset`, saturating to the valid pixel range.
fn linear_boost(image: &GrayImage, gain: f32, offset: f32) -> GrayImage {
    let mut out = image.clone();
    for Luma([p]) in out.pixels_mut() {
        *p = (gain * f32::from(*p) + offset).round().clamp(0.0, 255.0) as u8;
    }
    out
}

#[cfg(test)]
mod tests {
    use image::GrayImage;

    use super::*;

    /// A synthetic page: light background with a darker band of "text".
    fn synthetic_page(width: u32, height: u32, bg: u8, ink: u8) -> GrayImage {
        GrayImage::from_fn(width, height, |_, y| {
            if y % 10 < 3 {
                image::Luma([ink])
            } else {
                image::Luma([bg])
            }
        })
    }

    #[test]
    fn normalization_is_deterministic() {
        let page = DynamicImage::ImageLuma8(synthetic_page(64, 64, 200, 40));
        let first = normalize_page(&page);
        let second = normalize_page(&page);
        assert_eq!(first.as_raw(), second.as_raw());
    }

    #[test]
    fn normalization_preserves_dimensions() {
        let page = DynamicImage::ImageLuma8(synthetic_page(123, 77, 220, 30));
        let normalized = normalize_page(&page);
        assert_eq!(normalized.dimensions(), (123, 77));
    }

    #[test]
    fn flat_page_does_not_panic() {
        let page = DynamicImage::ImageLuma8(GrayImage::from_pixel(
            32,
            32,
            image::Luma([128]),
        ));
        let normalized = normalize_page(&page);
        assert_eq!(normalized.dimensions(), (32, 32));
    }

    #[test]
    fn faint_page_gains_contrast() {
        // Values 118..=130: std well below the faint threshold.
        let page = synthetic_page(64, 64, 130, 118);
        assert!(pixel_std_dev(&page) < FAINT_PAGE_STD);
        let normalized = normalize_page(&DynamicImage::ImageLuma8(page.clone()));
        assert!(pixel_std_dev(&normalized) > pixel_std_dev(&page));
    }

    #[test]
    fn mid_contrast_page_gets_the_narrow_sharpening_radius() {
        // Raw std ~31 sits between the faint and sharp thresholds, even
        // though equalization pushes the measured std far past both.
        let page = synthetic_page(64, 64, 166, 100);
        let raw_std = pixel_std_dev(&page);
        assert!(raw_std > FAINT_PAGE_STD && raw_std < SHARP_PAGE_STD);

        let denoised = median_filter(&equalize_histogram(&page), 1, 1);
        assert!(pixel_std_dev(&denoised) > SHARP_PAGE_STD);

        // The sharpening radius keys off the raw estimate, not the
        // post-equalization one.
        let normalized = normalize_page(&DynamicImage::ImageLuma8(page));
        assert_eq!(
            normalized.as_raw(),
            sharpen_gaussian(&denoised, 1.0, 0.5).as_raw()
        );
    }

    #[test]
    fn std_dev_of_flat_image_is_zero() {
        let flat = GrayImage::from_pixel(16, 16, image::Luma([77]));
        assert_eq!(pixel_std_dev(&flat), 0.0);
    }
}
