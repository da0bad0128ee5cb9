//! Adaptive image re-encoding under a byte budget.
//!
//! [`fit`] searches a rescale percentage in `[0, 100]` by bisection until the
//! JPEG re-encode of the image lands just under `max_bytes`:
//!
//! ```text
//! scale = (low + high) / 2, ratio = len(encode(baseline * scale)) / max_bytes
//!
//!   ratio < 1 and (ratio > 0.92 or low > 99)  → accept
//!   ratio > 1                                 → baseline = candidate, high = 100
//!   otherwise                                 → low = scale
//! ```
//!
//! The `ratio > 1` branch restarts the narrowing from the smaller candidate
//! instead of shrinking `[low, high]`. It is kept as-is and bounded by an
//! absolute iteration cap; on exhaustion the largest candidate that fits is
//! returned, or the smallest attempt when none did.
//!
//! [`resize_to_fit`] is the single-pass dimension variant used for
//! fixed-size slots (avatars, thumbnails).

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};

use crate::error::ImageFitError;

/// Hard cap on encoder attempts per [`fit`] call.
pub const MAX_ITERATIONS: usize = 20;

/// A candidate within this fraction of the budget is accepted.
const ACCEPT_RATIO: f64 = 0.92;

const JPEG_QUALITY: u8 = 85;

/// Encoded image plus the pixel dimensions used for layout hints.
#[derive(Debug, Clone)]
pub struct FittedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Encoder attempts made; 0 when the input was returned unchanged.
    pub iterations: usize,
}

/// Re-encode `bytes` so that the result is at most `max_bytes` long.
pub fn fit(bytes: &[u8], max_bytes: usize) -> Result<FittedImage, ImageFitError> {
    if max_bytes == 0 {
        return Err(ImageFitError::ZeroBudget);
    }
    let original = decode(bytes)?;
    if bytes.len() <= max_bytes {
        return Ok(FittedImage {
            bytes: bytes.to_vec(),
            width: original.width(),
            height: original.height(),
            iterations: 0,
        });
    }

    let mut baseline = original;
    let mut low = 0.0f64;
    let mut high = 100.0f64;
    let mut best_fit: Option<FittedImage> = None;
    let mut smallest: Option<FittedImage> = None;

    for iteration in 1..=MAX_ITERATIONS {
        let scale = (low + high) / 2.0;
        let candidate = rescale(&baseline, scale / 100.0);
        let encoded = encode_jpeg(&candidate)?;
        let ratio = encoded.len() as f64 / max_bytes as f64;
        tracing::debug!(
            iteration,
            scale,
            ratio,
            width = candidate.width(),
            height = candidate.height(),
            "image fit attempt"
        );

        let attempt = FittedImage {
            bytes: encoded,
            width: candidate.width(),
            height: candidate.height(),
            iterations: iteration,
        };

        if ratio < 1.0 && (ratio > ACCEPT_RATIO || low > 99.0) {
            return Ok(attempt);
        }

        if ratio > 1.0 {
            baseline = candidate;
            high = 100.0;
            if smallest
                .as_ref()
                .map_or(true, |s| attempt.bytes.len() < s.bytes.len())
            {
                smallest = Some(attempt);
            }
        } else {
            low = scale;
            if best_fit
                .as_ref()
                .map_or(true, |b| attempt.bytes.len() > b.bytes.len())
            {
                best_fit = Some(attempt);
            }
        }
    }

    tracing::warn!(
        max_bytes,
        fits = best_fit.is_some(),
        "image fit hit the iteration cap"
    );
    best_fit.or(smallest).ok_or(ImageFitError::Empty)
}

/// Downscale `bytes` so it fits in `max_width` x `max_height`. Never upscales.
pub fn resize_to_fit(
    bytes: &[u8],
    max_width: u32,
    max_height: u32,
) -> Result<FittedImage, ImageFitError> {
    if max_width == 0 || max_height == 0 {
        return Err(ImageFitError::ZeroBudget);
    }
    let img = decode(bytes)?;
    let (w, h) = img.dimensions();
    let scale = (w as f64 / max_width as f64)
        .max(h as f64 / max_height as f64)
        .max(1.0);
    if scale <= 1.0 {
        return Ok(FittedImage {
            bytes: bytes.to_vec(),
            width: w,
            height: h,
            iterations: 0,
        });
    }

    let resized = rescale(&img, 1.0 / scale);
    let encoded = match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => {
            let mut out = Cursor::new(Vec::new());
            resized.write_to(&mut out, ImageFormat::Png)?;
            out.into_inner()
        }
        _ => encode_jpeg(&resized)?,
    };
    Ok(FittedImage {
        bytes: encoded,
        width: resized.width(),
        height: resized.height(),
        iterations: 1,
    })
}

/// Pixel dimensions of an encoded image.
pub fn dimensions(bytes: &[u8]) -> Result<(u32, u32), ImageFitError> {
    Ok(decode(bytes)?.dimensions())
}

/// MIME type sniffed from the image header.
pub fn mime_type(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .map(|f| f.to_mime_type())
        .unwrap_or("application/octet-stream")
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, ImageFitError> {
    let img = image::load_from_memory(bytes)?;
    if img.width() == 0 || img.height() == 0 {
        return Err(ImageFitError::Empty);
    }
    Ok(img)
}

fn rescale(img: &DynamicImage, factor: f64) -> DynamicImage {
    let w = ((img.width() as f64) * factor).round().max(1.0) as u32;
    let h = ((img.height() as f64) * factor).round().max(1.0) as u32;
    img.resize_exact(w, h, FilterType::Triangle)
}

fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>, ImageFitError> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder.encode_image(&img.to_rgb8())?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    /// Deterministic noise compresses poorly, which keeps sizes predictable.
    fn noise_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            let mut v = x.wrapping_mul(0x9E37_79B9) ^ y.wrapping_mul(0x85EB_CA6B);
            v ^= v >> 15;
            v = v.wrapping_mul(0x2C1B_3C6D);
            v ^= v >> 12;
            Rgb([v as u8, (v >> 8) as u8, (v >> 16) as u8])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_small_input_unchanged() {
        let png = noise_png(16, 16);
        let fitted = fit(&png, png.len()).unwrap();
        assert_eq!(fitted.bytes, png);
        assert_eq!((fitted.width, fitted.height), (16, 16));
        assert_eq!(fitted.iterations, 0);
    }

    #[test]
    fn test_fit_within_budget() {
        let png = noise_png(256, 256);
        let budget = 20_000;
        assert!(png.len() > budget);
        let fitted = fit(&png, budget).unwrap();
        assert!(fitted.bytes.len() <= budget, "got {} bytes", fitted.bytes.len());
        assert!(fitted.iterations >= 1 && fitted.iterations <= MAX_ITERATIONS);
        assert!(fitted.width < 256);
        assert_eq!(
            dimensions(&fitted.bytes).unwrap(),
            (fitted.width, fitted.height)
        );
        assert_eq!(mime_type(&fitted.bytes), "image/jpeg");
    }

    #[test]
    fn test_zero_budget_rejected() {
        let png = noise_png(4, 4);
        assert!(matches!(fit(&png, 0), Err(ImageFitError::ZeroBudget)));
    }

    #[test]
    fn test_garbage_is_codec_error() {
        assert!(matches!(
            fit(b"definitely not an image", 10),
            Err(ImageFitError::Codec(_))
        ));
    }

    #[test]
    fn test_resize_to_fit_downscales() {
        let png = noise_png(400, 200);
        let fitted = resize_to_fit(&png, 100, 100).unwrap();
        assert_eq!((fitted.width, fitted.height), (100, 50));
        assert_eq!(dimensions(&fitted.bytes).unwrap(), (100, 50));
        assert_eq!(mime_type(&fitted.bytes), "image/png");
    }

    #[test]
    fn test_resize_to_fit_never_upscales() {
        let png = noise_png(50, 40);
        let fitted = resize_to_fit(&png, 100, 100).unwrap();
        assert_eq!(fitted.bytes, png);
        assert_eq!((fitted.width, fitted.height), (50, 40));
    }
}
