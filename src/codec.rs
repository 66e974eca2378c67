//! Image codec: re-encodes an image as JPEG until it fits a byte budget.
//!
//! The search runs in three steps. First the quality is lowered from 95 in
//! steps of 5. If no quality fits, the image is scaled down from 90% in steps
//! of 10% at a fixed quality of 85. If that fails too, the smallest scaled
//! candidate is encoded at quality 60 and returned as-is, so the result may
//! still exceed the budget. This is best-effort, not a guarantee.
//!
//! Callers are expected to skip images that already fit; the codec does not
//! check this itself.

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use log::{debug, warn};
use serde::Serialize;

/// Quality the search starts at
pub const QUALITY_START: u8 = 95;
/// Quality decrement per attempt
pub const QUALITY_STEP: u8 = 5;
/// The quality search stops once the next quality would be at or below this
pub const QUALITY_FLOOR: u8 = 5;
/// Quality used for every scaled-down attempt
pub const SCALE_QUALITY: u8 = 85;
/// Quality used for the last-resort encoding
pub const FALLBACK_QUALITY: u8 = 60;
/// Scale factors tried, in percent of the original dimensions
pub const SCALE_STEPS: [u32; 7] = [90, 80, 70, 60, 50, 40, 30];

/// Which step of the search produced the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompressionStrategy {
    /// Full size at the given quality
    Quality(u8),
    /// Scaled to `percent` of the original size at quality 85
    Scale { percent: u32 },
    /// Smallest scale at quality 60; may exceed the budget
    Fallback,
}

/// Result of a compression attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompressionOutcome {
    /// Input returned untouched (undecodable, or the encoder refused it)
    Unchanged,
    Compressed {
        original_bytes: u64,
        compressed_bytes: u64,
        strategy: CompressionStrategy,
    },
}

impl CompressionOutcome {
    pub fn is_compressed(&self) -> bool {
        matches!(self, CompressionOutcome::Compressed { .. })
    }
}

/// Compress `data` towards `target_bytes`.
///
/// Never fails: anything that can't be decoded or encoded comes back
/// unchanged with [`CompressionOutcome::Unchanged`].
pub fn compress_image(data: &[u8], target_bytes: u64) -> (Vec<u8>, CompressionOutcome) {
    let img = match image::load_from_memory(data) {
        Ok(img) => img,
        Err(e) => {
            debug!("[Codec] Could not decode image ({} bytes): {}", data.len(), e);
            return (data.to_vec(), CompressionOutcome::Unchanged);
        }
    };

    let rgb = flatten_to_rgb(&img);
    match search(&rgb, target_bytes) {
        Ok((bytes, strategy)) => {
            debug!(
                "[Codec] {} -> {} bytes via {:?}",
                data.len(),
                bytes.len(),
                strategy
            );
            let outcome = CompressionOutcome::Compressed {
                original_bytes: data.len() as u64,
                compressed_bytes: bytes.len() as u64,
                strategy,
            };
            (bytes, outcome)
        }
        Err(e) => {
            warn!("[Codec] Leaving image unchanged: {}", e);
            (data.to_vec(), CompressionOutcome::Unchanged)
        }
    }
}

fn search(rgb: &RgbImage, target_bytes: u64) -> Result<(Vec<u8>, CompressionStrategy), String> {
    let mut quality = QUALITY_START;
    while quality > QUALITY_FLOOR {
        let bytes = encode_jpeg(rgb, quality)?;
        if bytes.len() as u64 <= target_bytes {
            return Ok((bytes, CompressionStrategy::Quality(quality)));
        }
        quality -= QUALITY_STEP;
    }

    let mut smallest = None;
    for percent in SCALE_STEPS {
        let scaled = scale_image(rgb, percent);
        let bytes = encode_jpeg(&scaled, SCALE_QUALITY)?;
        if bytes.len() as u64 <= target_bytes {
            return Ok((bytes, CompressionStrategy::Scale { percent }));
        }
        smallest = Some(scaled);
    }

    let smallest = smallest.ok_or("no scaled candidate")?;
    let bytes = encode_jpeg(&smallest, FALLBACK_QUALITY)?;
    Ok((bytes, CompressionStrategy::Fallback))
}

/// Drop any alpha channel by compositing onto white; everything else becomes
/// 8-bit RGB. Palette images are expanded by the decoder, so they land in one
/// of the two branches as well.
pub fn flatten_to_rgb(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }

    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut rgb = RgbImage::new(width, height);
    for (src, dst) in rgba.pixels().zip(rgb.pixels_mut()) {
        let alpha = src[3] as u32;
        for c in 0..3 {
            let blended = (src[c] as u32 * alpha + 255 * (255 - alpha) + 127) / 255;
            dst[c] = blended as u8;
        }
    }
    rgb
}

/// Resize to `percent` of the original dimensions, keeping the aspect ratio
pub fn scale_image(rgb: &RgbImage, percent: u32) -> RgbImage {
    let (width, height) = rgb.dimensions();
    let target_width = ((width as u64 * percent as u64) / 100).max(1) as u32;
    let target_height = ((height as u64 * percent as u64) / 100).max(1) as u32;
    image::imageops::resize(rgb, target_width, target_height, FilterType::Lanczos3)
}

/// Encode as baseline JPEG with optimized Huffman tables
pub fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, String> {
    let (width, height) = rgb.dimensions();
    let width = u16::try_from(width).map_err(|_| format!("width {} too large for JPEG", width))?;
    let height =
        u16::try_from(height).map_err(|_| format!("height {} too large for JPEG", height))?;

    let mut jpeg_bytes = Vec::new();
    let mut encoder = jpeg_encoder::Encoder::new(&mut jpeg_bytes, quality);
    encoder.set_sampling_factor(jpeg_encoder::SamplingFactor::R_4_2_0);
    encoder.set_optimized_huffman_tables(true);
    encoder
        .encode(rgb.as_raw(), width, height, jpeg_encoder::ColorType::Rgb)
        .map_err(|e| format!("Failed to encode JPEG: {}", e))?;

    Ok(jpeg_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, Rgba, RgbaImage};
    use std::io::Cursor;

    /// Deterministic pseudo-random pixels; noise defeats JPEG so sizes stay large
    fn noise_image(width: u32, height: u32) -> RgbImage {
        let mut state: u32 = 0x1234_5678;
        RgbImage::from_fn(width, height, |_, _| {
            let mut next = || {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state & 0xff) as u8
            };
            Rgb([next(), next(), next()])
        })
    }

    fn gradient_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    fn to_png(img: DynamicImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_undecodable_input_is_unchanged() {
        let garbage = b"definitely not an image".to_vec();
        let (out, outcome) = compress_image(&garbage, 10);
        assert_eq!(out, garbage);
        assert_eq!(outcome, CompressionOutcome::Unchanged);
    }

    fn smooth_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                (x * 255 / width) as u8,
                (y * 255 / height) as u8,
                ((x + y) * 127 / (width + height)) as u8,
            ])
        })
    }

    #[test]
    fn test_quality_search_takes_first_quality_that_fits() {
        let rgb = gradient_image(256, 256);
        let png = to_png(DynamicImage::ImageRgb8(rgb.clone()));
        let budget = encode_jpeg(&rgb, QUALITY_START).unwrap().len() as u64;
        let (out, outcome) = compress_image(&png, budget);

        assert!(out.len() as u64 <= budget);
        match outcome {
            CompressionOutcome::Compressed { strategy, .. } => {
                assert_eq!(strategy, CompressionStrategy::Quality(QUALITY_START))
            }
            other => panic!("expected compression, got {:?}", other),
        }
        let decoded = image::load_from_memory_with_format(&out, ImageFormat::Jpeg).unwrap();
        assert_eq!(decoded.width(), 256);
        assert_eq!(decoded.height(), 256);
    }

    #[test]
    fn test_quality_search_lowers_quality() {
        let rgb = gradient_image(256, 256);
        let png = to_png(DynamicImage::ImageRgb8(rgb.clone()));
        let budget = encode_jpeg(&rgb, 70).unwrap().len() as u64;
        let (out, outcome) = compress_image(&png, budget);

        assert!(out.len() as u64 <= budget);
        assert!(matches!(
            outcome,
            CompressionOutcome::Compressed {
                strategy: CompressionStrategy::Quality(q),
                ..
            } if q >= 70
        ));
    }

    #[test]
    fn test_scale_search_shrinks_dimensions() {
        let rgb = smooth_image(600, 400);
        let png = to_png(DynamicImage::ImageRgb8(rgb.clone()));
        // Below the lowest full-size quality, above the smallest scaled candidate
        let full_q10 = encode_jpeg(&rgb, 10).unwrap().len() as u64;
        let smallest_q85 = encode_jpeg(&scale_image(&rgb, 30), SCALE_QUALITY)
            .unwrap()
            .len() as u64;
        assert!(smallest_q85 < full_q10);
        let budget = full_q10 - 1;

        let (out, outcome) = compress_image(&png, budget);
        assert!(out.len() as u64 <= budget);
        match outcome {
            CompressionOutcome::Compressed {
                strategy: CompressionStrategy::Scale { percent },
                ..
            } => {
                let decoded = image::load_from_memory(&out).unwrap();
                assert_eq!(decoded.width(), 600 * percent / 100);
                assert_eq!(decoded.height(), 400 * percent / 100);
            }
            other => panic!("expected scale strategy, got {:?}", other),
        }
    }

    #[test]
    fn test_fallback_is_deterministic() {
        let rgb = noise_image(120, 90);
        let png = to_png(DynamicImage::ImageRgb8(rgb.clone()));
        let (out, outcome) = compress_image(&png, 1);

        match outcome {
            CompressionOutcome::Compressed {
                strategy,
                compressed_bytes,
                ..
            } => {
                assert_eq!(strategy, CompressionStrategy::Fallback);
                assert_eq!(compressed_bytes, out.len() as u64);
            }
            other => panic!("expected fallback, got {:?}", other),
        }
        let expected = encode_jpeg(&scale_image(&rgb, 30), FALLBACK_QUALITY).unwrap();
        assert_eq!(out, expected);

        let (again, _) = compress_image(&png, 1);
        assert_eq!(out, again);
    }

    #[test]
    fn test_alpha_composited_onto_white() {
        let mut rgba = RgbaImage::new(2, 1);
        rgba.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        rgba.put_pixel(1, 0, Rgba([10, 20, 30, 255]));
        let rgb = flatten_to_rgb(&DynamicImage::ImageRgba8(rgba));
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_half_transparent_pixel_blends() {
        let mut rgba = RgbaImage::new(1, 1);
        rgba.put_pixel(0, 0, Rgba([0, 0, 0, 128]));
        let rgb = flatten_to_rgb(&DynamicImage::ImageRgba8(rgba));
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([127, 127, 127]));
    }

    #[test]
    fn test_grayscale_becomes_rgb() {
        let gray = image::GrayImage::from_pixel(4, 4, image::Luma([200]));
        let rgb = flatten_to_rgb(&DynamicImage::ImageLuma8(gray));
        assert_eq!(rgb.get_pixel(3, 3), &Rgb([200, 200, 200]));
    }

    #[test]
    fn test_scale_image_keeps_at_least_one_pixel() {
        let tiny = gradient_image(2, 1);
        let scaled = scale_image(&tiny, 30);
        assert_eq!(scaled.dimensions(), (1, 1));
    }
}
