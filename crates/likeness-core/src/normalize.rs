//! Deterministic image normalization: width cap and luma histogram equalization.
//!
//! The same transform runs at enrollment and query time, so the equalization
//! path uses integer arithmetic only.

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_WIDTH: u32 = 800;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image has zero area ({width}x{height})")]
    Empty { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Images wider than this are scaled down, preserving aspect ratio.
    pub max_width: u32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_MAX_WIDTH,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Decode encoded image bytes and normalize them.
    pub fn normalize_bytes(&self, bytes: &[u8]) -> Result<RgbImage, NormalizeError> {
        let image = image::load_from_memory(bytes)?;
        self.normalize(&image)
    }

    /// Resize to the configured width cap, then equalize lighting.
    pub fn normalize(&self, image: &DynamicImage) -> Result<RgbImage, NormalizeError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(NormalizeError::Empty {
                width: image.width(),
                height: image.height(),
            });
        }

        let mut rgb = self.resize(image.to_rgb8());
        equalize_luma(&mut rgb);
        Ok(rgb)
    }

    /// Scale down to `max_width` with bilinear filtering. Never upscales.
    fn resize(&self, rgb: RgbImage) -> RgbImage {
        let (width, height) = rgb.dimensions();
        let max_width = self.config.max_width.max(1);
        if width <= max_width {
            return rgb;
        }

        // Truncating integer scale keeps the target size independent of float rounding.
        let new_width = max_width;
        let new_height = ((height as u64 * max_width as u64) / width as u64).max(1) as u32;

        tracing::debug!(width, height, new_width, new_height, "downscaling image");
        imageops::resize(&rgb, new_width, new_height, FilterType::Triangle)
    }
}

/// Histogram-equalize the luma channel in place, leaving chroma untouched.
///
/// Pixels are converted to full-range BT.601 YCbCr with 8-bit fixed-point
/// coefficients, Y is remapped through its CDF, and the result is converted
/// back to RGB.
pub fn equalize_luma(rgb: &mut RgbImage) {
    let ycc: Vec<[u8; 3]> = rgb.pixels().map(|p| rgb_to_ycbcr(p.0)).collect();

    let mut hist = [0u32; 256];
    for px in &ycc {
        hist[px[0] as usize] += 1;
    }
    let lut = equalization_lut(&hist);

    for (pixel, [y, cb, cr]) in rgb.pixels_mut().zip(ycc) {
        pixel.0 = ycbcr_to_rgb([lut[y as usize], cb, cr]);
    }
}

/// Build a CDF-based lookup table.
///
/// The darkest populated bin maps to 0 and the brightest to 255. A channel
/// with a single populated bin maps to itself.
fn equalization_lut(hist: &[u32; 256]) -> [u8; 256] {
    let mut lut = [0u8; 256];
    for (i, v) in lut.iter_mut().enumerate() {
        *v = i as u8;
    }

    let total: u64 = hist.iter().map(|&c| c as u64).sum();
    let Some(first) = hist.iter().position(|&c| c > 0) else {
        return lut;
    };
    let cdf_min = hist[first] as u64;
    let denom = total - cdf_min;
    if denom == 0 {
        return lut;
    }

    let mut cdf = 0u64;
    for (i, &count) in hist.iter().enumerate() {
        cdf += count as u64;
        lut[i] = if i < first {
            0
        } else {
            ((cdf - cdf_min) * 255 + denom / 2) / denom
        } as u8;
    }
    lut
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

fn rgb_to_ycbcr([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = (77 * r + 150 * g + 29 * b + 128) >> 8;
    let cb = ((-43 * r - 85 * g + 128 * b + 128) >> 8) + 128;
    let cr = ((128 * r - 107 * g - 21 * b + 128) >> 8) + 128;
    [clamp_u8(y), clamp_u8(cb), clamp_u8(cr)]
}

fn ycbcr_to_rgb([y, cb, cr]: [u8; 3]) -> [u8; 3] {
    let y = y as i32;
    let cb = cb as i32 - 128;
    let cr = cr as i32 - 128;
    let r = y + ((359 * cr + 128) >> 8);
    let g = y + ((-88 * cb - 183 * cr + 128) >> 8);
    let b = y + ((454 * cb + 128) >> 8);
    [clamp_u8(r), clamp_u8(g), clamp_u8(b)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let v = ((x + y) % 64) as u8 + 96;
            Rgb([v, v.saturating_sub(20), v / 2])
        })
    }

    fn luma_range(img: &RgbImage) -> (u8, u8) {
        img.pixels()
            .map(|p| rgb_to_ycbcr(p.0)[0])
            .fold((255, 0), |(lo, hi), y| (lo.min(y), hi.max(y)))
    }

    #[test]
    fn test_wide_image_is_downscaled() {
        let img = DynamicImage::ImageRgb8(gradient(1600, 900));
        let out = Normalizer::default().normalize(&img).unwrap();
        assert_eq!(out.dimensions(), (800, 450));
    }

    #[test]
    fn test_aspect_ratio_truncates() {
        let img = DynamicImage::ImageRgb8(gradient(1000, 333));
        let out = Normalizer::default().normalize(&img).unwrap();
        // 333 * 800 / 1000 = 266.4
        assert_eq!(out.dimensions(), (800, 266));
    }

    #[test]
    fn test_narrow_image_is_never_upscaled() {
        let img = DynamicImage::ImageRgb8(gradient(320, 240));
        let out = Normalizer::default().normalize(&img).unwrap();
        assert_eq!(out.dimensions(), (320, 240));
    }

    #[test]
    fn test_normalize_is_size_idempotent() {
        let normalizer = Normalizer::new(NormalizerConfig { max_width: 200 });
        let once = normalizer
            .normalize(&DynamicImage::ImageRgb8(gradient(640, 480)))
            .unwrap();
        let twice = normalizer
            .normalize(&DynamicImage::ImageRgb8(once.clone()))
            .unwrap();
        assert_eq!(once.dimensions(), (200, 150));
        assert_eq!(twice.dimensions(), once.dimensions());
    }

    #[test]
    fn test_equalization_stretches_luma() {
        let img = DynamicImage::ImageRgb8(gradient(128, 128));
        let (lo_before, hi_before) = luma_range(&img.to_rgb8());
        let out = Normalizer::default().normalize(&img).unwrap();
        let (lo, hi) = luma_range(&out);
        assert!(hi - lo > hi_before - lo_before, "range {lo}..{hi} vs {lo_before}..{hi_before}");
    }

    #[test]
    fn test_uniform_image_is_unchanged_in_luma() {
        let mut img = RgbImage::from_pixel(16, 16, Rgb([120, 120, 120]));
        let before: Vec<u8> = img.pixels().map(|p| rgb_to_ycbcr(p.0)[0]).collect();
        equalize_luma(&mut img);
        let after: Vec<u8> = img.pixels().map(|p| rgb_to_ycbcr(p.0)[0]).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_gray_roundtrip_through_ycbcr() {
        for v in [0u8, 1, 64, 128, 200, 255] {
            let ycc = rgb_to_ycbcr([v, v, v]);
            assert_eq!(ycc, [v, 128, 128]);
            assert_eq!(ycbcr_to_rgb(ycc), [v, v, v]);
        }
    }

    #[test]
    fn test_lut_endpoints() {
        let mut hist = [0u32; 256];
        hist[10] = 5;
        hist[20] = 5;
        hist[30] = 10;
        let lut = equalization_lut(&hist);
        assert_eq!(lut[10], 0);
        assert_eq!(lut[30], 255);
        assert!(lut[20] > 0 && lut[20] < 255);
        assert_eq!(lut[5], 0);
    }

    #[test]
    fn test_normalize_bytes_is_deterministic() {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(gradient(900, 300))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();

        let normalizer = Normalizer::default();
        let a = normalizer.normalize_bytes(&bytes).unwrap();
        let b = normalizer.normalize_bytes(&bytes).unwrap();
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn test_garbage_bytes_are_invalid() {
        let err = Normalizer::default()
            .normalize_bytes(b"definitely not an image")
            .unwrap_err();
        assert!(matches!(err, NormalizeError::Decode(_)));
    }

    #[test]
    fn test_zero_area_is_invalid() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(0, 10));
        assert!(matches!(
            Normalizer::default().normalize(&img),
            Err(NormalizeError::Empty { width: 0, height: 10 })
        ));
    }
}
