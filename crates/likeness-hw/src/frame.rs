//! Frame type and raw buffer conversion: YUYV, RGB3, MJPG and GREY to RGB.

use image::{ImageFormat, RgbImage};
use v4l::FourCC;

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

/// A captured camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let pixels = self.image.width() as usize * self.image.height() as usize;
        if pixels == 0 {
            return 0.0;
        }
        let sum: u64 = self.image.pixels().map(|p| luma(p.0) as u64).sum();
        sum as f32 / pixels as f32
    }
}

/// Pixel formats the converters accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, two pixels per 4 bytes.
    Yuyv,
    /// Packed 24-bit RGB.
    Rgb3,
    /// Motion JPEG, one JPEG image per buffer.
    Mjpg,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    /// Negotiation preference order.
    pub const ALL: [PixelFormat; 4] = [
        PixelFormat::Yuyv,
        PixelFormat::Rgb3,
        PixelFormat::Mjpg,
        PixelFormat::Grey,
    ];

    pub fn fourcc(self) -> FourCC {
        FourCC::new(match self {
            PixelFormat::Yuyv => b"YUYV",
            PixelFormat::Rgb3 => b"RGB3",
            PixelFormat::Mjpg => b"MJPG",
            PixelFormat::Grey => b"GREY",
        })
    }

    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.fourcc() == fourcc)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format:?} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
    #[error("MJPG decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("decoded MJPG is {actual:?}, negotiated {expected:?}")]
    SizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

/// Convert one raw capture buffer to RGB.
pub fn to_rgb(
    format: PixelFormat,
    buf: &[u8],
    width: u32,
    height: u32,
) -> Result<RgbImage, FrameError> {
    match format {
        PixelFormat::Yuyv => yuyv_to_rgb(buf, width, height),
        PixelFormat::Rgb3 => rgb3_to_rgb(buf, width, height),
        PixelFormat::Grey => grey_to_rgb(buf, width, height),
        PixelFormat::Mjpg => {
            let image = image::load_from_memory_with_format(buf, ImageFormat::Jpeg)?.to_rgb8();
            if image.dimensions() != (width, height) {
                return Err(FrameError::SizeMismatch {
                    expected: (width, height),
                    actual: image.dimensions(),
                });
            }
            Ok(image)
        }
    }
}

fn check_len(
    format: PixelFormat,
    buf: &[u8],
    bytes_per_pixel: usize,
    width: u32,
    height: u32,
) -> Result<usize, FrameError> {
    let expected = width as usize * height as usize * bytes_per_pixel;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(expected)
}

/// Build an image from an exactly-sized RGB buffer.
fn from_rgb_buf(width: u32, height: u32, rgb: Vec<u8>) -> Result<RgbImage, FrameError> {
    let actual = rgb.len();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        format: PixelFormat::Rgb3,
        expected: width as usize * height as usize * 3,
        actual,
    })
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// Each `[Y0, U, Y1, V]` group yields two pixels sharing one chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = check_len(PixelFormat::Yuyv, yuyv, 2, width, height)?;
    let mut rgb = Vec::with_capacity(expected / 2 * 3);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0] as f32, chunk[2] as f32] {
            rgb.push(clamp_u8(y + 1.402 * v));
            rgb.push(clamp_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_u8(y + 1.772 * u));
        }
    }
    from_rgb_buf(width, height, rgb)
}

pub fn rgb3_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = check_len(PixelFormat::Rgb3, buf, 3, width, height)?;
    from_rgb_buf(width, height, buf[..expected].to_vec())
}

pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = check_len(PixelFormat::Grey, gray, 1, width, height)?;
    let rgb = gray[..expected].iter().flat_map(|&y| [y, y, y]).collect();
    from_rgb_buf(width, height, rgb)
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// BT.601 luma, integer approximation.
fn luma([r, g, b]: [u8; 3]) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32 + 128) >> 8) as u8
}

/// Check if a frame is dark: more than `threshold_pct` of pixels have luma below 32.
pub fn is_dark_frame(image: &RgbImage, threshold_pct: f32) -> bool {
    let total = image.width() as usize * image.height() as usize;
    if total == 0 {
        return true;
    }
    let dark = image.pixels().filter(|p| luma(p.0) < 32).count();
    (dark as f32 / total as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let rgb = yuyv_to_rgb(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(*rgb.get_pixel(0, 0), Rgb([100, 100, 100]));
        assert_eq!(*rgb.get_pixel(1, 0), Rgb([200, 200, 200]));
    }

    #[test]
    fn test_yuyv_red_chroma() {
        // Strong V pushes red up and green down.
        let rgb = yuyv_to_rgb(&[128, 128, 128, 228], 2, 1).unwrap();
        let p = rgb.get_pixel(0, 0);
        assert!(p[0] > 200, "red = {}", p[0]);
        assert!(p[1] < 100, "green = {}", p[1]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let err = yuyv_to_rgb(&[100, 128], 2, 1).unwrap_err();
        assert!(matches!(
            err,
            FrameError::InvalidLength { expected: 4, actual: 2, .. }
        ));
    }

    #[test]
    fn test_grey_expands_channels() {
        let rgb = grey_to_rgb(&[0, 50, 255, 7], 2, 2).unwrap();
        assert_eq!(*rgb.get_pixel(1, 0), Rgb([50, 50, 50]));
        assert_eq!(*rgb.get_pixel(0, 1), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_rgb3_truncates_padding() {
        let mut buf: Vec<u8> = (0..12).collect();
        buf.extend([9, 9, 9]); // driver padding
        let rgb = rgb3_to_rgb(&buf, 2, 2).unwrap();
        assert_eq!(*rgb.get_pixel(1, 1), Rgb([9, 10, 11]));
    }

    #[test]
    fn test_mjpg_decodes_and_checks_size() {
        let mut jpeg = Vec::new();
        RgbImage::from_pixel(8, 4, Rgb([120, 120, 120]))
            .write_to(&mut std::io::Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .unwrap();

        let rgb = to_rgb(PixelFormat::Mjpg, &jpeg, 8, 4).unwrap();
        assert_eq!(rgb.dimensions(), (8, 4));

        let err = to_rgb(PixelFormat::Mjpg, &jpeg, 16, 4).unwrap_err();
        assert!(matches!(err, FrameError::SizeMismatch { .. }));
        assert!(matches!(
            to_rgb(PixelFormat::Mjpg, b"not a jpeg", 8, 4),
            Err(FrameError::Decode(_))
        ));
    }

    #[test]
    fn test_fourcc_roundtrip() {
        for format in PixelFormat::ALL {
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), None);
    }

    #[test]
    fn test_dark_frame_all_black() {
        assert!(is_dark_frame(&RgbImage::new(10, 10), DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_dark_frame_normal() {
        let image = RgbImage::from_pixel(10, 10, Rgb([128, 128, 128]));
        assert!(!is_dark_frame(&image, DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&RgbImage::new(0, 0), DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_dark_frame_borderline() {
        // 96 dark + 4 bright → dark; 94 dark + 6 bright → not dark.
        let mostly_dark = RgbImage::from_fn(100, 1, |x, _| {
            if x < 96 { Rgb([10, 10, 10]) } else { Rgb([200, 200, 200]) }
        });
        assert!(is_dark_frame(&mostly_dark, DARK_FRAME_THRESHOLD));

        let lit = RgbImage::from_fn(100, 1, |x, _| {
            if x < 94 { Rgb([10, 10, 10]) } else { Rgb([200, 200, 200]) }
        });
        assert!(!is_dark_frame(&lit, DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame {
            image: RgbImage::from_pixel(4, 4, Rgb([100, 100, 100])),
            timestamp: std::time::Instant::now(),
            sequence: 0,
            is_dark: false,
        };
        assert!((frame.avg_brightness() - 100.0).abs() < 1e-3);
    }
}
