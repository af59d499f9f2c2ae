//! Box and label overlay for group recognition output.

use ab_glyph::FontVec;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use likeness_core::{FaceRegion, MatchResult};
use std::path::Path;

const KNOWN: Rgb<u8> = Rgb([0, 200, 0]);
const UNKNOWN: Rgb<u8> = Rgb([220, 0, 0]);
const TEXT: Rgb<u8> = Rgb([255, 255, 255]);
const THICKNESS: u32 = 2;
const LABEL_HEIGHT: u32 = 18;
const LABEL_SCALE: f32 = 14.0;
const LABEL_INSET: i32 = 6;

const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
];

/// Load the label font from `configured`, else from the first system font found.
pub fn load_font(configured: Option<&Path>) -> Option<FontVec> {
    if let Some(path) = configured {
        match read_font(path) {
            Ok(font) => return Some(font),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "label font unusable"),
        }
    }
    SYSTEM_FONTS
        .iter()
        .map(Path::new)
        .filter(|p| p.exists())
        .find_map(|p| read_font(p).ok())
}

fn read_font(path: &Path) -> Result<FontVec, String> {
    let data = std::fs::read(path).map_err(|e| e.to_string())?;
    FontVec::try_from_vec(data).map_err(|e| e.to_string())
}

/// Copy of `image` with one outline per result (green when known, red
/// otherwise) and a label band under each box carrying the identity.
///
/// Without a font the band is still drawn but left blank.
pub fn annotate(image: &RgbImage, results: &[MatchResult], font: Option<&FontVec>) -> RgbImage {
    let mut out = image.clone();
    for result in results {
        let color = if result.identity.is_known() { KNOWN } else { UNKNOWN };
        draw_outline(&mut out, &result.region, color);
        draw_label(&mut out, &result.region, color, &result.identity.to_string(), font);
    }
    out
}

/// Rectangle outline clipped to the image; `right` and `bottom` are exclusive.
fn draw_outline(image: &mut RgbImage, region: &FaceRegion, color: Rgb<u8>) {
    let Some((left, top, right, bottom)) = clip(image, region) else {
        return;
    };

    for y in top..bottom {
        for x in left..right {
            let on_edge = x < left + THICKNESS
                || x + THICKNESS >= right
                || y < top + THICKNESS
                || y + THICKNESS >= bottom;
            if on_edge {
                image.put_pixel(x, y, color);
            }
        }
    }
}

/// Filled band below the box, moved inside its bottom edge when the box
/// touches the bottom of the image.
fn draw_label(
    image: &mut RgbImage,
    region: &FaceRegion,
    color: Rgb<u8>,
    text: &str,
    font: Option<&FontVec>,
) {
    let Some((left, top, right, bottom)) = clip(image, region) else {
        return;
    };
    let height = image.height();
    let band_top = if bottom + LABEL_HEIGHT <= height {
        bottom
    } else {
        bottom.saturating_sub(LABEL_HEIGHT).max(top)
    };
    let band_height = LABEL_HEIGHT.min(height - band_top);
    if band_height == 0 {
        return;
    }

    let band = Rect::at(left as i32, band_top as i32).of_size(right - left, band_height);
    draw_filled_rect_mut(image, band, color);

    if let Some(font) = font {
        draw_text_mut(
            image,
            TEXT,
            left as i32 + LABEL_INSET,
            band_top as i32 + 2,
            LABEL_SCALE,
            font,
            text,
        );
    }
}

fn clip(image: &RgbImage, region: &FaceRegion) -> Option<(u32, u32, u32, u32)> {
    let (w, h) = image.dimensions();
    let left = region.left.min(w);
    let top = region.top.min(h);
    let right = region.right.min(w);
    let bottom = region.bottom.min(h);
    (left < right && top < bottom).then_some((left, top, right, bottom))
}
