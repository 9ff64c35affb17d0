//! Pixel operations backing the built-in transforms.

use image::{DynamicImage, RgbaImage};

use super::CornerRadii;
use super::corner_radii::sanitize_radius;
use crate::domain::errors::{CacheError, CacheResult};

/// Decodes encoded image bytes (PNG, JPEG, WebP).
///
/// # Errors
/// Returns `CacheError::Decode` if the bytes are not a supported image.
pub fn decode(bytes: &[u8]) -> CacheResult<DynamicImage> {
    image::load_from_memory(bytes)
        .map_err(|e| CacheError::decode(format!("failed to decode image: {e}")))
}

/// Gaussian blur using `radius` as sigma. Non-positive or non-finite radii
/// leave the image unchanged.
#[must_use]
pub fn blur(image: &DynamicImage, radius: f32) -> DynamicImage {
    let radius = sanitize_radius(radius);
    if radius <= 0.0 {
        return image.clone();
    }
    image.blur(radius)
}

/// Converts to grayscale, keeping any alpha channel.
#[must_use]
pub fn grayscale(image: &DynamicImage) -> DynamicImage {
    image.grayscale()
}

/// Makes the pixels outside each rounded corner fully transparent.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn round_corners(image: &DynamicImage, radii: &CornerRadii) -> DynamicImage {
    let mut rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    let (w, h) = (width as f32, height as f32);
    let radii = radii.clamped(w.min(h) / 2.0);

    mask_outside(&mut rgba, |px, py| {
        let CornerRadii {
            top_left: tl,
            top_right: tr,
            bottom_left: bl,
            bottom_right: br,
        } = radii;

        (px < tl && py < tl && outside(px, py, tl, tl, tl))
            || (px > w - tr && py < tr && outside(px, py, w - tr, tr, tr))
            || (px < bl && py > h - bl && outside(px, py, bl, h - bl, bl))
            || (px > w - br && py > h - br && outside(px, py, w - br, h - br, br))
    });

    DynamicImage::ImageRgba8(rgba)
}

/// Crops to the centered square and masks everything outside the inscribed circle.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn circle(image: &DynamicImage) -> DynamicImage {
    let side = image.width().min(image.height());
    let x = (image.width() - side) / 2;
    let y = (image.height() - side) / 2;
    let square = image.crop_imm(x, y, side, side);
    round_corners(&square, &CornerRadii::uniform(side as f32 / 2.0))
}

#[allow(clippy::cast_precision_loss)]
fn mask_outside(rgba: &mut RgbaImage, is_outside: impl Fn(f32, f32) -> bool) {
    for (x, y, pixel) in rgba.enumerate_pixels_mut() {
        if is_outside(x as f32 + 0.5, y as f32 + 0.5) {
            pixel.0[3] = 0;
        }
    }
}

fn outside(px: f32, py: f32, cx: f32, cy: f32, r: f32) -> bool {
    let dx = px - cx;
    let dy = py - cy;
    dx * dx + dy * dy > r * r
}

/// Encodes an image as PNG for test fixtures.
#[cfg(test)]
pub(crate) fn encode_png(image: &DynamicImage) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut buf, image::ImageFormat::Png)
        .expect("png encoding should not fail");
    buf.into_inner()
}
