// src/engine/thumbnail.rs
//
// Framed preview bitmaps.

use image::{imageops, DynamicImage, GenericImageView, Rgba, RgbaImage};

const FRAME_COLOR: Rgba<u8> = Rgba([0x50, 0x50, 0x50, 0xFF]);

/// Fit `img` into a `size`x`size` box (never upscaling) and draw a
/// `frame`-pixel border around it. The border counts towards `size`.
pub fn make_thumbnail(img: &DynamicImage, size: u32, frame: u32) -> DynamicImage {
    let inner = size.saturating_sub(frame.saturating_mul(2)).max(1);
    let (width, height) = img.dimensions();
    let scaled = if width > inner || height > inner {
        img.thumbnail(inner, inner)
    } else {
        img.clone()
    };
    if frame == 0 {
        return scaled;
    }

    let (w, h) = scaled.dimensions();
    let mut canvas = RgbaImage::from_pixel(w + 2 * frame, h + 2 * frame, FRAME_COLOR);
    imageops::overlay(&mut canvas, &scaled.to_rgba8(), frame as i64, frame as i64);
    DynamicImage::ImageRgba8(canvas)
}
