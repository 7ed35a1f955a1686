//! Image encoding: `DynamicImage` → PNG bytes → base64 `ImageData`.
//!
//! Regions are stored as PNG because it is lossless; OCR accuracy depends on
//! crisp glyph edges far more than on payload size. `detail: "high"` asks
//! GPT-4-class vision models for the full tile budget so small print in a
//! chart legend survives.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Longest side of a region kept for OCR, in pixels.
pub const MAX_OCR_SIDE: u32 = 2048;

/// Encode an image as PNG, downscaling anything larger than
/// [`MAX_OCR_SIDE`] on either side.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let img = if img.width() > MAX_OCR_SIDE || img.height() > MAX_OCR_SIDE {
        img.thumbnail(MAX_OCR_SIDE, MAX_OCR_SIDE)
    } else {
        img.clone()
    };
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!("Encoded {}x{} region → {} PNG bytes", img.width(), img.height(), buf.len());
    Ok(buf)
}

/// Wrap PNG bytes for a vision request.
pub fn png_image_data(png: &[u8]) -> ImageData {
    ImageData::new(STANDARD.encode(png), "image/png").with_detail("high")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let png = encode_png(&img).expect("encode should succeed");
        assert_eq!(&png[1..4], b"PNG");
        let data = png_image_data(&png);
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(decoded, png);
    }

    #[test]
    fn oversized_images_are_downscaled() {
        let img = DynamicImage::new_luma8(MAX_OCR_SIDE * 2, 10);
        let png = encode_png(&img).unwrap();
        let back = image::load_from_memory(&png).unwrap();
        assert_eq!(back.width(), MAX_OCR_SIDE);
    }
}
