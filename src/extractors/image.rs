//! `embedded-images`: one fragment per image XObject drawn on the page.
//!
//! Confidence answers "does this image carry data?" rather than "is this
//! an image?" (placement is certain). The classifier compares it with the
//! OCR trigger threshold, so charts and scanned text should score high and
//! photos, logos and rules low.

use crate::error::ExtractorFailure;
use crate::extractors::{Extractor, EMBEDDED_IMAGES};
use crate::fragment::{Capability, ImageRegion, ImageStructure, RawFragment};
use crate::pipeline::content::{ImageFilter, ImagePlacement};
use crate::pipeline::encode::encode_png;
use crate::pipeline::split::PageHandle;
use async_trait::async_trait;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use std::sync::Arc;
use tracing::{debug, warn};

/// Side of the grayscale thumbnail the structure analysis runs on.
const ANALYSIS_SIDE: u32 = 256;
/// Luma difference that counts as an edge.
const EDGE_THRESHOLD: i32 = 48;
/// Score for images too small to carry data.
const TINY_CONFIDENCE: f32 = 0.05;
/// Score for images whose samples could not be decoded.
const UNDECODED_CONFIDENCE: f32 = 0.35;

/// Analyses embedded bitmaps for text- and chart-like structure.
#[derive(Debug, Clone)]
pub struct EmbeddedImageExtractor {
    /// Images narrower or shorter than this (pixels) are tiny.
    pub min_pixels: u32,
    /// Images covering less than this share of the page are tiny.
    pub min_page_share: f32,
    /// Only images scoring above this keep PNG bytes for OCR. Match it to
    /// the pipeline's OCR trigger threshold.
    pub encode_above: f32,
}

impl Default for EmbeddedImageExtractor {
    fn default() -> Self {
        Self {
            min_pixels: 16,
            min_page_share: 0.005,
            encode_above: 0.5,
        }
    }
}

#[async_trait]
impl Extractor for EmbeddedImageExtractor {
    fn name(&self) -> &str {
        EMBEDDED_IMAGES
    }

    fn capability(&self) -> Capability {
        Capability::Image
    }

    async fn extract(&self, page: &PageHandle) -> Result<Vec<RawFragment>, ExtractorFailure> {
        let placements: Vec<ImagePlacement> =
            page.images().iter().filter(|i| !i.is_mask).cloned().collect();
        if placements.is_empty() {
            return Ok(Vec::new());
        }

        let page_area = page.area().max(1.0);
        let settings = self.clone();
        let page_num = page.page_number();

        // Bitmap decoding is CPU-bound; keep it off the async workers.
        tokio::task::spawn_blocking(move || {
            placements
                .iter()
                .map(|p| settings.analyse_placement(p, page_area, page_num))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| ExtractorFailure::Unavailable {
            extractor: EMBEDDED_IMAGES.to_string(),
            page: page.index(),
            detail: format!("image analysis task failed: {e}"),
        })
    }
}

impl EmbeddedImageExtractor {
    fn analyse_placement(&self, p: &ImagePlacement, page_area: f32, page_num: usize) -> RawFragment {
        let mut region = ImageRegion {
            name: p.name.clone(),
            pixel_width: p.pixel_width,
            pixel_height: p.pixel_height,
            structure: None,
            png: None,
        };

        let tiny = p.pixel_width < self.min_pixels
            || p.pixel_height < self.min_pixels
            || p.bbox.area() / page_area < self.min_page_share;
        if tiny {
            return RawFragment::image(p.bbox, region, TINY_CONFIDENCE);
        }

        let Some(img) = decode_bitmap(p) else {
            debug!("Page {}: image {} ({:?}) not decodable", page_num, p.name, p.filter);
            return RawFragment::image(p.bbox, region, UNDECODED_CONFIDENCE);
        };

        let gray = if img.width() > ANALYSIS_SIDE || img.height() > ANALYSIS_SIDE {
            img.thumbnail(ANALYSIS_SIDE, ANALYSIS_SIDE).to_luma8()
        } else {
            img.to_luma8()
        };
        let structure = analyse(&gray);
        let confidence = structure.text_like.max(structure.chart_like);
        region.structure = Some(structure);
        if confidence > self.encode_above {
            match encode_png(&img) {
                Ok(png) => region.png = Some(Arc::from(png)),
                Err(e) => warn!("Page {}: PNG encoding of {} failed: {}", page_num, p.name, e),
            }
        }
        RawFragment::image(p.bbox, region, confidence)
    }
}

/// Decode an image XObject to pixels, if its encoding is one we handle.
pub(crate) fn decode_bitmap(p: &ImagePlacement) -> Option<DynamicImage> {
    match p.filter {
        ImageFilter::Dct => image::load_from_memory_with_format(p.encoded_bytes(), ImageFormat::Jpeg).ok(),
        ImageFilter::Flate | ImageFilter::Raw if p.bits_per_component == 8 => {
            let samples = p.decoded_samples()?;
            let (w, h) = (p.pixel_width, p.pixel_height);
            let n = (w as usize) * (h as usize) * p.components as usize;
            if samples.len() < n {
                return None;
            }
            let samples = samples[..n].to_vec();
            match p.components {
                1 => GrayImage::from_raw(w, h, samples).map(DynamicImage::ImageLuma8),
                3 => RgbImage::from_raw(w, h, samples).map(DynamicImage::ImageRgb8),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Score a grayscale image for text-like and chart-like structure.
///
/// * Edge density: share of pixels whose horizontal plus vertical luma
///   step exceeds [`EDGE_THRESHOLD`]. Text is dense in edges; photos are not.
/// * Tonal extremes: share of pixels that are near black or near white.
///   Rendered text and charts are bimodal; photos sit in the mid-tones.
/// * Long dark runs: rows or columns crossed by a dark run at least half
///   the image long, the signature of axes and bars.
pub fn analyse(gray: &GrayImage) -> ImageStructure {
    let (w, h) = gray.dimensions();
    if w < 2 || h < 2 {
        return ImageStructure::default();
    }
    let px = |x: u32, y: u32| gray.get_pixel(x, y)[0] as i32;

    let mut edges = 0usize;
    for y in 1..h {
        for x in 1..w {
            let p = px(x, y);
            if (p - px(x - 1, y)).abs() + (p - px(x, y - 1)).abs() > EDGE_THRESHOLD {
                edges += 1;
            }
        }
    }
    let edge_density = edges as f32 / ((w - 1) * (h - 1)) as f32;

    let total = (w * h) as f32;
    let extremes = gray.pixels().filter(|p| p[0] < 64 || p[0] > 191).count() as f32 / total;
    let dark_share = gray.pixels().filter(|p| p[0] < 128).count() as f32 / total;

    let longest_dark = |len: u32, at: &dyn Fn(u32) -> i32| {
        let (mut best, mut cur) = (0u32, 0u32);
        for i in 0..len {
            if at(i) < 128 {
                cur += 1;
                best = best.max(cur);
            } else {
                cur = 0;
            }
        }
        best
    };
    let long_rows = (0..h)
        .filter(|&y| longest_dark(w, &|x| px(x, y)) * 2 >= w)
        .count()
        .min(2);
    let long_cols = (0..w)
        .filter(|&x| longest_dark(h, &|y| px(x, y)) * 2 >= h)
        .count()
        .min(2);
    let line_score = if dark_share < 0.5 {
        (long_rows + long_cols) as f32 / 4.0
    } else {
        0.0
    };

    let text_like = (extremes * (edge_density / 0.15).min(1.0)).clamp(0.0, 1.0);
    let chart_like = (extremes * (0.5 * line_score + 0.5 * (edge_density / 0.10).min(1.0))).clamp(0.0, 1.0);
    ImageStructure {
        text_like,
        chart_like,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FragmentPayload;
    use crate::geometry::BoundingBox;
    use crate::pipeline::content::PagePrimitives;
    use image::Luma;

    fn chart() -> GrayImage {
        let mut img = GrayImage::from_pixel(100, 100, Luma([255]));
        for i in 0..100 {
            img.put_pixel(10, i, Luma([0]));
            img.put_pixel(i, 90, Luma([0]));
        }
        for bar in [20u32, 45, 70] {
            for x in bar..bar + 10 {
                for y in 30..90 {
                    img.put_pixel(x, y, Luma([0]));
                }
            }
        }
        img
    }

    fn gradient() -> GrayImage {
        GrayImage::from_fn(100, 100, |x, y| Luma([((x + y) * 255 / 198) as u8]))
    }

    #[test]
    fn chart_scores_above_trigger() {
        let s = analyse(&chart());
        assert!(s.chart_like > 0.5, "{s:?}");
    }

    #[test]
    fn photo_like_gradient_scores_low() {
        let s = analyse(&gradient());
        assert!(s.text_like < 0.2, "{s:?}");
        assert!(s.chart_like < 0.3, "{s:?}");
    }

    #[test]
    fn blank_image_scores_zero() {
        let s = analyse(&GrayImage::from_pixel(50, 50, Luma([255])));
        assert_eq!(s.text_like, 0.0);
        assert_eq!(s.chart_like, 0.0);
    }

    fn page_with_image(bitmap: &GrayImage, bbox: BoundingBox) -> PageHandle {
        use lopdf::{dictionary, Stream};
        let stream = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => bitmap.width() as i64,
                "Height" => bitmap.height() as i64,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            bitmap.as_raw().clone(),
        );
        let mut doc = lopdf::Document::with_version("1.5");
        let id = doc.add_object(stream);
        let resources = dictionary! { "XObject" => dictionary! { "Im0" => id } };
        let (w, h) = (bbox.width(), bbox.height());
        let ops = format!("q {w} 0 0 {h} {} {} cm /Im0 Do Q", bbox.left, 792.0 - bbox.bottom);
        let primitives = crate::pipeline::content::interpret(
            &doc,
            Some(&resources),
            ops.as_bytes(),
            crate::pipeline::content::PageFrame { x0: 0.0, y1: 792.0 },
        );
        PageHandle::from_primitives(0, 612.0, 792.0, primitives)
    }

    #[tokio::test]
    async fn chart_image_is_decoded_and_scored() {
        let page = page_with_image(&chart(), BoundingBox::new(100.0, 100.0, 300.0, 300.0));
        let frags = EmbeddedImageExtractor::default().extract(&page).await.unwrap();
        assert_eq!(frags.len(), 1);
        assert!(frags[0].confidence > 0.5);
        match &frags[0].payload {
            FragmentPayload::Image(r) => {
                assert_eq!(r.name, "Im0");
                assert_eq!((r.pixel_width, r.pixel_height), (100, 100));
                assert!(r.structure.is_some());
                assert!(r.png.is_some());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn images_below_ocr_trigger_are_not_encoded() {
        let blank = GrayImage::from_pixel(100, 100, Luma([255]));
        let page = page_with_image(&blank, BoundingBox::new(100.0, 100.0, 300.0, 300.0));
        let frags = EmbeddedImageExtractor::default().extract(&page).await.unwrap();
        assert_eq!(frags[0].confidence, 0.0);
        match &frags[0].payload {
            FragmentPayload::Image(r) => {
                assert!(r.structure.is_some());
                assert!(r.png.is_none());
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let strict = EmbeddedImageExtractor {
            encode_above: 0.99,
            ..Default::default()
        };
        let page = page_with_image(&chart(), BoundingBox::new(100.0, 100.0, 300.0, 300.0));
        match &strict.extract(&page).await.unwrap()[0].payload {
            FragmentPayload::Image(r) => assert!(r.png.is_none()),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn tiny_image_scores_near_zero() {
        let icon = GrayImage::from_pixel(8, 8, Luma([0]));
        let page = page_with_image(&icon, BoundingBox::new(10.0, 10.0, 18.0, 18.0));
        let frags = EmbeddedImageExtractor::default().extract(&page).await.unwrap();
        assert!((frags[0].confidence - TINY_CONFIDENCE).abs() < 1e-6);
    }

    #[tokio::test]
    async fn page_without_images_yields_nothing() {
        let page = PageHandle::from_primitives(0, 612.0, 792.0, PagePrimitives::default());
        assert!(EmbeddedImageExtractor::default().extract(&page).await.unwrap().is_empty());
    }
}
