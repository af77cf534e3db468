//! Incident overlays.
//!
//! Every detector's boxes are drawn on one copy of the capture. Negative findings
//! are outlined in red, everything else in green, and each box carries a small tag
//! whose colour identifies the label.

use std::io::Cursor;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use sha2::{Digest, Sha256};

use crate::detect::{BoundingBox, DetectionResult};

const NEGATIVE_COLOR: Rgb<u8> = Rgb([230, 30, 30]);
const POSITIVE_COLOR: Rgb<u8> = Rgb([40, 200, 70]);
const TAG_HEIGHT: u32 = 6;
const TAG_WIDTH: u32 = 18;

/// Draw all detections from all detectors onto a copy of `image`.
pub fn render_overlay(
    image: &RgbImage,
    results: &[DetectionResult],
    is_negative: impl Fn(&str) -> bool,
    thickness: u32,
) -> RgbImage {
    let mut out = image.clone();
    for result in results {
        for detection in &result.detections {
            let color = if is_negative(&detection.label) {
                NEGATIVE_COLOR
            } else {
                POSITIVE_COLOR
            };
            draw_rect(&mut out, detection.bbox, color, thickness);
            draw_tag(&mut out, detection.bbox, label_color(&detection.label));
        }
    }
    out
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode_image(image)
        .context("encode annotated jpeg")?;
    Ok(buf.into_inner())
}

/// Stable colour per label so the same label always gets the same tag.
pub fn label_color(label: &str) -> Rgb<u8> {
    let digest = Sha256::digest(label.as_bytes());
    Rgb([digest[0] | 0x40, digest[1] | 0x40, digest[2] | 0x40])
}

fn clamp_px(v: f32, max: u32) -> u32 {
    v.max(0.0).min(max.saturating_sub(1) as f32) as u32
}

fn draw_rect(img: &mut RgbImage, bbox: BoundingBox, color: Rgb<u8>, thickness: u32) {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let x0 = clamp_px(bbox.x0, w);
    let y0 = clamp_px(bbox.y0, h);
    let x1 = clamp_px(bbox.x1, w);
    let y1 = clamp_px(bbox.y1, h);
    for t in 0..thickness.max(1) {
        let xx0 = x0 + t;
        let yy0 = y0 + t;
        let xx1 = x1.saturating_sub(t);
        let yy1 = y1.saturating_sub(t);
        if xx0 > xx1 || yy0 > yy1 {
            break;
        }
        for x in xx0..=xx1 {
            img.put_pixel(x, yy0, color);
            img.put_pixel(x, yy1, color);
        }
        for y in yy0..=yy1 {
            img.put_pixel(xx0, y, color);
            img.put_pixel(xx1, y, color);
        }
    }
}

fn draw_tag(img: &mut RgbImage, bbox: BoundingBox, color: Rgb<u8>) {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let x0 = clamp_px(bbox.x0, w);
    let top = clamp_px(bbox.y0, h);
    // Above the box when there is room, otherwise inside it.
    let y0 = if top >= TAG_HEIGHT { top - TAG_HEIGHT } else { top };
    let x1 = (x0 + TAG_WIDTH).min(w);
    let y1 = (y0 + TAG_HEIGHT).min(h);
    for y in y0..y1 {
        for x in x0..x1 {
            img.put_pixel(x, y, color);
        }
    }
}
