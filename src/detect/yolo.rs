//! Pre- and post-processing for single-stage YOLO-style detectors.
//!
//! Inputs are letterboxed to a square canvas; outputs are one row per anchor with
//! `cx, cy, w, h` followed by one score per class.

use anyhow::{anyhow, Result};
use image::{imageops, Rgb, RgbImage};

use crate::detect::result::{BoundingBox, RawDetection};

const PAD_VALUE: u8 = 114;

/// Mapping between source image pixels and the square model canvas.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub source_width: u32,
    pub source_height: u32,
}

impl Letterbox {
    pub fn new(source_width: u32, source_height: u32, size: u32) -> Result<Self> {
        if source_width == 0 || source_height == 0 || size == 0 {
            return Err(anyhow!(
                "cannot letterbox {}x{} into {}",
                source_width,
                source_height,
                size
            ));
        }
        let scale = (size as f32 / source_width as f32).min(size as f32 / source_height as f32);
        let scaled_w = (source_width as f32 * scale).round();
        let scaled_h = (source_height as f32 * scale).round();
        Ok(Self {
            scale,
            pad_x: ((size as f32 - scaled_w) / 2.0).floor(),
            pad_y: ((size as f32 - scaled_h) / 2.0).floor(),
            source_width,
            source_height,
        })
    }

    /// Resize `image` into a padded `size`x`size` canvas.
    pub fn apply(&self, image: &RgbImage, size: u32) -> RgbImage {
        let scaled_w = ((self.source_width as f32 * self.scale).round() as u32).clamp(1, size);
        let scaled_h = ((self.source_height as f32 * self.scale).round() as u32).clamp(1, size);
        let resized = imageops::resize(image, scaled_w, scaled_h, imageops::FilterType::Triangle);
        let mut canvas = RgbImage::from_pixel(size, size, Rgb([PAD_VALUE; 3]));
        imageops::replace(&mut canvas, &resized, self.pad_x as i64, self.pad_y as i64);
        canvas
    }

    /// Map a canvas-space box back to source pixels, clamped to the image.
    pub fn to_source(&self, bbox: BoundingBox) -> BoundingBox {
        let max_x = self.source_width as f32;
        let max_y = self.source_height as f32;
        BoundingBox {
            x0: ((bbox.x0 - self.pad_x) / self.scale).clamp(0.0, max_x),
            y0: ((bbox.y0 - self.pad_y) / self.scale).clamp(0.0, max_y),
            x1: ((bbox.x1 - self.pad_x) / self.scale).clamp(0.0, max_x),
            y1: ((bbox.y1 - self.pad_y) / self.scale).clamp(0.0, max_y),
        }
    }
}

/// Decode a `[1, 4 + classes, anchors]` (or transposed `[1, anchors, 4 + classes]`)
/// prediction tensor into boxes above `confidence_threshold`.
pub fn decode_predictions(
    data: &[f32],
    shape: &[usize],
    letterbox: &Letterbox,
    confidence_threshold: f32,
) -> Result<Vec<RawDetection>> {
    let (rows, anchors, transposed) = match shape {
        [1, a, b] if a <= b => (*a, *b, false),
        [1, a, b] => (*b, *a, true),
        other => return Err(anyhow!("unexpected detector output shape {:?}", other)),
    };
    if rows < 5 {
        return Err(anyhow!(
            "detector output has {} rows; expected box + at least one class",
            rows
        ));
    }
    if data.len() != rows * anchors {
        return Err(anyhow!(
            "detector output holds {} values, shape {:?} needs {}",
            data.len(),
            shape,
            rows * anchors
        ));
    }
    let at = |row: usize, anchor: usize| -> f32 {
        if transposed {
            data[anchor * rows + row]
        } else {
            data[row * anchors + anchor]
        }
    };

    let mut out = Vec::new();
    for anchor in 0..anchors {
        let (class_index, confidence) = (4..rows)
            .map(|row| (row - 4, at(row, anchor)))
            .fold((0, f32::NEG_INFINITY), |best, candidate| {
                if candidate.1 > best.1 {
                    candidate
                } else {
                    best
                }
            });
        if !confidence.is_finite() || confidence < confidence_threshold {
            continue;
        }
        let canvas_box = BoundingBox::from_center(
            at(0, anchor),
            at(1, anchor),
            at(2, anchor),
            at(3, anchor),
        );
        out.push(RawDetection {
            class_index,
            bbox: letterbox.to_source(canvas_box),
            confidence,
        });
    }
    Ok(out)
}

/// Greedy per-class non-maximum suppression. Output is sorted by confidence.
pub fn non_max_suppression(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<RawDetection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept.iter().any(|k| {
            k.class_index == candidate.class_index && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
