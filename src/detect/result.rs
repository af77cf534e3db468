/// Axis-aligned box in pixel coordinates (`x0,y0` top-left, `x1,y1` bottom-right).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x0: cx - w / 2.0,
            y0: cy - h / 2.0,
            x1: cx + w / 2.0,
            y1: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union; 0.0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = BoundingBox {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        }
        .area();
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Backend output before vocabulary mapping.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub class_index: usize,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LabeledDetection {
    pub label: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Labels one detector produced for one image, in backend output order.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionResult {
    pub detector: String,
    pub detections: Vec<LabeledDetection>,
}

impl DetectionResult {
    /// Result without geometry, for rules that only look at labels.
    pub fn from_labels(detector: &str, labels: &[&str]) -> Self {
        Self {
            detector: detector.to_string(),
            detections: labels
                .iter()
                .map(|label| LabeledDetection {
                    label: label.to_string(),
                    bbox: BoundingBox::default(),
                    confidence: 1.0,
                })
                .collect(),
        }
    }

    pub fn labels(&self) -> Vec<&str> {
        self.detections
            .iter()
            .map(|detection| detection.label.as_str())
            .collect()
    }
}
