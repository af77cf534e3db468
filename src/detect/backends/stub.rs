use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::Detector;
use crate::detect::result::{BoundingBox, RawDetection};

/// Scripted backend for tests and dry runs. Returns the same detections (or the
/// same failure) for every image.
pub struct StubDetector {
    detections: Vec<RawDetection>,
    failure: Option<String>,
}

impl StubDetector {
    pub fn new(detections: Vec<RawDetection>) -> Self {
        Self {
            detections,
            failure: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// One detection per class index, laid out as adjacent boxes.
    pub fn with_classes(classes: &[usize]) -> Self {
        let detections = classes
            .iter()
            .enumerate()
            .map(|(i, &class_index)| {
                let x0 = (i as f32) * 4.0;
                RawDetection {
                    class_index,
                    bbox: BoundingBox::new(x0, 0.0, x0 + 3.0, 3.0),
                    confidence: 0.9,
                }
            })
            .collect();
        Self::new(detections)
    }

    pub fn failing(message: &str) -> Self {
        Self {
            detections: Vec::new(),
            failure: Some(message.to_string()),
        }
    }
}

impl Default for StubDetector {
    fn default() -> Self {
        Self::empty()
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<RawDetection>> {
        if let Some(message) = &self.failure {
            return Err(anyhow!("stub detector failure: {}", message));
        }
        Ok(self.detections.clone())
    }
}
