#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::Detector;
use crate::detect::result::RawDetection;
use crate::detect::yolo::{decode_predictions, non_max_suppression, Letterbox};

/// Tract-based backend for YOLO-style ONNX detectors.
///
/// Loads a local model file and runs letterboxed RGB inference. Performs no network
/// I/O and writes nothing to disk.
pub struct TractDetector {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractDetector {
    /// Load an ONNX model with a square `input_size` input and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Override the default NMS IoU threshold.
    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    fn build_input(&self, canvas: &RgbImage) -> Tensor {
        let side = self.input_size as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
            canvas.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        })
        .into_tensor()
    }
}

impl Detector for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>> {
        let (width, height) = image.dimensions();
        let letterbox = Letterbox::new(width, height, self.input_size)?;
        let canvas = letterbox.apply(image, self.input_size);
        let input = self.build_input(&canvas);

        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let scores = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = scores.shape().to_vec();
        let data: Vec<f32> = scores.iter().copied().collect();

        let detections = decode_predictions(&data, &shape, &letterbox, self.confidence_threshold)?;
        Ok(non_max_suppression(detections, self.iou_threshold))
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.input_size, self.input_size);
        self.detect(&blank).map(|_| ())
    }
}
