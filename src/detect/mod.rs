mod backend;
mod backends;
mod registry;
mod result;
pub mod yolo;

use anyhow::Result;

use crate::config::DetectorSettings;

pub use backend::Detector;
pub use backends::StubDetector;
#[cfg(feature = "backend-tract")]
pub use backends::TractDetector;
pub use registry::{AllowList, DetectorRegistry};
pub use result::{BoundingBox, DetectionResult, LabeledDetection, RawDetection};

/// Build a registry from configured model files, in configuration order.
#[cfg(feature = "backend-tract")]
pub fn load_registry(settings: &[DetectorSettings]) -> Result<DetectorRegistry> {
    let mut registry = DetectorRegistry::new();
    for detector in settings {
        let backend = TractDetector::new(&detector.model_path, detector.input_size)?
            .with_threshold(detector.confidence)
            .with_iou_threshold(detector.iou);
        registry.register(
            &detector.name,
            backend,
            detector.labels.clone(),
            detector.allow.as_ref().map(|allow| AllowList::new(allow.iter().cloned())),
        )?;
        log::info!(
            "detector '{}' loaded from {} ({} labels)",
            detector.name,
            detector.model_path.display(),
            detector.labels.len()
        );
    }
    Ok(registry)
}

#[cfg(not(feature = "backend-tract"))]
pub fn load_registry(settings: &[DetectorSettings]) -> Result<DetectorRegistry> {
    match settings.first() {
        Some(detector) => Err(anyhow::anyhow!(
            "detector '{}' needs an inference backend; rebuild with --features backend-tract, \
             or set `detectors = []` in the config to only capture snapshots",
            detector.name
        )),
        None => Ok(DetectorRegistry::new()),
    }
}
