use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::result::{DetectionResult, LabeledDetection};

use super::backend::Detector;

/// Labels a deployment cares about for one detector. Everything else the model
/// knows is discarded after classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllowList {
    labels: BTreeSet<String>,
}

impl AllowList {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn permits(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// Keeps permitted labels in their original order.
    pub fn filter(&self, labels: &[String]) -> Vec<String> {
        labels
            .iter()
            .filter(|label| self.permits(label))
            .cloned()
            .collect()
    }
}

struct RegisteredDetector {
    name: String,
    backend: Arc<Mutex<dyn Detector>>,
    vocabulary: Vec<String>,
    allow_list: Option<AllowList>,
}

/// Named detectors in registration order.
///
/// Registration order is the fan-out order used by the consumer. Backends are
/// wrapped in `Mutex` because `Detector::detect` takes `&mut self`.
pub struct DetectorRegistry {
    detectors: Vec<RegisteredDetector>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            detectors: Vec::new(),
        }
    }

    /// Register a detector under a unique name with its index-to-label vocabulary.
    pub fn register<D: Detector + 'static>(
        &mut self,
        name: &str,
        backend: D,
        vocabulary: Vec<String>,
        allow_list: Option<AllowList>,
    ) -> Result<()> {
        if name.trim().is_empty() {
            return Err(anyhow!("detector name must not be empty"));
        }
        if self.detectors.iter().any(|d| d.name == name) {
            return Err(anyhow!("detector '{}' already registered", name));
        }
        if vocabulary.is_empty() {
            return Err(anyhow!("detector '{}' has an empty vocabulary", name));
        }
        if let Some(allow) = &allow_list {
            if let Some(unknown) = allow.labels.iter().find(|l| !vocabulary.contains(*l)) {
                log::warn!(
                    "detector '{}': allow-listed label '{}' is not in its vocabulary",
                    name,
                    unknown
                );
            }
        }
        log::debug!(
            "registered detector '{}' ({} backend, {} labels)",
            name,
            backend.name(),
            vocabulary.len()
        );
        self.detectors.push(RegisteredDetector {
            name: name.to_string(),
            backend: Arc::new(Mutex::new(backend)),
            vocabulary,
            allow_list,
        });
        Ok(())
    }

    /// Detector names in fan-out order.
    pub fn names(&self) -> Vec<&str> {
        self.detectors.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    pub fn vocabulary(&self, name: &str) -> Option<&[String]> {
        self.find(name).map(|d| d.vocabulary.as_slice())
    }

    pub fn allow_list(&self, name: &str) -> Option<&AllowList> {
        self.find(name).and_then(|d| d.allow_list.as_ref())
    }

    fn find(&self, name: &str) -> Option<&RegisteredDetector> {
        self.detectors.iter().find(|d| d.name == name)
    }

    /// Run one detector and map its output to allow-listed labels.
    pub fn classify(&self, name: &str, image: &RgbImage) -> Result<DetectionResult> {
        let entry = self
            .find(name)
            .ok_or_else(|| anyhow!("detector '{}' not registered", name))?;
        classify_entry(entry, image)
    }

    /// Run every detector in order. A failing detector yields an `Err` in its slot
    /// and does not stop the others.
    pub fn classify_all(&self, image: &RgbImage) -> Vec<(String, Result<DetectionResult>)> {
        self.detectors
            .iter()
            .map(|entry| (entry.name.clone(), classify_entry(entry, image)))
            .collect()
    }

    pub fn warm_up(&self) -> Result<()> {
        for entry in &self.detectors {
            let mut guard = entry
                .backend
                .lock()
                .map_err(|_| anyhow!("detector '{}' lock poisoned", entry.name))?;
            guard.warm_up()?;
        }
        Ok(())
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_entry(entry: &RegisteredDetector, image: &RgbImage) -> Result<DetectionResult> {
    let raw = {
        let mut guard = entry
            .backend
            .lock()
            .map_err(|_| anyhow!("detector '{}' lock poisoned", entry.name))?;
        guard.detect(image)?
    };

    let mut detections = Vec::with_capacity(raw.len());
    for detection in raw {
        let label = entry.vocabulary.get(detection.class_index).ok_or_else(|| {
            anyhow!(
                "detector '{}' returned class {} outside its {}-label vocabulary",
                entry.name,
                detection.class_index,
                entry.vocabulary.len()
            )
        })?;
        if let Some(allow) = &entry.allow_list {
            if !allow.permits(label) {
                continue;
            }
        }
        detections.push(LabeledDetection {
            label: label.clone(),
            bbox: detection.bbox,
            confidence: detection.confidence,
        });
    }

    Ok(DetectionResult {
        detector: entry.name.clone(),
        detections,
    })
}
