use anyhow::Result;
use image::RgbImage;

use crate::detect::result::RawDetection;

/// Object detector backend.
///
/// A backend knows nothing about label names: it returns class indices into the
/// vocabulary it was trained with, and the registry maps them to labels.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one decoded RGB image.
    ///
    /// Bounding boxes are returned in the pixel coordinates of `image`.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
