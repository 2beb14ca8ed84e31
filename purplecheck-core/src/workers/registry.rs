//! Detector registry: routes tasks to the detector that supports them

use std::sync::Arc;

use crate::store::DetectionType;

use super::Detector;

/// Ordered set of registered detectors; first supporting detector wins
#[derive(Default, Clone)]
pub struct DetectorRegistry {
    detectors: Vec<Arc<dyn Detector>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, detector: Arc<dyn Detector>) {
        self.detectors.push(detector);
    }

    pub fn with(mut self, detector: Arc<dyn Detector>) -> Self {
        self.register(detector);
        self
    }

    pub fn find(&self, detection_type: DetectionType, platform: &str) -> Option<Arc<dyn Detector>> {
        self.detectors
            .iter()
            .find(|d| d.supports(detection_type, platform))
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }
}
