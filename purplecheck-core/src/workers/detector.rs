//! Detector trait definitions

use async_trait::async_trait;

use crate::codec::{Detected, TaskEnvelope};
use crate::store::DetectionType;

/// One successful observation from a detection back-end
#[derive(Debug, Clone)]
pub struct Detection {
    pub detected: Detected,
    pub raw_response: serde_json::Value,
    pub parsed_results: serde_json::Value,
    /// Which back-end produced the observation (API endpoint, hostname, ...)
    pub source: String,
}

/// Detector failure split by whether retrying can help
#[derive(Debug, Clone, thiserror::Error)]
pub enum DetectorError {
    /// Timeout, connection loss, 5xx: retried within the task's budget
    #[error("transient detector failure: {0}")]
    Transient(String),
    /// 4xx, invalid config, inverted windows: never retried
    #[error("permanent detector failure: {0}")]
    Permanent(String),
}

pub type DetectorResult = std::result::Result<Detection, DetectorError>;

/// Platform-specific detection back-end invoked by the worker runtime
#[async_trait]
pub trait Detector: Send + Sync {
    /// Short name used in logs and result sources
    fn name(&self) -> &str;

    /// Whether this detector handles `(detection_type, platform)` tasks
    fn supports(&self, detection_type: DetectionType, platform: &str) -> bool;

    /// Run one detection attempt for the task's config
    async fn detect(&self, task: &TaskEnvelope) -> DetectorResult;
}
