//! Mock detector for end-to-end runs and tests
//!
//! Makes no real requests: validates the task's detection window, optionally
//! fails a scripted number of times to exercise retry handling, then reports
//! a fixed observation.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::codec::{Detected, TaskEnvelope};
use crate::store::DetectionType;

use super::{Detection, Detector, DetectorError, DetectorResult};

pub struct MockDetector {
    source: String,
    /// None supports every task; Some restricts to one (type, platform)
    supports: Option<(DetectionType, String)>,
    detected: Detected,
    /// Remaining scripted transient failures before success
    transient_failures: AtomicU32,
    permanent_failure: Option<String>,
}

impl MockDetector {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            supports: None,
            detected: Detected::Yes,
            transient_failures: AtomicU32::new(0),
            permanent_failure: None,
        }
    }

    /// Restrict to one (type, platform) pair
    pub fn supporting(mut self, detection_type: DetectionType, platform: impl Into<String>) -> Self {
        self.supports = Some((detection_type, platform.into()));
        self
    }

    pub fn reporting(mut self, detected: Detected) -> Self {
        self.detected = detected;
        self
    }

    /// Fail transiently this many times before succeeding
    pub fn failing_transiently(self, times: u32) -> Self {
        self.transient_failures.store(times, Ordering::SeqCst);
        self
    }

    /// Always fail permanently with this message
    pub fn failing_permanently(mut self, message: impl Into<String>) -> Self {
        self.permanent_failure = Some(message.into());
        self
    }
}

#[async_trait]
impl Detector for MockDetector {
    fn name(&self) -> &str {
        &self.source
    }

    fn supports(&self, detection_type: DetectionType, platform: &str) -> bool {
        match &self.supports {
            None => true,
            Some((ty, p)) => *ty == detection_type && p == platform,
        }
    }

    async fn detect(&self, task: &TaskEnvelope) -> DetectorResult {
        if let Some(message) = &self.permanent_failure {
            return Err(DetectorError::Permanent(message.clone()));
        }

        // an inverted detection window can never match anything
        let time_from = task.config.get("time_from_ms").and_then(|v| v.as_i64());
        let time_to = task.config.get("time_to_ms").and_then(|v| v.as_i64());
        if let (Some(from), Some(to)) = (time_from, time_to) {
            if from > to {
                return Err(DetectorError::Permanent(format!(
                    "inverted detection window: {from} > {to}"
                )));
            }
        }

        let remaining = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if remaining {
            return Err(DetectorError::Transient(
                "scripted transient failure".to_string(),
            ));
        }

        let events_found = match self.detected {
            Detected::Yes => 3,
            _ => 0,
        };
        Ok(Detection {
            detected: self.detected,
            raw_response: serde_json::json!({
                "events_found": events_found,
                "query": task.config.get("query").cloned().unwrap_or_default(),
            }),
            parsed_results: serde_json::json!({ "events_found": events_found }),
            source: self.source.clone(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn task(config: serde_json::Value) -> TaskEnvelope {
        TaskEnvelope {
            task_id: Uuid::new_v4(),
            detection_execution_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            operation_id: Uuid::new_v4(),
            detection_type: DetectionType::Api,
            platform: "siem".into(),
            config,
            max_retries: 3,
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_detects_by_default() {
        let detector = MockDetector::new("mock.api");
        let detection = detector
            .detect(&task(serde_json::json!({"query": "host=ws-042"})))
            .await
            .unwrap();
        assert_eq!(detection.detected, Detected::Yes);
        assert_eq!(detection.parsed_results["events_found"], 3);
        assert_eq!(detection.source, "mock.api");
    }

    #[tokio::test]
    async fn test_scripted_transient_failures_then_success() {
        let detector = MockDetector::new("mock.api").failing_transiently(2);
        let t = task(serde_json::json!({}));
        assert!(matches!(
            detector.detect(&t).await,
            Err(DetectorError::Transient(_))
        ));
        assert!(matches!(
            detector.detect(&t).await,
            Err(DetectorError::Transient(_))
        ));
        assert!(detector.detect(&t).await.is_ok());
    }

    #[tokio::test]
    async fn test_inverted_window_is_permanent() {
        let detector = MockDetector::new("mock.api");
        let result = detector
            .detect(&task(serde_json::json!({"time_from_ms": 200, "time_to_ms": 100})))
            .await;
        assert!(matches!(result, Err(DetectorError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_reporting_negative_observation() {
        let detector = MockDetector::new("mock.api").reporting(Detected::No);
        let detection = detector.detect(&task(serde_json::json!({}))).await.unwrap();
        assert_eq!(detection.detected, Detected::No);
        assert_eq!(detection.parsed_results["events_found"], 0);
    }

    #[test]
    fn test_support_restriction() {
        let detector = MockDetector::new("mock").supporting(DetectionType::Api, "siem");
        assert!(detector.supports(DetectionType::Api, "siem"));
        assert!(!detector.supports(DetectionType::Api, "edr"));
        assert!(!detector.supports(DetectionType::Windows, "siem"));
    }
}
