//! HTTP API detector for SIEM/EDR style back-ends
//!
//! Queries a JSON HTTP endpoint described by the task config and parses an
//! `events_found` count out of the reply. Vendor-specific detectors wrap
//! their own request shape around the same classification rules.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::codec::{Detected, TaskEnvelope};
use crate::store::DetectionType;
use crate::{Error, Result};

use super::{Detection, Detector, DetectorError, DetectorResult};

/// Map an HTTP status to a detector failure. 2xx passes; 429 and 5xx are
/// worth retrying; other 4xx means the request itself is wrong.
pub fn classify_status(status: StatusCode) -> Option<DetectorError> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Some(DetectorError::Transient(format!(
            "upstream returned {status}"
        )))
    } else {
        Some(DetectorError::Permanent(format!(
            "upstream returned {status}"
        )))
    }
}

/// Extract the observation out of a detection API reply
pub fn parse_events(body: &serde_json::Value) -> (Detected, serde_json::Value) {
    match body.get("events_found").and_then(serde_json::Value::as_i64) {
        Some(n) => (
            Detected::from_bool(Some(n > 0)),
            serde_json::json!({ "events_found": n }),
        ),
        None => (Detected::Unknown, serde_json::json!({})),
    }
}

pub struct HttpApiDetector {
    name: String,
    platform: String,
    client: reqwest::Client,
}

impl HttpApiDetector {
    pub fn new(
        name: impl Into<String>,
        platform: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(Self {
            name: name.into(),
            platform: platform.into(),
            client,
        })
    }
}

#[async_trait]
impl Detector for HttpApiDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, detection_type: DetectionType, platform: &str) -> bool {
        detection_type == DetectionType::Api && platform == self.platform
    }

    async fn detect(&self, task: &TaskEnvelope) -> DetectorResult {
        let url = task
            .config
            .get("url")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| DetectorError::Permanent("detection config has no 'url'".into()))?;
        let query = task.config.get("query").cloned().unwrap_or_default();

        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    DetectorError::Transient(e.to_string())
                } else {
                    DetectorError::Permanent(e.to_string())
                }
            })?;

        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| DetectorError::Permanent(format!("undecodable reply: {e}")))?;
        let (detected, parsed_results) = parse_events(&body);

        Ok(Detection {
            detected,
            raw_response: body,
            parsed_results,
            source: self.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::OK).is_none());
        assert!(classify_status(StatusCode::CREATED).is_none());
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(DetectorError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            Some(DetectorError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED),
            Some(DetectorError::Permanent(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST),
            Some(DetectorError::Permanent(_))
        ));
    }

    #[test]
    fn test_parse_events() {
        let (detected, parsed) = parse_events(&serde_json::json!({"events_found": 2}));
        assert_eq!(detected, Detected::Yes);
        assert_eq!(parsed["events_found"], 2);

        let (detected, _) = parse_events(&serde_json::json!({"events_found": 0}));
        assert_eq!(detected, Detected::No);

        let (detected, _) = parse_events(&serde_json::json!({"something": "else"}));
        assert_eq!(detected, Detected::Unknown);
    }

    #[test]
    fn test_supports_only_its_api_platform() {
        let detector =
            HttpApiDetector::new("siem.http", "siem", Duration::from_secs(30)).unwrap();
        assert!(detector.supports(DetectionType::Api, "siem"));
        assert!(!detector.supports(DetectionType::Api, "edr"));
        assert!(!detector.supports(DetectionType::Windows, "siem"));
    }
}
