//! Detection response envelope published by workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::canonical_time;

/// How the detection attempt ended, independent of what it observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Error,
    Timeout,
}

/// Tri-state observation: on the wire `true`, `false`, or `null`.
/// Anything else fails the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detected {
    Yes,
    No,
    Unknown,
}

impl Detected {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Detected::Yes => Some(true),
            Detected::No => Some(false),
            Detected::Unknown => None,
        }
    }

    pub fn from_bool(value: Option<bool>) -> Self {
        match value {
            Some(true) => Detected::Yes,
            Some(false) => Detected::No,
            None => Detected::Unknown,
        }
    }
}

impl Serialize for Detected {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self.as_bool() {
            Some(b) => serializer.serialize_bool(b),
            None => serializer.serialize_unit(),
        }
    }
}

impl<'de> Deserialize<'de> for Detected {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Option::<bool>::deserialize(deserializer).map(Detected::from_bool)
    }
}

/// One observation reported by a worker for a detection execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub task_id: Uuid,
    pub detection_execution_id: Uuid,
    pub outcome: Outcome,
    pub detected: Detected,
    #[serde(default)]
    pub raw_response: serde_json::Value,
    #[serde(default)]
    pub parsed_results: serde_json::Value,
    pub source: String,
    pub worker_id: String,
    #[serde(with = "canonical_time")]
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};

    fn response_json() -> serde_json::Value {
        serde_json::json!({
            "task_id": Uuid::new_v4(),
            "detection_execution_id": Uuid::new_v4(),
            "outcome": "ok",
            "detected": true,
            "raw_response": {"events_found": 3},
            "parsed_results": {"events_found": 3},
            "source": "siem.test",
            "worker_id": "api-7c1d2e",
            "finished_at": "2025-03-14T09:02:00.000000Z",
            "metadata": {}
        })
    }

    #[test]
    fn test_decode_response() {
        let bytes = serde_json::to_vec(&response_json()).unwrap();
        let response: ResponseEnvelope = decode(&bytes).unwrap();
        assert_eq!(response.outcome, Outcome::Ok);
        assert_eq!(response.detected, Detected::Yes);
        assert_eq!(response.source, "siem.test");
    }

    #[test]
    fn test_detected_null_is_unknown() {
        let mut json = response_json();
        json["detected"] = serde_json::Value::Null;
        let bytes = serde_json::to_vec(&json).unwrap();
        let response: ResponseEnvelope = decode(&bytes).unwrap();
        assert_eq!(response.detected, Detected::Unknown);
    }

    #[test]
    fn test_detected_rejects_other_values() {
        for bad in [serde_json::json!("maybe"), serde_json::json!(1)] {
            let mut json = response_json();
            json["detected"] = bad;
            let bytes = serde_json::to_vec(&json).unwrap();
            let result: crate::Result<ResponseEnvelope> = decode(&bytes);
            assert!(matches!(result, Err(crate::Error::Malformed(_))));
        }
    }

    #[test]
    fn test_unknown_serializes_as_null() {
        let mut json = response_json();
        json["detected"] = serde_json::Value::Null;
        let bytes = serde_json::to_vec(&json).unwrap();
        let response: ResponseEnvelope = decode(&bytes).unwrap();

        let encoded = encode(&response).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert!(value["detected"].is_null());
    }

    #[test]
    fn test_invalid_outcome_is_malformed() {
        let mut json = response_json();
        json["outcome"] = serde_json::json!("cancelled");
        let bytes = serde_json::to_vec(&json).unwrap();
        let result: crate::Result<ResponseEnvelope> = decode(&bytes);
        assert!(matches!(result, Err(crate::Error::Malformed(_))));
    }
}
