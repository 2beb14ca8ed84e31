//! Execution-record envelope produced by the upstream emulation tool

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::DetectionType;

use super::canonical_time;

/// Two-level detection request map: `{type: {platform: config}}`.
///
/// `BTreeMap` keeps iteration in key order, so replays of the same record
/// walk the requested detections in the same sequence.
pub type DetectionsMap = BTreeMap<DetectionType, BTreeMap<String, serde_json::Value>>;

/// Reference to the upstream campaign the execution belongs to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRef {
    pub id: Uuid,
    pub name: String,
    #[serde(with = "canonical_time")]
    pub started_at: DateTime<Utc>,
}

/// Captured stdout/stderr/exit code of one agent command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultData {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// One command result reported by one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub link_id: Uuid,
    pub agent_host: String,
    pub agent_paw: String,
    pub command: String,
    pub pid: i64,
    pub status: i64,
    pub result_data: ResultData,
    #[serde(with = "canonical_time")]
    pub agent_reported_at: DateTime<Utc>,
    pub link_state: String,
}

/// Complete execution-record message from the instructions queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub operation: OperationRef,
    pub execution: ExecutionReport,
    #[serde(default)]
    pub detections: DetectionsMap,
    /// Original producer payload, retained opaque for audit
    #[serde(default)]
    pub raw_message: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode;

    fn record_json() -> serde_json::Value {
        serde_json::json!({
            "operation": {
                "id": "7f9c3be2-63c1-4b5a-9c40-12f3a85cda01",
                "name": "nightly-emulation",
                "started_at": "2025-03-14T09:00:00.000000Z"
            },
            "execution": {
                "link_id": "2d1f2a04-8b10-4a7f-8d34-5b9c01e7aa22",
                "agent_host": "ws-042",
                "agent_paw": "kxqwpz",
                "command": "whoami",
                "pid": 4120,
                "status": 0,
                "result_data": {"stdout": "corp\\alice", "stderr": "", "exit_code": 0},
                "agent_reported_at": "2025-03-14T09:01:12.431002Z",
                "link_state": "SUCCESS"
            },
            "detections": {
                "api": {"siem": {"query": "host=ws-042 whoami"}},
                "windows": {"psh": {"script": "Get-WinEvent"}}
            },
            "raw_message": {"anything": "goes"}
        })
    }

    #[test]
    fn test_decode_full_record() {
        let bytes = serde_json::to_vec(&record_json()).unwrap();
        let record: ExecutionRecord = decode(&bytes).unwrap();
        assert_eq!(record.operation.name, "nightly-emulation");
        assert_eq!(record.execution.agent_paw, "kxqwpz");
        assert_eq!(record.execution.result_data.exit_code, 0);
        assert_eq!(record.detections.len(), 2);
    }

    #[test]
    fn test_missing_detections_is_empty_plan_input() {
        let mut json = record_json();
        json.as_object_mut().unwrap().remove("detections");
        let bytes = serde_json::to_vec(&json).unwrap();
        let record: ExecutionRecord = decode(&bytes).unwrap();
        assert!(record.detections.is_empty());
    }

    #[test]
    fn test_missing_link_id_is_malformed() {
        let mut json = record_json();
        json["execution"].as_object_mut().unwrap().remove("link_id");
        let bytes = serde_json::to_vec(&json).unwrap();
        let result: crate::Result<ExecutionRecord> = decode(&bytes);
        assert!(matches!(result, Err(crate::Error::Malformed(_))));
    }

    #[test]
    fn test_mistyped_pid_is_malformed() {
        let mut json = record_json();
        json["execution"]["pid"] = serde_json::json!("not-a-number");
        let bytes = serde_json::to_vec(&json).unwrap();
        let result: crate::Result<ExecutionRecord> = decode(&bytes);
        assert!(matches!(result, Err(crate::Error::Malformed(_))));
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let mut json = record_json();
        json["future_field"] = serde_json::json!({"v": 2});
        json["execution"]["extra"] = serde_json::json!(true);
        let bytes = serde_json::to_vec(&json).unwrap();
        let record: ExecutionRecord = decode(&bytes).unwrap();
        assert_eq!(record.execution.command, "whoami");
    }

    #[test]
    fn test_unknown_detection_type_is_malformed() {
        let mut json = record_json();
        json["detections"] = serde_json::json!({"solaris": {"sh": {}}});
        let bytes = serde_json::to_vec(&json).unwrap();
        let result: crate::Result<ExecutionRecord> = decode(&bytes);
        assert!(matches!(result, Err(crate::Error::Malformed(_))));
    }
}
