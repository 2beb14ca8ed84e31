//! Detection task envelope dispatched to worker queues

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::DetectionType;

use super::canonical_time;

/// One detection task carried to an api or agent worker.
///
/// The envelope holds only references into the store plus the config blob
/// the worker needs; rows stay owned by the store gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: Uuid,
    pub detection_execution_id: Uuid,
    pub execution_id: Uuid,
    pub operation_id: Uuid,
    pub detection_type: DetectionType,
    pub platform: String,
    pub config: serde_json::Value,
    pub max_retries: u32,
    #[serde(with = "canonical_time")]
    pub enqueued_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};

    #[test]
    fn test_task_round_trip() {
        let task = TaskEnvelope {
            task_id: Uuid::new_v4(),
            detection_execution_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            operation_id: Uuid::new_v4(),
            detection_type: DetectionType::Windows,
            platform: "psh".to_string(),
            config: serde_json::json!({"script": "Get-WinEvent", "max_retries": 2}),
            max_retries: 2,
            enqueued_at: Utc::now(),
        };
        let bytes = encode(&task).unwrap();
        let decoded: TaskEnvelope = decode(&bytes).unwrap();
        assert_eq!(decoded.task_id, task.task_id);
        assert_eq!(decoded.detection_type, DetectionType::Windows);
        assert_eq!(decoded.platform, "psh");
    }

    #[test]
    fn test_missing_config_is_malformed() {
        let json = serde_json::json!({
            "task_id": Uuid::new_v4(),
            "detection_execution_id": Uuid::new_v4(),
            "execution_id": Uuid::new_v4(),
            "operation_id": Uuid::new_v4(),
            "detection_type": "api",
            "platform": "siem",
            "max_retries": 3,
            "enqueued_at": "2025-03-14T09:00:00.000000Z"
        });
        let bytes = serde_json::to_vec(&json).unwrap();
        let result: crate::Result<TaskEnvelope> = decode(&bytes);
        assert!(matches!(result, Err(crate::Error::Malformed(_))));
    }
}
