//! Detection planner
//!
//! Pure derivation of detection tasks from one execution record. No I/O;
//! replaying the same record always yields the same plan in the same order.

use crate::codec::ExecutionRecord;
use crate::store::DetectionType;

/// One planned detection attempt, not yet persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDetection {
    pub detection_type: DetectionType,
    pub detection_platform: String,
    pub detection_config: serde_json::Value,
    pub max_retries: u32,
}

/// Derive the detection tasks requested by one execution record.
///
/// The record's `detections` map is `{type: {platform: config}}`; a config
/// object may carry its own `max_retries`, otherwise `default_max_retries`
/// applies. Output is ordered lexicographically by (type, platform).
pub fn plan(record: &ExecutionRecord, default_max_retries: u32) -> Vec<PlannedDetection> {
    let mut tasks: Vec<PlannedDetection> = record
        .detections
        .iter()
        .flat_map(|(detection_type, platforms)| {
            platforms.iter().map(|(platform, config)| {
                let max_retries = config
                    .get("max_retries")
                    .and_then(serde_json::Value::as_u64)
                    .map_or(default_max_retries, |v| v as u32);
                PlannedDetection {
                    detection_type: *detection_type,
                    detection_platform: platform.clone(),
                    detection_config: config.clone(),
                    max_retries,
                }
            })
        })
        .collect();

    tasks.sort_by(|a, b| {
        (a.detection_type.as_str(), a.detection_platform.as_str())
            .cmp(&(b.detection_type.as_str(), b.detection_platform.as_str()))
    });
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode;

    fn record_with_detections(detections: serde_json::Value) -> ExecutionRecord {
        let json = serde_json::json!({
            "operation": {
                "id": "7f9c3be2-63c1-4b5a-9c40-12f3a85cda01",
                "name": "nightly",
                "started_at": "2025-03-14T09:00:00.000000Z"
            },
            "execution": {
                "link_id": "2d1f2a04-8b10-4a7f-8d34-5b9c01e7aa22",
                "agent_host": "ws-042",
                "agent_paw": "kxqwpz",
                "command": "whoami",
                "pid": 4120,
                "status": 0,
                "result_data": {"stdout": "", "stderr": "", "exit_code": 0},
                "agent_reported_at": "2025-03-14T09:01:12.000000Z",
                "link_state": "SUCCESS"
            },
            "detections": detections
        });
        decode(&serde_json::to_vec(&json).unwrap()).unwrap()
    }

    #[test]
    fn test_empty_detections_empty_plan() {
        let record = record_with_detections(serde_json::json!({}));
        assert!(plan(&record, 3).is_empty());
    }

    #[test]
    fn test_plan_orders_by_type_then_platform() {
        let record = record_with_detections(serde_json::json!({
            "windows": {"psh": {"script": "a"}, "cmd": {"script": "b"}},
            "api": {"siem": {"query": "q"}, "edr": {"query": "e"}},
            "linux": {"sh": {"script": "c"}}
        }));
        let tasks = plan(&record, 3);
        let keys: Vec<(&str, &str)> = tasks
            .iter()
            .map(|t| (t.detection_type.as_str(), t.detection_platform.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("api", "edr"),
                ("api", "siem"),
                ("linux", "sh"),
                ("windows", "cmd"),
                ("windows", "psh"),
            ]
        );
    }

    #[test]
    fn test_plan_is_deterministic_across_replays() {
        let record = record_with_detections(serde_json::json!({
            "api": {"siem": {"query": "q"}},
            "darwin": {"sh": {"script": "s"}}
        }));
        assert_eq!(plan(&record, 3), plan(&record, 3));
    }

    #[test]
    fn test_max_retries_from_config_else_default() {
        let record = record_with_detections(serde_json::json!({
            "api": {
                "siem": {"query": "q", "max_retries": 1},
                "edr": {"query": "e"}
            }
        }));
        let tasks = plan(&record, 4);
        assert_eq!(tasks[0].detection_platform, "edr");
        assert_eq!(tasks[0].max_retries, 4);
        assert_eq!(tasks[1].detection_platform, "siem");
        assert_eq!(tasks[1].max_retries, 1);
    }

    #[test]
    fn test_config_is_copied_verbatim() {
        let config = serde_json::json!({"query": "host=ws-042", "window": 300});
        let record = record_with_detections(serde_json::json!({"api": {"siem": config.clone()}}));
        let tasks = plan(&record, 3);
        assert_eq!(tasks[0].detection_config, config);
    }
}
