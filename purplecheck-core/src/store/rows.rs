//! Row structs and domain enums for the four durable entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a detection runs. Variants are declared in lexicographic order so
/// the derived `Ord` matches the planner's required output ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionType {
    Api,
    Darwin,
    Linux,
    Windows,
}

impl DetectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionType::Api => "api",
            DetectionType::Darwin => "darwin",
            DetectionType::Linux => "linux",
            DetectionType::Windows => "windows",
        }
    }

    /// Host-agent detections share one task queue; api detections get their own.
    pub fn is_agent(&self) -> bool {
        !matches!(self, DetectionType::Api)
    }
}

impl std::fmt::Display for DetectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DetectionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "api" => Ok(DetectionType::Api),
            "darwin" => Ok(DetectionType::Darwin),
            "linux" => Ok(DetectionType::Linux),
            "windows" => Ok(DetectionType::Windows),
            _ => Err(format!("Unknown detection type: {}", s)),
        }
    }
}

/// Detection execution lifecycle. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl DetectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionStatus::Pending => "pending",
            DetectionStatus::Running => "running",
            DetectionStatus::Completed => "completed",
            DetectionStatus::Failed => "failed",
            DetectionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DetectionStatus::Completed | DetectionStatus::Failed | DetectionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for DetectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DetectionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DetectionStatus::Pending),
            "running" => Ok(DetectionStatus::Running),
            "completed" => Ok(DetectionStatus::Completed),
            "failed" => Ok(DetectionStatus::Failed),
            "cancelled" => Ok(DetectionStatus::Cancelled),
            _ => Err(format!("Unknown detection status: {}", s)),
        }
    }
}

/// One emulation campaign, created on first sighting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRow {
    pub id: Uuid,
    pub external_id: Uuid,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One command result from one agent, immutable after creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub operation_external_id: Uuid,
    pub agent_host: String,
    pub agent_paw: String,
    pub link_id: Uuid,
    pub command: String,
    pub pid: i64,
    pub status: i64,
    pub result_data: serde_json::Value,
    pub agent_reported_at: DateTime<Utc>,
    pub link_state: String,
    pub raw_message: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One planned detection attempt with its retry budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionExecutionRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub operation_external_id: Uuid,
    pub detection_type: DetectionType,
    pub detection_platform: String,
    pub detection_config: serde_json::Value,
    pub status: DetectionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub execution_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One worker observation, append-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResultRow {
    pub id: Uuid,
    pub detection_execution_id: Uuid,
    pub detected: Option<bool>,
    pub raw_response: serde_json::Value,
    pub parsed_results: serde_json::Value,
    pub result_timestamp: DateTime<Utc>,
    pub result_source: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_type_round_trip() {
        for (s, ty) in [
            ("api", DetectionType::Api),
            ("windows", DetectionType::Windows),
            ("linux", DetectionType::Linux),
            ("darwin", DetectionType::Darwin),
        ] {
            assert_eq!(s.parse::<DetectionType>().unwrap(), ty);
            assert_eq!(ty.as_str(), s);
        }
        assert!("solaris".parse::<DetectionType>().is_err());
    }

    #[test]
    fn test_detection_type_ord_is_lexicographic() {
        let mut types = vec![
            DetectionType::Windows,
            DetectionType::Api,
            DetectionType::Linux,
            DetectionType::Darwin,
        ];
        types.sort();
        let strings: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        let mut sorted = strings.clone();
        sorted.sort_unstable();
        assert_eq!(strings, sorted);
    }

    #[test]
    fn test_routing_split() {
        assert!(!DetectionType::Api.is_agent());
        assert!(DetectionType::Windows.is_agent());
        assert!(DetectionType::Linux.is_agent());
        assert!(DetectionType::Darwin.is_agent());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!DetectionStatus::Pending.is_terminal());
        assert!(!DetectionStatus::Running.is_terminal());
        assert!(DetectionStatus::Completed.is_terminal());
        assert!(DetectionStatus::Failed.is_terminal());
        assert!(DetectionStatus::Cancelled.is_terminal());
    }
}
