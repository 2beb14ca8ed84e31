//! Wire codec for broker message envelopes
//!
//! The four on-wire shapes (execution record, detection task, detection
//! response, dead-letter wrapper) live here, together with the only
//! functions in the crate allowed to touch raw broker bytes. Inbound
//! payloads tolerate unknown fields; outbound payloads are canonical JSON
//! with a single timestamp format.

mod execution;
mod response;
mod task;

pub use execution::{DetectionsMap, ExecutionRecord, ExecutionReport, OperationRef, ResultData};
pub use response::{Detected, Outcome, ResponseEnvelope};
pub use task::TaskEnvelope;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Decode one inbound payload. Any shape mismatch is `Malformed`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Malformed(e.to_string()))
}

/// Encode one outbound payload in canonical form.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Wrapper published to the dead-letter route for rejected messages.
/// Carries the original payload verbatim so operators can replay it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub reason: String,
    pub queue: String,
    pub payload: String,
}

impl DeadLetter {
    pub fn new(queue: impl Into<String>, reason: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            reason: reason.into(),
            queue: queue.into(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        }
    }
}

/// Canonical timestamp serde: RFC3339 UTC with exactly six fractional
/// digits on the way out, permissive RFC3339 on the way in.
pub(crate) mod canonical_time {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Stamped {
        #[serde(with = "canonical_time")]
        at: chrono::DateTime<Utc>,
    }

    #[test]
    fn test_canonical_time_has_six_fractional_digits() {
        let stamped = Stamped {
            at: Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap(),
        };
        let json = serde_json::to_string(&stamped).unwrap();
        assert_eq!(json, r#"{"at":"2025-03-14T09:26:53.000000Z"}"#);
    }

    #[test]
    fn test_canonical_time_accepts_offset_input() {
        let decoded: Stamped =
            serde_json::from_str(r#"{"at":"2025-03-14T10:26:53+01:00"}"#).unwrap();
        assert_eq!(
            decoded.at,
            Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap()
        );
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let result: crate::Result<ResponseEnvelope> = decode(b"not json at all");
        assert!(matches!(result, Err(crate::Error::Malformed(_))));
    }

    #[test]
    fn test_dead_letter_preserves_payload() {
        let dl = DeadLetter::new("instructions", "decode failure", b"{\"broken\":");
        assert_eq!(dl.queue, "instructions");
        assert_eq!(dl.payload, "{\"broken\":");
    }
}
