//! Persistent retry checkpoint schema.
//!
//! The server state is a single JSON document mapping webhook ids to
//! their suspended retry scalars. No queues are persisted; pending
//! events are recovered from the event repository by status.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One suspended retrying entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRetry {
    pub since_time: DateTime<Utc>,
    pub last_retry_time: DateTime<Utc>,
    #[serde(with = "duration_millis")]
    pub time_left: Duration,
    #[serde(with = "duration_millis")]
    pub backoff: Duration,
    pub attempt: u32,
}

/// The whole checkpoint, serialized as UTF-8 JSON and handed to the
/// state repository as an opaque blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentServerState {
    pub retrying_states: HashMap<String, PersistedRetry>,
}

/// Durations persist as integer milliseconds. Negative values never
/// serialize, but a hand-edited or clock-skewed blob may carry them;
/// deserialization clamps at zero.
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis.max(0) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut retrying_states = HashMap::new();
        retrying_states.insert(
            "w1".to_string(),
            PersistedRetry {
                since_time: "2026-08-01T10:00:00Z".parse().unwrap(),
                last_retry_time: "2026-08-01T10:00:04Z".parse().unwrap(),
                time_left: Duration::from_secs(30),
                backoff: Duration::from_secs(4),
                attempt: 2,
            },
        );
        let state = PersistentServerState { retrying_states };

        let blob = serde_json::to_vec(&state).unwrap();
        let parsed: PersistentServerState = serde_json::from_slice(&blob).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn field_names_are_camel_case() {
        let mut retrying_states = HashMap::new();
        retrying_states.insert(
            "w1".to_string(),
            PersistedRetry {
                since_time: Utc::now(),
                last_retry_time: Utc::now(),
                time_left: Duration::from_secs(1),
                backoff: Duration::from_secs(1),
                attempt: 0,
            },
        );
        let json = serde_json::to_string(&PersistentServerState { retrying_states }).unwrap();
        for field in ["retryingStates", "sinceTime", "lastRetryTime", "timeLeft", "backoff", "attempt"] {
            assert!(json.contains(field), "missing {field} in {json}");
        }
    }

    #[test]
    fn negative_durations_clamp_to_zero() {
        let json = r#"{"retryingStates":{"w1":{
            "sinceTime":"2026-08-01T10:00:00Z",
            "lastRetryTime":"2026-08-01T10:00:04Z",
            "timeLeft":-500,
            "backoff":-1,
            "attempt":3
        }}}"#;
        let parsed: PersistentServerState = serde_json::from_str(json).unwrap();
        let entry = &parsed.retrying_states["w1"];
        assert_eq!(entry.time_left, Duration::ZERO);
        assert_eq!(entry.backoff, Duration::ZERO);
        assert_eq!(entry.attempt, 3);
    }
}
