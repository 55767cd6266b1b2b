use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slowscope_ingest_core::LogEvent;

/// Statistics for one (driver, query shape, full-scan) group of slow queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryShapeRollup {
    pub driver: String,
    pub hash: String,
    pub is_collscan: bool,
    pub count: u64,
    pub total_bytes_read: i64,
    pub total_bytes_written: i64,
    pub total_duration_millis: i64,
    pub total_num_yields: i64,
    pub max_bytes_read: i64,
    pub max_written: i64,
    pub max_duration_millis: i64,
    pub max_num_yields: i64,
    pub avg_bytes_read: f64,
    pub avg_written: f64,
    pub avg_duration_millis: f64,
    pub avg_num_yields: f64,
    /// Representative member of the group; stable for a given input but not
    /// necessarily the slowest.
    #[serde(with = "event_document")]
    pub query_example: LogEvent,
}

/// The slowest event of a query shape, attributed to the rollup's driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowQueryRecord {
    pub driver: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedShape {
    /// 1-based position by total duration.
    pub rank: usize,
    pub rollup: QueryShapeRollup,
    pub slowest: SlowQueryRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryTransition {
    pub host: String,
    pub t: DateTime<Utc>,
}

/// Output of one analysis pass over a namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisOutcome {
    pub ranked: Vec<RankedShape>,
    pub transitions: Vec<PrimaryTransition>,
}

/// Stored documents travel as JSON text in the rollup table; accept either
/// text or an inline object when reading.
pub(crate) mod event_document {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;
    use slowscope_ingest_core::LogEvent;

    pub fn serialize<S>(event: &LogEvent, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let text = serde_json::to_string(event).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<LogEvent, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::String(text) => serde_json::from_str(&text).map_err(D::Error::custom),
            value => serde_json::from_value(value).map_err(D::Error::custom),
        }
    }
}
