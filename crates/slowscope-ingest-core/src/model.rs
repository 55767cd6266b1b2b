use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of log line worth keeping. Declaration order is classification
/// priority and end-of-stream flush order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventCategory {
    PrimaryTransition,
    SlowQuery,
    ClientMetadata,
}

impl EventCategory {
    pub const ALL: [EventCategory; 3] = [
        EventCategory::PrimaryTransition,
        EventCategory::SlowQuery,
        EventCategory::ClientMetadata,
    ];

    /// Literal text whose presence in a raw line selects this category.
    pub fn marker(self) -> &'static str {
        match self {
            Self::PrimaryTransition => "Transition to primary complete",
            Self::SlowQuery => "Slow query",
            Self::ClientMetadata => "\"msg\":\"client metadata\"",
        }
    }

    /// Store collection holding events of this category.
    pub fn collection(self) -> &'static str {
        match self {
            Self::PrimaryTransition => "primaryChangeEvents",
            Self::SlowQuery => "slowQueries",
            Self::ClientMetadata => "clientMetadata",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrimaryTransition => "primary_transition",
            Self::SlowQuery => "slow_query",
            Self::ClientMetadata => "client_metadata",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::PrimaryTransition => 0,
            Self::SlowQuery => 1,
            Self::ClientMetadata => 2,
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified log line, tagged with the host it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(with = "mongo_date")]
    pub t: DateTime<Utc>,
    pub s: String,
    pub c: String,
    pub id: i64,
    pub ctx: String,
    pub msg: String,
    #[serde(default)]
    pub attr: Map<String, Value>,
    pub host: String,
    pub ctxhost: String,
    pub category: EventCategory,
}

/// Structured shape of a server log line before it is tagged.
#[derive(Debug, Deserialize)]
pub(crate) struct RawLogLine {
    #[serde(with = "mongo_date")]
    pub(crate) t: DateTime<Utc>,
    #[serde(default)]
    pub(crate) s: String,
    #[serde(default)]
    pub(crate) c: String,
    #[serde(default)]
    pub(crate) id: i64,
    #[serde(default)]
    pub(crate) ctx: String,
    #[serde(default)]
    pub(crate) msg: String,
    #[serde(default)]
    pub(crate) attr: Map<String, Value>,
}

impl LogEvent {
    pub(crate) fn from_raw(category: EventCategory, raw: RawLogLine, host: &str) -> Self {
        let ctxhost = context_host(&raw.ctx, host);
        Self {
            t: raw.t,
            s: raw.s,
            c: raw.c,
            id: raw.id,
            ctx: raw.ctx,
            msg: raw.msg,
            attr: raw.attr,
            host: host.to_string(),
            ctxhost,
            category,
        }
    }

    /// Walks nested `attr` objects, e.g. `["storage", "data", "bytesRead"]`.
    pub fn attr_path(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.attr.get(*first)?;
        for key in rest {
            current = current.as_object()?.get(*key)?;
        }
        Some(current)
    }

    /// Numeric attribute, 0 when absent or not a number.
    pub fn attr_i64(&self, path: &[&str]) -> i64 {
        match self.attr_path(path) {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// String attribute, empty when absent or not a string.
    pub fn attr_str(&self, path: &[&str]) -> &str {
        self.attr_path(path).and_then(Value::as_str).unwrap_or("")
    }
}

pub fn context_host(ctx: &str, host: &str) -> String {
    format!("{ctx}_{host}")
}

/// Parses an RFC3339 timestamp of any sub-second precision and truncates it
/// to whole milliseconds.
pub fn parse_log_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let parsed = DateTime::parse_from_rfc3339(raw)?;
    Ok(parsed.with_timezone(&Utc).trunc_subsecs(3))
}

/// Extended-JSON date wrapper used by server logs: `{"$date": "<rfc3339>"}`.
pub(crate) mod mongo_date {
    use super::parse_log_timestamp;
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize)]
    struct DateOut {
        #[serde(rename = "$date")]
        date: String,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DateValue {
        Text(String),
        Millis(i64),
    }

    #[derive(Deserialize)]
    struct DateIn {
        #[serde(rename = "$date")]
        date: DateValue,
    }

    pub(crate) fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        DateOut {
            date: value.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
        .serialize(serializer)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        match DateIn::deserialize(deserializer)?.date {
            DateValue::Text(raw) => parse_log_timestamp(&raw)
                .map_err(|err| D::Error::custom(format!("invalid $date `{raw}`: {err}"))),
            DateValue::Millis(ms) => DateTime::<Utc>::from_timestamp_millis(ms)
                .ok_or_else(|| D::Error::custom(format!("$date millis out of range: {ms}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nanosecond_timestamp_truncates_to_millis() {
        let parsed = parse_log_timestamp("2024-01-02T03:04:05.123456789Z").expect("valid");
        let expected = parse_log_timestamp("2024-01-02T03:04:05.123Z").expect("valid");
        assert_eq!(parsed, expected);
        assert_eq!(parsed.timestamp_millis() % 1000, 123);
    }

    #[test]
    fn offset_timestamp_normalizes_to_utc() {
        let parsed = parse_log_timestamp("2024-01-02T05:04:05.999+02:00").expect("valid");
        assert_eq!(
            parsed.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "2024-01-02T03:04:05.999Z"
        );
    }

    #[test]
    fn event_round_trips_through_document_form() {
        let raw: RawLogLine = serde_json::from_value(json!({
            "t": {"$date": "2024-01-02T03:04:05.123456+00:00"},
            "s": "I",
            "c": "COMMAND",
            "id": 51803,
            "ctx": "conn42",
            "msg": "Slow query",
            "attr": {"durationMillis": 120, "storage": {"data": {"bytesRead": 4096}}}
        }))
        .expect("raw line");
        let event = LogEvent::from_raw(EventCategory::SlowQuery, raw, "shard-00:27017");

        let doc = serde_json::to_value(&event).expect("serialize");
        assert_eq!(doc["t"]["$date"], "2024-01-02T03:04:05.123Z");
        assert_eq!(doc["ctxhost"], "conn42_shard-00:27017");
        assert_eq!(doc["category"], "slowQuery");

        let back: LogEvent = serde_json::from_value(doc).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn attr_helpers_walk_nested_values() {
        let raw: RawLogLine = serde_json::from_value(json!({
            "t": {"$date": "2024-01-02T03:04:05Z"},
            "attr": {
                "planSummary": "COLLSCAN",
                "durationMillis": 12.0,
                "storage": {"data": {"bytesRead": 4096}}
            }
        }))
        .expect("raw line");
        let event = LogEvent::from_raw(EventCategory::SlowQuery, raw, "h");

        assert_eq!(event.attr_i64(&["storage", "data", "bytesRead"]), 4096);
        assert_eq!(event.attr_i64(&["durationMillis"]), 12);
        assert_eq!(event.attr_i64(&["numYields"]), 0);
        assert_eq!(event.attr_str(&["planSummary"]), "COLLSCAN");
        assert_eq!(event.attr_str(&["storage", "data"]), "");
    }

    #[test]
    fn category_order_is_priority_order() {
        let mut sorted = EventCategory::ALL;
        sorted.sort();
        assert_eq!(sorted, EventCategory::ALL);
        assert_eq!(EventCategory::SlowQuery.collection(), "slowQueries");
    }
}
