use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A keyed record shipped from an input to one or more outputs.
///
/// The mandatory fields are always present; everything else (user supplied
/// `add_field` values, `ora.*` attributes from the Oracle XML input, fields
/// carried over from `format = json` payloads) lives in `fields`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(rename = "@version")]
    pub version: u8,

    /// ISO 8601 UTC with millisecond precision and a trailing `Z`.
    #[serde(rename = "@timestamp")]
    pub timestamp: String,

    /// URI of the originating input, `file://<host><path>` for tailed files.
    pub source: String,

    pub host: String,

    pub file: String,

    /// The routing key that binds this event to outputs.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Ordered sequence of tags, may be empty.
    #[serde(default)]
    pub tags: Vec<String>,

    /// The payload: raw text for plain inputs, decoded text for XML inputs.
    pub line: String,

    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Event {
    /// Create a partially filled event as inputs produce them. The pipeline
    /// completes enrichment (timestamp, type, tags, add_field) before
    /// dispatch.
    pub fn from_line(host: &str, file: &str, line: String) -> Self {
        Self {
            version: 1,
            timestamp: String::new(),
            source: format!("file://{}{}", host, file),
            host: host.to_string(),
            file: file.to_string(),
            event_type: String::new(),
            tags: Vec::new(),
            line,
            fields: BTreeMap::new(),
        }
    }

    /// Build an event from a decoded JSON object, as received on the wire or
    /// parsed from a `format = json` input line. Known keys populate the
    /// mandatory fields, everything else is preserved in `fields`.
    pub fn from_json_map(mut map: serde_json::Map<String, Value>) -> Self {
        let take_str = |map: &mut serde_json::Map<String, Value>, key: &str| -> Option<String> {
            map.remove(key).and_then(|v| match v {
                Value::String(s) => Some(s),
                other => Some(other.to_string()),
            })
        };

        let tags = match map.remove("tags") {
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
            Some(Value::String(s)) => vec![s],
            _ => Vec::new(),
        };

        let mut event = Self {
            version: 1,
            timestamp: take_str(&mut map, "@timestamp").unwrap_or_default(),
            source: take_str(&mut map, "source").unwrap_or_default(),
            host: take_str(&mut map, "host").unwrap_or_default(),
            file: take_str(&mut map, "file").unwrap_or_default(),
            event_type: take_str(&mut map, "type").unwrap_or_default(),
            tags,
            line: take_str(&mut map, "line")
                .or_else(|| take_str(&mut map, "message"))
                .unwrap_or_default(),
            fields: BTreeMap::new(),
        };
        map.remove("@version");
        for (k, v) in map {
            event.fields.insert(k, v);
        }
        event
    }

    /// Serialize to a compact JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Flatten into string key/value pairs for the Lumberjack version 1
    /// data frame. Non-string extra fields are rendered as compact JSON.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(8 + self.fields.len());
        pairs.push(("@version".to_string(), self.version.to_string()));
        pairs.push(("@timestamp".to_string(), self.timestamp.clone()));
        pairs.push(("source".to_string(), self.source.clone()));
        pairs.push(("host".to_string(), self.host.clone()));
        pairs.push(("file".to_string(), self.file.clone()));
        pairs.push(("type".to_string(), self.event_type.clone()));
        pairs.push((
            "tags".to_string(),
            serde_json::to_string(&self.tags).unwrap_or_else(|_| "[]".to_string()),
        ));
        pairs.push(("line".to_string(), self.line.clone()));
        for (k, v) in &self.fields {
            let rendered = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            pairs.push((k.clone(), rendered));
        }
        pairs
    }

    /// Set an extra field, stringly typed.
    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), Value::String(value.into()));
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        match key {
            "line" => Some(&self.line),
            "host" => Some(&self.host),
            "file" => Some(&self.file),
            "source" => Some(&self.source),
            "type" => Some(&self.event_type),
            _ => self.fields.get(key).and_then(|v| v.as_str()),
        }
    }
}

/// Formats `@timestamp` values, caching the formatted string per integral
/// second. Events produced within the same second share one timestamp.
#[derive(Debug)]
pub struct TimestampCache {
    last_secs: i64,
    cached: String,
}

impl TimestampCache {
    pub fn new() -> Self {
        Self {
            last_secs: i64::MIN,
            cached: String::new(),
        }
    }

    /// The formatted timestamp for the current instant.
    pub fn now(&mut self) -> String {
        let now = Utc::now();
        if now.timestamp() != self.last_secs {
            self.last_secs = now.timestamp();
            self.cached = now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        }
        self.cached.clone()
    }

    /// Format an arbitrary epoch-milliseconds instant, bypassing the cache.
    pub fn format_millis(millis: i64) -> String {
        match Utc.timestamp_millis_opt(millis) {
            chrono::LocalResult::Single(dt) => {
                dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
            }
            _ => String::new(),
        }
    }
}

impl Default for TimestampCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_line_defaults() {
        let event = Event::from_line("db1", "/var/log/app.log", "hello".to_string());
        assert_eq!(event.version, 1);
        assert_eq!(event.source, "file://db1/var/log/app.log");
        assert_eq!(event.host, "db1");
        assert_eq!(event.file, "/var/log/app.log");
        assert_eq!(event.line, "hello");
        assert!(event.tags.is_empty());
        assert!(event.fields.is_empty());
    }

    #[test]
    fn test_serialize_field_names() {
        let mut event = Event::from_line("db1", "/f", "x".to_string());
        event.event_type = "app".to_string();
        event.timestamp = "2014-04-21T12:00:00.000Z".to_string();
        event.set_field("ora.level", "16");

        let json: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["@version"], 1);
        assert_eq!(json["@timestamp"], "2014-04-21T12:00:00.000Z");
        assert_eq!(json["type"], "app");
        assert_eq!(json["ora.level"], "16");
    }

    #[test]
    fn test_from_json_map_overrides() {
        let map = json!({
            "type": "web",
            "line": "GET /",
            "tags": ["edge", "frontend"],
            "status": 200,
        });
        let Value::Object(map) = map else { unreachable!() };
        let event = Event::from_json_map(map);
        assert_eq!(event.event_type, "web");
        assert_eq!(event.line, "GET /");
        assert_eq!(event.tags, vec!["edge", "frontend"]);
        assert_eq!(event.fields.get("status"), Some(&json!(200)));
    }

    #[test]
    fn test_pairs_include_extras() {
        let mut event = Event::from_line("h", "/f", "payload".to_string());
        event.fields.insert("count".to_string(), json!(3));
        let pairs = event.to_pairs();
        assert!(pairs.iter().any(|(k, v)| k == "line" && v == "payload"));
        assert!(pairs.iter().any(|(k, v)| k == "count" && v == "3"));
    }

    #[test]
    fn test_timestamp_format() {
        let formatted = TimestampCache::format_millis(1_398_081_600_123);
        assert_eq!(formatted, "2014-04-21T12:00:00.123Z");

        let mut cache = TimestampCache::new();
        let a = cache.now();
        let b = cache.now();
        assert_eq!(a, b);
        assert!(a.ends_with('Z'));
        assert_eq!(a.len(), "2014-04-21T12:00:00.123Z".len());
    }
}
