use std::collections::BTreeMap;
use std::hash::Hasher;

use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use fnv::FnvHasher;
use serde::Deserialize;
use serde::Serialize;

pub type Tags = BTreeMap<String, String>;
pub type Fields = BTreeMap<String, FieldValue>;

/// Represents a field value that can be carried by a metric
///
/// In serialized form unsigned integers are written as `{"uint": n}` so that
/// they read back as unsigned. Bare integers above `i64::MAX` are accepted as
/// unsigned too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SerdeValue", into = "SerdeValue")]
pub enum FieldValue {
    Integer(i64),
    UnsignedInteger(u64),
    Float(f64),
    Boolean(bool),
    String(String),
}

// variant order is the order untagged deserialization tries them in
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SerdeValue {
    Unsigned { uint: u64 },
    Integer(i64),
    LargeInteger(u64),
    Float(f64),
    Boolean(bool),
    String(String),
}

impl From<SerdeValue> for FieldValue {
    fn from(value: SerdeValue) -> Self {
        match value {
            SerdeValue::Unsigned { uint } | SerdeValue::LargeInteger(uint) => {
                FieldValue::UnsignedInteger(uint)
            }
            SerdeValue::Integer(i) => FieldValue::Integer(i),
            SerdeValue::Float(f) => FieldValue::Float(f),
            SerdeValue::Boolean(b) => FieldValue::Boolean(b),
            SerdeValue::String(s) => FieldValue::String(s),
        }
    }
}

impl From<FieldValue> for SerdeValue {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Integer(i) => SerdeValue::Integer(i),
            FieldValue::UnsignedInteger(uint) => SerdeValue::Unsigned { uint },
            FieldValue::Float(f) => SerdeValue::Float(f),
            FieldValue::Boolean(b) => SerdeValue::Boolean(b),
            FieldValue::String(s) => SerdeValue::String(s),
        }
    }
}

impl FieldValue {
    /// Numeric view of the value, `None` for strings and booleans.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::UnsignedInteger(u) => Some(*u as f64),
            FieldValue::Float(f) => Some(*f),
            FieldValue::Boolean(_) | FieldValue::String(_) => None,
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::UnsignedInteger(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

/// A named, tagged, timestamped set of typed fields.
///
/// Tags and fields are kept in sorted maps so that encoders produce
/// deterministic output and [`Metric::hash_id`] does not depend on
/// insertion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub tags: Tags,
    pub fields: Fields,
    /// Nanoseconds since the Unix epoch.
    #[serde(default = "current_time_nanos")]
    pub timestamp: i64,
}

impl Metric {
    pub fn new(name: impl Into<String>, tags: Tags, fields: Fields, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            tags,
            fields,
            timestamp,
        }
    }

    /// Creates an empty metric stamped with the current time.
    pub fn now(name: impl Into<String>) -> Self {
        Self::new(name, Tags::new(), Fields::new(), current_time_nanos())
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.timestamp)
    }

    /// FNV-1a hash over the name and the sorted tag set.
    ///
    /// Two metrics of the same series share an id regardless of their fields
    /// or timestamp, which is what aggregators key their state on.
    pub fn hash_id(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        hasher.write(self.name.as_bytes());
        hasher.write(b"\n");
        for (key, value) in &self.tags {
            hasher.write(key.as_bytes());
            hasher.write(b"\n");
            hasher.write(value.as_bytes());
            hasher.write(b"\n");
        }
        hasher.finish()
    }
}

pub fn current_time_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_field_value_from_str() {
        let value: FieldValue = "test".into();
        assert_eq!(value, FieldValue::String("test".to_string()));
    }

    #[test]
    fn test_field_value_from_numbers() {
        assert_eq!(FieldValue::from(42i64), FieldValue::Integer(42));
        assert_eq!(FieldValue::from(42u64), FieldValue::UnsignedInteger(42));
        assert_eq!(FieldValue::from(42.5f64), FieldValue::Float(42.5));
        assert_eq!(FieldValue::from(true), FieldValue::Boolean(true));
    }

    #[test]
    fn test_as_f64_ignores_non_numeric() {
        assert_eq!(FieldValue::Integer(-3).as_f64(), Some(-3.0));
        assert_eq!(FieldValue::UnsignedInteger(7).as_f64(), Some(7.0));
        assert_eq!(FieldValue::Boolean(true).as_f64(), None);
        assert_eq!(FieldValue::String("1".into()).as_f64(), None);
    }

    #[test]
    fn test_hash_id_ignores_fields_and_time() {
        let a = Metric::now("cpu")
            .with_tag("host", "a")
            .with_field("usage", 1.0);
        let b = Metric::now("cpu")
            .with_tag("host", "a")
            .with_field("idle", 99i64)
            .with_timestamp(0);
        assert_eq!(a.hash_id(), b.hash_id());
    }

    #[test]
    fn test_hash_id_depends_on_tags_and_name() {
        let base = Metric::now("cpu").with_tag("host", "a");
        assert_ne!(base.hash_id(), base.clone().with_tag("core", "0").hash_id());
        assert_ne!(base.hash_id(), Metric::now("mem").with_tag("host", "a").hash_id());
        // key/value boundaries must not collapse
        assert_ne!(
            Metric::now("m").with_tag("ab", "c").hash_id(),
            Metric::now("m").with_tag("a", "bc").hash_id()
        );
    }

    #[test]
    fn test_hash_id_is_stable() {
        // FNV-1a 64 of "cpu\n"
        let mut hasher = FnvHasher::default();
        hasher.write(b"cpu\n");
        assert_eq!(Metric::now("cpu").hash_id(), hasher.finish());
    }

    #[test]
    fn test_time_roundtrips_nanos() {
        let metric = Metric::now("t").with_timestamp(1_609_459_200_000_000_123);
        assert_eq!(metric.time().timestamp_nanos_opt(), Some(1_609_459_200_000_000_123));
    }
}
