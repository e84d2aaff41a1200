// src/types/date.rs

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

/// A UTC timestamp in the ISO-8601 millisecond form Parse uses on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDate {
    pub iso: String,
}

impl ParseDate {
    pub fn new(iso_string: String) -> Self {
        ParseDate { iso: iso_string }
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(datetime: DateTime<Utc>) -> Self {
        ParseDate {
            iso: datetime.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn iso(&self) -> &str {
        &self.iso
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.iso)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// `{"__type": "Date", "iso": ...}`
    pub fn to_value(&self) -> Value {
        json!({ "__type": "Date", "iso": self.iso })
    }

    /// Accepts either the encoded `{"__type": "Date"}` form or a bare ISO string.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(ParseDate::new(s.clone())),
            Value::Object(obj) if obj.get("__type").and_then(Value::as_str) == Some("Date") => obj
                .get("iso")
                .and_then(Value::as_str)
                .map(|s| ParseDate::new(s.to_string())),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for ParseDate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(ParseDate { iso: s })
    }
}

impl Serialize for ParseDate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.iso)
    }
}
