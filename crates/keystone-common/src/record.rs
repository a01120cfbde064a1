//! Record and value model.
//!
//! Records are self-describing maps from field name to [`Value`], stored as
//! one JSON object per line in the data log. A record's location in the log
//! is its byte offset, the [`Position`] every index structure stores next to
//! a key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Byte offset of a record in the data log.
pub type Position = u64;

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
}

impl Value {
    /// Returns the integer payload, if this value is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// A stored record: an ordered map of field name to value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field insertion.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let record = Record::new()
            .with("id", 7i64)
            .with("name", "ada")
            .with("score", 9.5);

        assert_eq!(record.len(), 3);
        assert_eq!(record.get("id").and_then(Value::as_int), Some(7));
        assert_eq!(record.get("name").and_then(Value::as_str), Some("ada"));
        assert_eq!(record.get("score").and_then(Value::as_float), Some(9.5));
        assert!(record.get("missing").is_none());
    }

    #[test]
    fn test_value_coercions() {
        assert_eq!(Value::Int(3).as_float(), Some(3.0));
        assert_eq!(Value::Str("x".to_string()).as_int(), None);
        assert_eq!(Value::Null.as_str(), None);
    }

    #[test]
    fn test_record_json_roundtrip() {
        let record = Record::new()
            .with("id", 42i64)
            .with("tags", Value::Array(vec![Value::from("a"), Value::from("b")]))
            .with("active", true)
            .with("note", Value::Null);

        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'));
        let back: Record = serde_json::from_str(&line).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn test_record_serializes_as_plain_object() {
        let record = Record::new().with("id", 1i64);
        let line = serde_json::to_string(&record).unwrap();
        assert_eq!(line, r#"{"id":1}"#);
    }

    #[test]
    fn test_record_accepts_plain_json_object() {
        let record: Record =
            serde_json::from_str(r#"{"id": 5, "name": "keystone", "pi": 3.5}"#).unwrap();
        assert_eq!(record.get("id").and_then(Value::as_int), Some(5));
        assert_eq!(record.get("pi").and_then(Value::as_float), Some(3.5));
    }
}
