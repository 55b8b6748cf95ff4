//! JSON documents as stored by a document server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, YieldError};

/// Field holding a document's identifier.
pub const ID_FIELD: &str = "_id";
/// Field holding a document's revision marker.
pub const REV_FIELD: &str = "_rev";

/// A JSON object with optional `_id` / `_rev` fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(YieldError::Validation(format!(
                "document must be a JSON object, got {}",
                other
            ))),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_FIELD).and_then(Value::as_str)
    }

    pub fn rev(&self) -> Option<&str> {
        self.0.get(REV_FIELD).and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Set a field, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Builder-style [`Document::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Document {
    type Error = YieldError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_and_rev() {
        let doc = Document::from_value(json!({"_id": "a", "_rev": "1-x", "n": 1})).unwrap();
        assert_eq!(doc.id(), Some("a"));
        assert_eq!(doc.rev(), Some("1-x"));
        assert_eq!(doc.get("n"), Some(&json!(1)));
    }

    #[test]
    fn test_missing_fields() {
        let doc = Document::new().with("shoesize", 11);
        assert_eq!(doc.id(), None);
        assert_eq!(doc.rev(), None);
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(matches!(
            Document::from_value(json!([1, 2])),
            Err(YieldError::Validation(_))
        ));
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let doc = Document::new().with("hat", "fitted");
        assert_eq!(serde_json::to_value(&doc).unwrap(), json!({"hat": "fitted"}));
    }
}
