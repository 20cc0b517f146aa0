//! JSON documents identified by a string primary key.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the primary key field.
pub const ID_FIELD: &str = "_id";

/// Generates a fresh primary key (UUID v4, 36 characters).
pub fn new_document_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A store document: a JSON object keyed by field name.
///
/// Identity is the `_id` field. Two documents are equal when every field
/// is deeply equal, which is what the diff uses to decide whether a
/// document changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the primary key, if present and a string.
    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_FIELD).and_then(Value::as_str)
    }

    /// Returns the primary key or an error naming the document.
    pub fn require_id(&self) -> StoreResult<&str> {
        self.id()
            .ok_or_else(|| StoreError::invalid_document("document has no string _id"))
    }

    /// Sets the primary key.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert(ID_FIELD.to_string(), Value::String(id.into()));
    }

    /// Assigns a fresh primary key when none is present and returns it.
    pub fn ensure_id(&mut self) -> StoreResult<String> {
        match self.0.get(ID_FIELD) {
            None | Some(Value::Null) => {
                let id = new_document_id();
                self.set_id(id.clone());
                Ok(id)
            }
            Some(Value::String(id)) => Ok(id.clone()),
            Some(other) => Err(StoreError::invalid_document(format!(
                "_id must be a string, got {other}"
            ))),
        }
    }

    /// Returns the value of a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Sets a field, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    /// Removes a field, returning its value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Returns the underlying field map.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Returns a copy restricted to the given fields (plus `_id`).
    #[must_use]
    pub fn project(&self, fields: &[String]) -> Self {
        let projected = self
            .0
            .iter()
            .filter(|(name, _)| name.as_str() == ID_FIELD || fields.iter().any(|f| f == *name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Self(projected)
    }

    /// Converts into a JSON value.
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
    type Error = StoreError;

    fn try_from(value: Value) -> StoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(StoreError::invalid_document(format!(
                "expected an object, got {other}"
            ))),
        }
    }
}
