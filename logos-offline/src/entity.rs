//! Opaque records stored in collections.
//!
//! An `Entity` carries a mandatory string identifier plus any number of
//! JSON fields. The store never interprets fields beyond the identifier and
//! the attributes named by a collection's declared indexes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::StoreError;

/// A stored record: `{"id": "...", ...fields}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique within its collection
    pub id: String,
    /// Every other field
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    /// Create an entity with no fields besides its identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    ///
    /// `"id"` replaces the identifier instead of becoming a field; a
    /// non-string value is rendered as JSON text.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let field = field.into();
        let value = value.into();
        if field == "id" {
            self.id = match value {
                Value::String(id) => id,
                other => other.to_string(),
            };
        } else {
            self.fields.insert(field, value);
        }
        self
    }

    /// Convert a JSON object into an entity.
    ///
    /// Fails when the value is not an object or `id` is missing, empty or
    /// not a string.
    pub fn from_value(value: Value) -> Result<Self, StoreError> {
        let mut fields = match value {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::InvalidEntity(format!(
                    "expected a JSON object, got {other}"
                )))
            }
        };
        let id = match fields.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(other) => {
                return Err(StoreError::InvalidEntity(format!(
                    "`id` must be a non-empty string, got {other}"
                )))
            }
            None => return Err(StoreError::InvalidEntity("missing `id`".into())),
        };
        Ok(Self { id, fields })
    }

    /// Field lookup. `"id"` resolves to the identifier.
    pub fn get(&self, field: &str) -> Option<Value> {
        if field == "id" {
            return Some(Value::String(self.id.clone()));
        }
        self.fields.get(field).cloned()
    }

    /// String field lookup, used by text indexes.
    pub fn text(&self, field: &str) -> Option<&str> {
        if field == "id" {
            return Some(&self.id);
        }
        self.fields.get(field).and_then(Value::as_str)
    }

    /// JSON object form, identifier included.
    pub fn into_value(self) -> Value {
        let mut map = self.fields;
        map.insert("id".into(), Value::String(self.id));
        Value::Object(map)
    }
}
