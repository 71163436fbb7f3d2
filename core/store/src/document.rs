//! Schemaless document model and change modifiers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use driftsync_common::ItemId;

/// A single item in a collection: a string id plus arbitrary JSON fields.
///
/// Serializes flat, as `{ "id": ..., ...fields }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier within the collection.
    pub id: ItemId,
    /// All remaining fields of the item.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    /// Create a document with no fields beyond the id.
    pub fn new(id: impl Into<ItemId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Create a document from an id and a field map.
    pub fn with_fields(id: impl Into<ItemId>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Set a field, returning self for chaining.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Get a field value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Serialize to a flat JSON object including the id.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::String(self.id.as_str().to_string()));
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }
}

/// A `$set`-style change modifier: the fields to overwrite on an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modifier {
    /// Field values to set. May include `id` (ignored unless it is a
    /// string, in which case the document is re-keyed).
    #[serde(rename = "$set")]
    pub set: Map<String, Value>,
}

impl Modifier {
    /// Create a modifier setting the given fields.
    pub fn set(fields: Map<String, Value>) -> Self {
        Self { set: fields }
    }

    /// Create a modifier setting a single field.
    pub fn set_field(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut set = Map::new();
        set.insert(name.into(), value.into());
        Self { set }
    }

    /// A modifier whose `$set` map is the full content of `doc`,
    /// sufficient to replay the document over any previous version.
    pub fn from_document(doc: &Document) -> Self {
        let mut set = Map::new();
        set.insert("id".to_string(), Value::String(doc.id.as_str().to_string()));
        for (k, v) in &doc.fields {
            set.insert(k.clone(), v.clone());
        }
        Self { set }
    }

    /// Apply the modifier to a document in place.
    pub fn apply(&self, doc: &mut Document) {
        for (name, value) in &self.set {
            if name == "id" {
                if let Value::String(id) = value {
                    doc.id = ItemId::from(id.as_str());
                }
            } else {
                doc.fields.insert(name.clone(), value.clone());
            }
        }
    }
}
