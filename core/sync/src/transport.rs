//! Transport trait and wire types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use driftsync_common::{ItemId, Result};
use driftsync_store::Document;

/// Per-collection options handed to the transport on every call.
///
/// Carries the collection name plus arbitrary caller-defined metadata
/// (API paths, auth scopes, and so on).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Name of the collection, unique per engine.
    pub name: String,
    /// Caller-defined transport metadata.
    #[serde(flatten)]
    pub meta: Map<String, Value>,
}

impl CollectionConfig {
    /// Create a config with no extra metadata.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            meta: Map::new(),
        }
    }

    /// Set a metadata entry, returning self for chaining.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

/// The grouping of item-level deltas used on the wire and between the
/// reconciliation algorithm and the change ledger.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Changeset {
    /// Items absent before, present now.
    pub added: Vec<Document>,
    /// Items present in both whose content differs; carries the full
    /// new item, sufficient to replay as a `$set` update.
    pub modified: Vec<Document>,
    /// Ids of items present before, absent now.
    pub removed: Vec<ItemId>,
}

impl Changeset {
    /// True when no deltas are carried.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Total number of deltas.
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

/// What a `pull` (or a remote push notification) carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadResponse {
    /// A full item list replacing the baseline.
    Items(Vec<Document>),
    /// A partial changeset applied over the last baseline.
    Changes(Changeset),
}

/// Caller-supplied remote endpoint for one engine.
///
/// Implementations must be safe to call concurrently for different
/// collections; the engine serializes calls per collection name
/// (outside the documented `force` escape hatch).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the current remote state of a collection.
    async fn pull(&self, collection: &CollectionConfig) -> Result<LoadResponse>;

    /// Send local deltas upstream. The server is the arbiter of the
    /// merged result, observed on the next pull.
    async fn push(&self, collection: &CollectionConfig, changes: &Changeset) -> Result<()>;
}
