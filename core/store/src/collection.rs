//! Live collection trait definition.

use async_trait::async_trait;
use tokio::sync::broadcast;

use driftsync_common::{ItemId, Result};

use crate::document::{Document, Modifier};

/// A mutation observed on a live collection.
#[derive(Debug, Clone)]
pub enum CollectionEvent {
    /// An item was inserted.
    Added(Document),
    /// An item was updated with a modifier.
    Changed {
        /// Id of the updated item.
        id: ItemId,
        /// The modifier that was applied.
        modifier: Modifier,
    },
    /// An item was removed.
    Removed(ItemId),
}

/// The reactive, queryable store of items the engine keeps synchronized.
///
/// The engine only requires this minimal capability set: mutation
/// primitives, a fetch, and change-notification events. Events must be
/// emitted in mutation order, after the mutation is visible.
///
/// Implementations are owned by the caller; the engine mutates them
/// only during reconciliation.
#[async_trait]
pub trait LocalCollection: Send + Sync {
    /// Fetch all items, in insertion order.
    async fn fetch(&self) -> Result<Vec<Document>>;

    /// Insert an item. Upserts if the id already exists.
    ///
    /// # Postconditions
    /// - Emits `CollectionEvent::Added` with the inserted document
    async fn insert(&self, doc: Document) -> Result<()>;

    /// Apply a modifier to the item with the given id.
    ///
    /// No-op if the id is absent. Emits `CollectionEvent::Changed`
    /// when an item was modified.
    async fn update_one(&self, id: &ItemId, modifier: &Modifier) -> Result<()>;

    /// Remove the item with the given id.
    ///
    /// Removing a non-existent item is not an error. Emits
    /// `CollectionEvent::Removed` when an item was removed.
    async fn remove_one(&self, id: &ItemId) -> Result<()>;

    /// Subscribe to change-notification events.
    fn subscribe(&self) -> broadcast::Receiver<CollectionEvent>;
}
