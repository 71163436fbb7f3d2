//! In-memory collection for testing.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use driftsync_common::{ItemId, Result};

use crate::collection::{CollectionEvent, LocalCollection};
use crate::document::{Document, Modifier};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// In-memory live collection.
///
/// Useful for testing and development. Items are kept in insertion
/// order; all data is lost on drop.
pub struct MemoryCollection {
    items: Arc<RwLock<Vec<Document>>>,
    events: broadcast::Sender<CollectionEvent>,
}

impl MemoryCollection {
    /// Create a new empty collection.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            items: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    /// Current number of items.
    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    /// Check if the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.items.read().unwrap().is_empty()
    }

    /// Find an item by id.
    pub fn find_one(&self, id: &ItemId) -> Option<Document> {
        self.items
            .read()
            .unwrap()
            .iter()
            .find(|d| &d.id == id)
            .cloned()
    }

    fn emit(&self, event: CollectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for MemoryCollection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalCollection for MemoryCollection {
    async fn fetch(&self) -> Result<Vec<Document>> {
        Ok(self.items.read().unwrap().clone())
    }

    async fn insert(&self, doc: Document) -> Result<()> {
        {
            let mut items = self.items.write().unwrap();
            if let Some(existing) = items.iter_mut().find(|d| d.id == doc.id) {
                *existing = doc.clone();
            } else {
                items.push(doc.clone());
            }
        }
        self.emit(CollectionEvent::Added(doc));
        Ok(())
    }

    async fn update_one(&self, id: &ItemId, modifier: &Modifier) -> Result<()> {
        let updated = {
            let mut items = self.items.write().unwrap();
            match items.iter_mut().find(|d| &d.id == id) {
                Some(doc) => {
                    modifier.apply(doc);
                    true
                }
                None => false,
            }
        };
        if updated {
            self.emit(CollectionEvent::Changed {
                id: id.clone(),
                modifier: modifier.clone(),
            });
        }
        Ok(())
    }

    async fn remove_one(&self, id: &ItemId) -> Result<()> {
        let removed = {
            let mut items = self.items.write().unwrap();
            let before = items.len();
            items.retain(|d| &d.id != id);
            items.len() != before
        };
        if removed {
            self.emit(CollectionEvent::Removed(id.clone()));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CollectionEvent> {
        self.events.subscribe()
    }
}
