//! driftsync collection surface.
//!
//! This crate defines the collaborator contracts the sync engine
//! consumes, including:
//! - A schemaless JSON document model with `$set`-style modifiers
//! - The `LocalCollection` trait for reactive, queryable item stores
//! - An in-memory reference collection for testing and development
//! - The `LedgerPersistence` seam used by the engine's internal ledgers

pub mod collection;
pub mod document;
pub mod memory;
pub mod persistence;

// Re-export main types
pub use collection::{CollectionEvent, LocalCollection};
pub use document::{Document, Modifier};
pub use memory::MemoryCollection;
pub use persistence::{
    JsonFilePersistence, LedgerPersistence, MemoryPersistence, PersistenceFactory,
};
