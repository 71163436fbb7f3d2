//! Persistence seam for the engine's internal ledgers.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::fs;

use driftsync_common::{Error, Result};

/// Callback invoked when persisted data changed outside the process.
pub type ChangeListener = Box<dyn Fn() + Send + Sync>;

/// Durable storage for one internal ledger.
///
/// The engine treats persistence as a background durability concern:
/// load/save failures are reported through its error hook, never
/// raised to sync callers.
#[async_trait]
pub trait LedgerPersistence: Send + Sync {
    /// Load all persisted entries.
    async fn load(&self) -> Result<Vec<Value>>;

    /// Replace the persisted entries.
    async fn save(&self, items: &[Value]) -> Result<()>;

    /// Register a listener for out-of-band changes to the persisted
    /// data. Adapters without such a channel may ignore this.
    fn register(&self, _on_change: ChangeListener) {}
}

/// Factory producing one adapter per ledger id (e.g. `driftsync-changes`).
pub type PersistenceFactory = Arc<dyn Fn(&str) -> Arc<dyn LedgerPersistence> + Send + Sync>;

/// In-memory persistence adapter.
///
/// Useful for testing and for engines that do not need ledger
/// durability across restarts.
pub struct MemoryPersistence {
    items: RwLock<Vec<Value>>,
}

impl MemoryPersistence {
    /// Create a new empty adapter.
    pub fn new() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerPersistence for MemoryPersistence {
    async fn load(&self) -> Result<Vec<Value>> {
        Ok(self.items.read().unwrap().clone())
    }

    async fn save(&self, items: &[Value]) -> Result<()> {
        *self.items.write().unwrap() = items.to_vec();
        Ok(())
    }
}

/// JSON-file persistence adapter.
///
/// Stores the ledger as a pretty-printed JSON array. Missing file on
/// load means an empty ledger.
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    /// Create an adapter persisting to the given file path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Factory creating one file per ledger id under `dir`.
    pub fn factory(dir: impl AsRef<Path>) -> PersistenceFactory {
        let dir = dir.as_ref().to_path_buf();
        Arc::new(move |id: &str| {
            Arc::new(JsonFilePersistence::new(dir.join(format!("{id}.json"))))
                as Arc<dyn LedgerPersistence>
        })
    }
}

#[async_trait]
impl LedgerPersistence for JsonFilePersistence {
    async fn load(&self) -> Result<Vec<Value>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Persistence(format!("read {}: {e}", self.path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Persistence(format!("parse {}: {e}", self.path.display())))
    }

    async fn save(&self, items: &[Value]) -> Result<()> {
        let json = serde_json::to_string_pretty(items)
            .map_err(|e| Error::Persistence(e.to_string()))?;
        fs::write(&self.path, json)
            .await
            .map_err(|e| Error::Persistence(format!("write {}: {e}", self.path.display())))
    }
}
