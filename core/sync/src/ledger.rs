//! Shared backing for the engine's internal ledgers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use driftsync_common::{Error, Result};
use driftsync_store::LedgerPersistence;

use crate::engine::ErrorHook;

/// An in-memory entry list that persists itself after every mutation.
///
/// Persistence is a background durability concern: load/save failures
/// are routed to the error hook and never surface to callers. After
/// `dispose`, every operation fails with `Error::Disposed`.
pub(crate) struct Ledger<T> {
    name: String,
    entries: Arc<RwLock<Vec<T>>>,
    persistence: Arc<dyn LedgerPersistence>,
    on_error: ErrorHook,
    disposed: AtomicBool,
}

impl<T> Ledger<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open a ledger, loading any persisted entries and registering
    /// for out-of-band reloads.
    pub async fn open(
        name: impl Into<String>,
        persistence: Arc<dyn LedgerPersistence>,
        on_error: ErrorHook,
    ) -> Self {
        let name = name.into();
        let initial = match persistence.load().await {
            Ok(values) => match Self::parse(&name, values) {
                Ok(entries) => entries,
                Err(err) => {
                    on_error(None, &err);
                    Vec::new()
                }
            },
            Err(err) => {
                warn!("Failed to load ledger {}: {}", name, err);
                on_error(None, &err);
                Vec::new()
            }
        };

        let entries = Arc::new(RwLock::new(initial));

        // Reload when the underlying storage changed outside this process
        let weak = Arc::downgrade(&entries);
        let reload_persistence = persistence.clone();
        let reload_hook = on_error.clone();
        let reload_name = name.clone();
        persistence.register(Box::new(move || {
            let Some(entries) = weak.upgrade() else {
                return;
            };
            let persistence = reload_persistence.clone();
            let hook = reload_hook.clone();
            let name = reload_name.clone();
            tokio::spawn(async move {
                match persistence.load().await {
                    Ok(values) => match Self::parse(&name, values) {
                        Ok(loaded) => {
                            debug!("Reloaded ledger {} ({} entries)", name, loaded.len());
                            *entries.write().await = loaded;
                        }
                        Err(err) => hook(None, &err),
                    },
                    Err(err) => hook(None, &err),
                }
            });
        }));

        Self {
            name,
            entries,
            persistence,
            on_error,
            disposed: AtomicBool::new(false),
        }
    }

    fn parse(name: &str, values: Vec<serde_json::Value>) -> Result<Vec<T>> {
        values
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<T>, _>>()
            .map_err(|e| Error::Persistence(format!("{name}: {e}")))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    /// Run a closure over the current entries.
    pub async fn read<R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        self.ensure_active()?;
        let entries = self.entries.read().await;
        Ok(f(&entries))
    }

    /// Mutate the entries, then persist, under a single write lock.
    ///
    /// The save happens while the lock is still held, so saves reach
    /// the adapter in mutation order and the durable copy never
    /// regresses to an older state.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> Result<R> {
        self.ensure_active()?;
        let mut entries = self.entries.write().await;
        let result = f(&mut entries);
        self.persist(&entries).await;
        Ok(result)
    }

    async fn persist(&self, entries: &[T]) {
        let values: std::result::Result<Vec<serde_json::Value>, _> =
            entries.iter().map(serde_json::to_value).collect();
        let values = match values {
            Ok(values) => values,
            Err(err) => {
                let err = Error::Persistence(format!("{}: {err}", self.name));
                warn!("Failed to serialize ledger {}: {}", self.name, err);
                (self.on_error)(None, &err);
                return;
            }
        };
        if let Err(err) = self.persistence.save(&values).await {
            warn!("Failed to save ledger {}: {}", self.name, err);
            (self.on_error)(None, &err);
        }
    }

    /// Clear all entries and fail every subsequent operation.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_store::MemoryPersistence;
    use serde_json::json;

    fn noop_hook() -> ErrorHook {
        Arc::new(|_, _| {})
    }

    #[tokio::test]
    async fn test_mutate_persists_entries() {
        let persistence = Arc::new(MemoryPersistence::new());
        let ledger: Ledger<serde_json::Value> =
            Ledger::open("test", persistence.clone(), noop_hook()).await;

        ledger
            .mutate(|entries| entries.push(json!({"id": "1"})))
            .await
            .unwrap();

        let saved = persistence.load().await.unwrap();
        assert_eq!(saved, vec![json!({"id": "1"})]);
    }

    #[tokio::test]
    async fn test_open_loads_persisted_entries() {
        let persistence = Arc::new(MemoryPersistence::new());
        persistence.save(&[json!({"id": "1"})]).await.unwrap();

        let ledger: Ledger<serde_json::Value> =
            Ledger::open("test", persistence, noop_hook()).await;
        let count = ledger.read(|entries| entries.len()).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_disposed_ledger_fails() {
        let ledger: Ledger<serde_json::Value> =
            Ledger::open("test", Arc::new(MemoryPersistence::new()), noop_hook()).await;
        ledger.dispose().await;

        assert!(matches!(
            ledger.read(|entries| entries.len()).await,
            Err(Error::Disposed)
        ));
        assert!(matches!(
            ledger.mutate(|entries| entries.clear()).await,
            Err(Error::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_mutations_persist_in_mutation_order() {
        struct SlowFirstSave {
            first: AtomicBool,
            states: std::sync::Mutex<Vec<Vec<serde_json::Value>>>,
        }

        #[async_trait::async_trait]
        impl LedgerPersistence for SlowFirstSave {
            async fn load(&self) -> Result<Vec<serde_json::Value>> {
                Ok(Vec::new())
            }
            async fn save(&self, items: &[serde_json::Value]) -> Result<()> {
                if self.first.swap(false, Ordering::SeqCst) {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                self.states.lock().unwrap().push(items.to_vec());
                Ok(())
            }
        }

        let persistence = Arc::new(SlowFirstSave {
            first: AtomicBool::new(true),
            states: std::sync::Mutex::new(Vec::new()),
        });
        let ledger: Arc<Ledger<serde_json::Value>> =
            Arc::new(Ledger::open("test", persistence.clone(), noop_hook()).await);

        // A slow first save must not let the second save land before it
        let first = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger.mutate(|entries| entries.push(json!(1))).await.unwrap();
            })
        };
        let second = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger.mutate(|entries| entries.push(json!(2))).await.unwrap();
            })
        };
        first.await.unwrap();
        second.await.unwrap();

        let states = persistence.states.lock().unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states.last().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_save_failure_reports_through_hook() {
        struct FailingSave;

        #[async_trait::async_trait]
        impl LedgerPersistence for FailingSave {
            async fn load(&self) -> Result<Vec<serde_json::Value>> {
                Ok(Vec::new())
            }
            async fn save(&self, _items: &[serde_json::Value]) -> Result<()> {
                Err(Error::Persistence("simulated error".to_string()))
            }
        }

        let reported = Arc::new(std::sync::Mutex::new(Vec::new()));
        let reported_clone = reported.clone();
        let hook: ErrorHook = Arc::new(move |_, err| {
            reported_clone.lock().unwrap().push(err.to_string());
        });

        let ledger: Ledger<serde_json::Value> =
            Ledger::open("test", Arc::new(FailingSave), hook).await;
        // Mutation succeeds; the save failure goes to the hook only
        ledger
            .mutate(|entries| entries.push(json!({"id": "1"})))
            .await
            .unwrap();

        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].contains("simulated error"));
    }
}
