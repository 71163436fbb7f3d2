//! Append-only ledger of local mutations pending reconciliation.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use driftsync_common::{monotonic_millis, ItemId, Millis, Result};
use driftsync_store::{Document, LedgerPersistence, Modifier};

use crate::engine::ErrorHook;
use crate::ledger::Ledger;

/// The mutation a change carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ChangePayload {
    /// Full item to insert.
    Insert(Document),
    /// Id and modifier of an updated item.
    Update {
        /// Id of the updated item.
        id: ItemId,
        /// The modifier that was applied.
        modifier: Modifier,
    },
    /// Id of a removed item.
    Remove(ItemId),
}

/// One local mutation pending reconciliation.
///
/// Immutable once written; deleted only after being folded into a
/// snapshot. Ordered by `time`, ties broken by ledger insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Unique id of this ledger entry.
    pub id: Uuid,
    /// Collection the mutation belongs to.
    pub collection: String,
    /// When the mutation was observed (monotonic process clock).
    pub time: Millis,
    /// The mutation itself.
    #[serde(flatten)]
    pub payload: ChangePayload,
}

impl Change {
    /// Create a change stamped with the current monotonic time.
    pub fn new(collection: impl Into<String>, payload: ChangePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            collection: collection.into(),
            time: monotonic_millis(),
            payload,
        }
    }
}

/// The change ledger: local mutations not yet folded into a snapshot.
pub struct ChangeLedger {
    inner: Ledger<Change>,
}

impl ChangeLedger {
    pub(crate) async fn open(
        persistence: Arc<dyn LedgerPersistence>,
        on_error: ErrorHook,
    ) -> Self {
        Self {
            inner: Ledger::open("changes", persistence, on_error).await,
        }
    }

    /// Append a mutation to the ledger.
    pub async fn append(&self, change: Change) -> Result<()> {
        self.inner.mutate(|entries| entries.push(change)).await
    }

    /// Changes for a collection with `time` in `[from, to]`, ordered by
    /// time ascending with insertion order breaking ties.
    pub async fn in_window(
        &self,
        collection: &str,
        from: Millis,
        to: Millis,
    ) -> Result<Vec<Change>> {
        self.inner
            .read(|entries| {
                let mut selected: Vec<Change> = entries
                    .iter()
                    .filter(|c| c.collection == collection && c.time >= from && c.time <= to)
                    .cloned()
                    .collect();
                selected.sort_by_key(|c| c.time);
                selected
            })
            .await
    }

    /// Count of changes for a collection within `[from, to]`.
    pub async fn count_in_window(
        &self,
        collection: &str,
        from: Millis,
        to: Millis,
    ) -> Result<usize> {
        self.inner
            .read(|entries| {
                entries
                    .iter()
                    .filter(|c| c.collection == collection && c.time >= from && c.time <= to)
                    .count()
            })
            .await
    }

    /// Delete changes that have been folded into a snapshot.
    pub async fn prune(&self, collection: &str, ids: &[Uuid]) -> Result<()> {
        self.inner
            .mutate(|entries| {
                entries.retain(|c| !(c.collection == collection && ids.contains(&c.id)));
            })
            .await
    }

    pub(crate) async fn dispose(&self) {
        self.inner.dispose().await;
    }
}
