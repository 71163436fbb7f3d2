//! Snapshots of the last fully-reconciled state per collection.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use driftsync_common::{Millis, Result};
use driftsync_store::{Document, LedgerPersistence};

use crate::engine::ErrorHook;
use crate::ledger::Ledger;

/// The last point at which local and remote state were known to agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Start time of the reconciliation that produced this snapshot.
    pub time: Millis,
    /// Collection the snapshot belongs to.
    pub collection: String,
    /// The agreed item list.
    pub items: Vec<Document>,
}

/// Store of reconciliation baselines, at most one current snapshot per
/// collection after a successful reconciliation.
pub struct SnapshotStore {
    inner: Ledger<Snapshot>,
}

impl SnapshotStore {
    pub(crate) async fn open(
        persistence: Arc<dyn LedgerPersistence>,
        on_error: ErrorHook,
    ) -> Self {
        Self {
            inner: Ledger::open("snapshots", persistence, on_error).await,
        }
    }

    /// The most recent snapshot for a collection, if any.
    pub async fn latest(&self, collection: &str) -> Result<Option<Snapshot>> {
        self.inner
            .read(|entries| {
                entries
                    .iter()
                    .filter(|s| s.collection == collection)
                    .max_by_key(|s| s.time)
                    .cloned()
            })
            .await
    }

    /// Replace stale snapshots (time <= `up_to`) with a new baseline.
    ///
    /// Delete and insert happen under one write lock, so no reader ever
    /// observes the collection without a baseline.
    pub async fn replace(
        &self,
        collection: &str,
        up_to: Millis,
        snapshot: Snapshot,
    ) -> Result<()> {
        self.inner
            .mutate(|entries| {
                entries.retain(|s| !(s.collection == collection && s.time <= up_to));
                entries.push(snapshot);
            })
            .await
    }

    pub(crate) async fn dispose(&self) {
        self.inner.dispose().await;
    }
}
