//! Status and timing of reconciliation attempts.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use driftsync_common::{monotonic_millis, Error, Millis, Result};
use driftsync_store::LedgerPersistence;

use crate::engine::ErrorHook;
use crate::ledger::Ledger;

/// Lifecycle state of a reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Reconciliation is in flight.
    Active,
    /// Reconciliation settled successfully.
    Done,
    /// Reconciliation failed.
    Error,
}

/// Record of one reconciliation attempt. Never re-used; each attempt
/// creates a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Unique id of the attempt.
    pub id: Uuid,
    /// Collection being reconciled.
    pub collection: String,
    /// Current lifecycle state.
    pub status: SyncStatus,
    /// When the attempt started.
    pub start: Millis,
    /// When the attempt settled.
    pub end: Option<Millis>,
    /// The failure, when status is `Error`.
    pub error: Option<String>,
}

/// Tracker of reconciliation attempts across collections.
///
/// Superseded settled attempts are pruned whenever an attempt settles,
/// keeping per collection at most the latest finished attempt, the
/// latest failed attempt, and anything still active. The log stays
/// bounded over an engine's lifetime.
pub struct OperationLog {
    inner: Ledger<SyncOperation>,
}

impl OperationLog {
    pub(crate) async fn open(
        persistence: Arc<dyn LedgerPersistence>,
        on_error: ErrorHook,
    ) -> Self {
        Self {
            inner: Ledger::open("sync-operations", persistence, on_error).await,
        }
    }

    /// Record the start of a reconciliation attempt.
    pub async fn begin(&self, collection: &str, start: Millis) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let operation = SyncOperation {
            id,
            collection: collection.to_string(),
            status: SyncStatus::Active,
            start,
            end: None,
            error: None,
        };
        self.inner
            .mutate(|entries| entries.push(operation))
            .await?;
        Ok(id)
    }

    /// Mark an attempt as settled successfully.
    pub async fn finish(&self, id: Uuid) -> Result<()> {
        self.settle(id, SyncStatus::Done, None).await
    }

    /// Mark an attempt as failed, storing the failure.
    pub async fn fail(&self, id: Uuid, error: &Error) -> Result<()> {
        self.settle(id, SyncStatus::Error, Some(error.to_string()))
            .await
    }

    async fn settle(&self, id: Uuid, status: SyncStatus, error: Option<String>) -> Result<()> {
        let end = monotonic_millis();
        self.inner
            .mutate(|entries| {
                let collection = match entries.iter_mut().find(|o| o.id == id) {
                    Some(operation) => {
                        operation.status = status;
                        operation.end = Some(end);
                        operation.error = error;
                        operation.collection.clone()
                    }
                    None => return,
                };
                // A finished attempt supersedes everything settled up
                // to it; a failed one supersedes only earlier failures,
                // so `last_finished_end` never regresses
                entries.retain(|o| {
                    if o.id == id
                        || o.collection != collection
                        || o.status == SyncStatus::Active
                        || o.end.map_or(true, |e| e > end)
                    {
                        return true;
                    }
                    match status {
                        SyncStatus::Done => false,
                        SyncStatus::Error => o.status != SyncStatus::Error,
                        SyncStatus::Active => true,
                    }
                });
            })
            .await
    }

    /// End time of the last successfully finished attempt for a
    /// collection, default 0.
    pub async fn last_finished_end(&self, collection: &str) -> Result<Millis> {
        self.inner
            .read(|entries| {
                entries
                    .iter()
                    .filter(|o| o.collection == collection && o.status == SyncStatus::Done)
                    .filter_map(|o| o.end)
                    .max()
                    .unwrap_or(0)
            })
            .await
    }

    /// Whether an active attempt exists, optionally scoped by name.
    pub async fn any_active(&self, collection: Option<&str>) -> Result<bool> {
        self.inner
            .read(|entries| {
                entries.iter().any(|o| {
                    o.status == SyncStatus::Active
                        && collection.map_or(true, |name| o.collection == name)
                })
            })
            .await
    }

    pub(crate) async fn dispose(&self) {
        self.inner.dispose().await;
    }
}
