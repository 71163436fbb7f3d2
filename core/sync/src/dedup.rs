//! De-dup ledger for remotely-applied mutations.

use std::sync::Arc;

use driftsync_common::{Millis, Result};
use driftsync_store::LedgerPersistence;

use crate::changes::{Change, ChangePayload};
use crate::engine::ErrorHook;
use crate::ledger::Ledger;

/// Short-lived markers preventing remotely-applied writes from
/// re-entering the outgoing change ledger.
///
/// A marker is inserted immediately before a remote mutation is applied
/// to the live collection and consumed by the dispatcher that observes
/// the resulting event, so it never outlives the in-flight application
/// window.
pub struct RemoteChangeLedger {
    inner: Ledger<Change>,
}

impl RemoteChangeLedger {
    pub(crate) async fn open(
        persistence: Arc<dyn LedgerPersistence>,
        on_error: ErrorHook,
    ) -> Self {
        Self {
            inner: Ledger::open("remote-changes", persistence, on_error).await,
        }
    }

    /// Record that a mutation is about to be applied from remote data.
    ///
    /// Must happen before the live-collection mutation, so the event
    /// dispatcher sees the marker already present.
    pub async fn mark(&self, change: Change) -> Result<()> {
        self.inner.mutate(|entries| entries.push(change)).await
    }

    /// Consume the marker matching an observed mutation, if present.
    ///
    /// Returns true when a marker was found and removed, meaning the
    /// mutation was self-inflicted and must not be logged as a local
    /// change.
    pub async fn consume(&self, collection: &str, payload: &ChangePayload) -> Result<bool> {
        self.inner
            .mutate(|entries| {
                match entries
                    .iter()
                    .position(|c| c.collection == collection && &c.payload == payload)
                {
                    Some(index) => {
                        entries.remove(index);
                        true
                    }
                    None => false,
                }
            })
            .await
    }

    /// Drop unconsumed markers from before the current sync window.
    ///
    /// A marker survives its window only when the mutation it guards
    /// turned out to be a no-op on the live collection (absent id) and
    /// therefore never produced an event to consume it.
    pub async fn sweep_stale(&self, collection: &str, before: Millis) -> Result<()> {
        self.inner
            .mutate(|entries| {
                entries.retain(|c| !(c.collection == collection && c.time < before));
            })
            .await
    }

    pub(crate) async fn dispose(&self) {
        self.inner.dispose().await;
    }
}
