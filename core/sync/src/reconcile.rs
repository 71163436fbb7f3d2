//! The three-way merge between the last snapshot, local changes, and
//! freshly pulled remote data.
//!
//! `get_snapshot`, `apply_changes`, and `compute_changes` are pure;
//! `reconcile` drives them against a `SyncTarget`. Network calls are
//! made at most once each per invocation when local changes exist, and
//! not at all when nothing changed.

use async_trait::async_trait;
use tracing::debug;

use driftsync_common::{ItemId, Result};
use driftsync_store::{Document, Modifier};

use crate::changes::{Change, ChangePayload};
use crate::transport::{Changeset, LoadResponse};

/// The effectful side of one reconciliation pass.
///
/// `insert`/`update`/`remove` mutate the live collection with deltas
/// that originate from remote data; the orchestrator wires them to
/// record a de-dup marker before each mutation.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    /// Re-fetch remote state after a push.
    async fn pull(&self) -> Result<LoadResponse>;

    /// Send local deltas upstream.
    async fn push(&self, changes: &Changeset) -> Result<()>;

    /// Apply a remote insert to the live collection.
    async fn insert(&self, doc: Document) -> Result<()>;

    /// Apply a remote update to the live collection.
    async fn update(&self, id: &ItemId, modifier: Modifier) -> Result<()>;

    /// Apply a remote removal to the live collection.
    async fn remove(&self, id: &ItemId) -> Result<()>;
}

/// Resolve pulled data into a new baseline item list.
///
/// A full item list wins over the last snapshot; a partial changeset is
/// applied over it (defaulting to empty).
pub fn get_snapshot(last_snapshot: Option<&[Document]>, data: &LoadResponse) -> Vec<Document> {
    match data {
        LoadResponse::Items(items) => items.clone(),
        LoadResponse::Changes(changes) => {
            let mut items = last_snapshot.map(<[Document]>::to_vec).unwrap_or_default();
            for doc in &changes.added {
                upsert(&mut items, doc.clone());
            }
            for doc in &changes.modified {
                upsert(&mut items, doc.clone());
            }
            for id in &changes.removed {
                items.retain(|d| &d.id != id);
            }
            items
        }
    }
}

/// Apply an ordered list of changes to an item list, returning a new
/// list. Inserts upsert when the id already exists; updates and
/// removals of absent ids are no-ops.
pub fn apply_changes(items: &[Document], changes: &[Change]) -> Vec<Document> {
    let mut result = items.to_vec();
    for change in changes {
        match &change.payload {
            ChangePayload::Insert(doc) => upsert(&mut result, doc.clone()),
            ChangePayload::Update { id, modifier } => {
                if let Some(doc) = result.iter_mut().find(|d| &d.id == id) {
                    modifier.apply(doc);
                }
            }
            ChangePayload::Remove(id) => result.retain(|d| &d.id != id),
        }
    }
    result
}

/// Diff two item lists into a changeset.
///
/// Modified entries carry the full new item, enough to replay as a
/// `$set` update.
pub fn compute_changes(old: &[Document], new: &[Document]) -> Changeset {
    let mut changeset = Changeset::default();

    for doc in new {
        match old.iter().find(|d| d.id == doc.id) {
            None => changeset.added.push(doc.clone()),
            Some(previous) if previous != doc => changeset.modified.push(doc.clone()),
            Some(_) => {}
        }
    }
    for doc in old {
        if !new.iter().any(|d| d.id == doc.id) {
            changeset.removed.push(doc.id.clone());
        }
    }

    changeset
}

/// One reconciliation pass. Returns the item list to store as the new
/// snapshot.
///
/// With local changes, the outgoing changeset is computed against the
/// resolved baseline and pushed, then fresh data is pulled and the pass
/// restarts with the locally-applied snapshot as the baseline. Without
/// local changes, the baseline is diffed against the resolved data and
/// each delta is applied to the live collection.
pub async fn reconcile(
    target: &dyn SyncTarget,
    changes: &[Change],
    last_snapshot: Option<Vec<Document>>,
    data: LoadResponse,
) -> Result<Vec<Document>> {
    let snapshot = get_snapshot(last_snapshot.as_deref(), &data);

    if !changes.is_empty() {
        let snapshot_with_changes = apply_changes(&snapshot, changes);
        let changes_to_push = compute_changes(&snapshot, &snapshot_with_changes);
        if !changes_to_push.is_empty() {
            debug!(
                "Pushing {} deltas, re-pulling merged state",
                changes_to_push.len()
            );
            target.push(&changes_to_push).await?;
            let fresh = target.pull().await?;
            return Box::pin(reconcile(target, &[], Some(snapshot_with_changes), fresh)).await;
        }
    }

    let baseline = last_snapshot.unwrap_or_default();
    let delta = compute_changes(&baseline, &snapshot);
    if !delta.is_empty() {
        debug!(
            "Applying {} remote deltas to the live collection",
            delta.len()
        );
    }
    for doc in delta.added {
        target.insert(doc).await?;
    }
    for doc in delta.modified {
        let modifier = Modifier::from_document(&doc);
        target.update(&doc.id, modifier).await?;
    }
    for id in delta.removed {
        target.remove(&id).await?;
    }

    Ok(snapshot)
}

fn upsert(items: &mut Vec<Document>, doc: Document) {
    match items.iter_mut().find(|d| d.id == doc.id) {
        Some(existing) => *existing = doc,
        None => items.push(doc),
    }
}
