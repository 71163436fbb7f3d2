//! driftsync reconciliation engine.
//!
//! This crate keeps local reactive collections reconciled with a remote
//! source of truth over caller-supplied pull/push transports, including:
//! - An append-only change ledger of local mutations pending push
//! - Snapshots of the last fully-reconciled state per collection
//! - A sync-operation tracker recording status and timing of attempts
//! - A de-dup ledger suppressing feedback from remotely-applied writes
//! - The pure three-way merge between snapshot, local changes, and
//!   freshly pulled data
//! - Per-collection serialized scheduling with debounced push triggering

pub mod changes;
pub mod debounce;
pub mod dedup;
pub mod engine;
mod ledger;
pub mod operations;
pub mod queue;
pub mod reconcile;
pub mod snapshots;
pub mod transport;

// Re-export main types
pub use changes::{Change, ChangeLedger, ChangePayload};
pub use dedup::RemoteChangeLedger;
pub use engine::{
    ErrorHook, RemoteChangeHandle, SyncCallOptions, SyncEngine, SyncOptions,
};
pub use operations::{OperationLog, SyncOperation, SyncStatus};
pub use reconcile::{apply_changes, compute_changes, get_snapshot, reconcile, SyncTarget};
pub use snapshots::{Snapshot, SnapshotStore};
pub use transport::{Changeset, CollectionConfig, LoadResponse, Transport};
