//! Sync orchestrator: per-collection serialized scheduling, debounced
//! push triggering, and the public control surface.

use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use driftsync_common::{monotonic_millis, Error, ItemId, Result};
use driftsync_store::{
    CollectionEvent, Document, LedgerPersistence, LocalCollection, MemoryPersistence, Modifier,
    PersistenceFactory,
};

use crate::changes::{Change, ChangeLedger, ChangePayload};
use crate::debounce::Debouncer;
use crate::dedup::RemoteChangeLedger;
use crate::operations::OperationLog;
use crate::queue::TaskQueue;
use crate::reconcile::{self, SyncTarget};
use crate::snapshots::{Snapshot, SnapshotStore};
use crate::transport::{Changeset, CollectionConfig, LoadResponse, Transport};

/// Trailing window within which bursts of local writes coalesce into a
/// single push.
const PUSH_DEBOUNCE: Duration = Duration::from_millis(100);

/// Error reporting callback: collection name (when one is in scope)
/// plus the failure.
pub type ErrorHook = Arc<dyn Fn(Option<&str>, &Error) + Send + Sync>;

/// Caller-supplied hook wiring out-of-band remote change notifications
/// into the engine.
pub type RegisterRemoteChange = Box<dyn FnOnce(RemoteChangeHandle) + Send>;

/// Constructor options for [`SyncEngine`].
pub struct SyncOptions {
    transport: Arc<dyn Transport>,
    register_remote_change: Option<RegisterRemoteChange>,
    on_error: Option<ErrorHook>,
    id: Option<String>,
    persistence: Option<PersistenceFactory>,
}

impl SyncOptions {
    /// Options with the given transport and defaults for everything
    /// else (in-memory ledger persistence, log-only error hook).
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            register_remote_change: None,
            on_error: None,
            id: None,
            persistence: None,
        }
    }

    /// Set the error reporting callback.
    pub fn on_error(
        mut self,
        hook: impl Fn(Option<&str>, &Error) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Set the engine id used to derive per-ledger persistence keys.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the persistence factory for the internal ledgers.
    pub fn persistence(mut self, factory: PersistenceFactory) -> Self {
        self.persistence = Some(factory);
        self
    }

    /// Register for out-of-band remote change notifications. The
    /// closure receives a [`RemoteChangeHandle`] to wire into the
    /// transport's notification channel.
    pub fn register_remote_change(
        mut self,
        register: impl FnOnce(RemoteChangeHandle) + Send + 'static,
    ) -> Self {
        self.register_remote_change = Some(Box::new(register));
        self
    }
}

/// Options for a single [`SyncEngine::sync`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncCallOptions {
    /// Bypass the per-collection queue and run immediately.
    ///
    /// Intended for error-triggered immediate retries. A forced sync
    /// can run concurrently with a queued one for the same name, so
    /// the per-name mutual-exclusion guarantee does not hold for it.
    pub force: bool,
    /// Short-circuit when no ledger entries exist since the last
    /// completed sync.
    pub only_with_changes: bool,
}

impl SyncCallOptions {
    /// Enable the queue bypass.
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Enable the no-pending-changes short circuit.
    pub fn only_with_changes(mut self) -> Self {
        self.only_with_changes = true;
        self
    }
}

struct CollectionEntry {
    collection: Arc<dyn LocalCollection>,
    config: CollectionConfig,
    dispatcher: JoinHandle<()>,
    debouncer: Arc<Debouncer>,
}

/// Keeps registered local collections reconciled with the remote
/// source of truth.
///
/// Owns the four internal ledgers exclusively; the live collections
/// are owned by the caller and mutated here only during
/// reconciliation. Different collection names reconcile fully in
/// parallel; per name, attempts are serialized by a FIFO queue (with
/// the documented `force` bypass).
pub struct SyncEngine {
    transport: Arc<dyn Transport>,
    collections: RwLock<HashMap<String, CollectionEntry>>,
    changes: ChangeLedger,
    remote_changes: RemoteChangeLedger,
    snapshots: SnapshotStore,
    operations: OperationLog,
    queues: Mutex<HashMap<String, Arc<TaskQueue>>>,
    on_error: ErrorHook,
    disposed: AtomicBool,
}

impl SyncEngine {
    /// Create an engine, loading any persisted ledger state.
    pub async fn new(options: SyncOptions) -> Arc<Self> {
        let id = options.id.unwrap_or_else(|| "driftsync".to_string());
        let factory: PersistenceFactory = options.persistence.unwrap_or_else(|| {
            Arc::new(|_| Arc::new(MemoryPersistence::new()) as Arc<dyn LedgerPersistence>)
        });
        let on_error: ErrorHook = options.on_error.unwrap_or_else(|| {
            Arc::new(|name, err| match name {
                Some(name) => error!("Sync error in {}: {}", name, err),
                None => error!("Sync error: {}", err),
            })
        });

        let changes =
            ChangeLedger::open(factory(&format!("{id}-changes")), on_error.clone()).await;
        let remote_changes =
            RemoteChangeLedger::open(factory(&format!("{id}-remote-changes")), on_error.clone())
                .await;
        let snapshots =
            SnapshotStore::open(factory(&format!("{id}-snapshots")), on_error.clone()).await;
        let operations =
            OperationLog::open(factory(&format!("{id}-sync-operations")), on_error.clone()).await;

        let engine = Arc::new(Self {
            transport: options.transport,
            collections: RwLock::new(HashMap::new()),
            changes,
            remote_changes,
            snapshots,
            operations,
            queues: Mutex::new(HashMap::new()),
            on_error,
            disposed: AtomicBool::new(false),
        });

        if let Some(register) = options.register_remote_change {
            register(RemoteChangeHandle {
                engine: Arc::downgrade(&engine),
            });
        }

        engine
    }

    fn ensure_active(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    /// Register a named collection and start observing its mutations.
    pub async fn add_collection(
        self: &Arc<Self>,
        collection: Arc<dyn LocalCollection>,
        config: CollectionConfig,
    ) -> Result<()> {
        self.ensure_active()?;
        let name = config.name.clone();
        let events = collection.subscribe();
        let dispatcher = tokio::spawn(Self::dispatch_events(
            Arc::downgrade(self),
            name.clone(),
            events,
        ));
        let entry = CollectionEntry {
            collection,
            config,
            dispatcher,
            debouncer: Arc::new(Debouncer::new(PUSH_DEBOUNCE)),
        };
        info!("Registered collection {}", name);
        if let Some(previous) = self.collections.write().await.insert(name, entry) {
            previous.dispatcher.abort();
            previous.debouncer.cancel();
        }
        Ok(())
    }

    /// Get a registered collection and its transport config.
    pub async fn collection(
        &self,
        name: &str,
    ) -> Result<(Arc<dyn LocalCollection>, CollectionConfig)> {
        self.ensure_active()?;
        let collections = self.collections.read().await;
        collections
            .get(name)
            .map(|entry| (entry.collection.clone(), entry.config.clone()))
            .ok_or_else(|| Error::NotFound(format!("Collection '{name}' not found")))
    }

    /// One dispatcher task per collection: processes mutation events in
    /// emission order, so the de-dup consume-or-append decision is
    /// atomic with respect to a single mutation.
    async fn dispatch_events(
        engine: Weak<SyncEngine>,
        name: String,
        mut events: broadcast::Receiver<CollectionEvent>,
    ) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Lost events never reached the change ledger, so
                    // re-converge with a full forced sync
                    let Some(engine) = engine.upgrade() else {
                        break;
                    };
                    warn!(
                        "Event dispatcher for {} lagged, {} events lost, forcing full sync",
                        name, missed
                    );
                    if let Err(err) = engine.sync(&name, SyncCallOptions::default().force()).await
                    {
                        // Already reported through the error hook
                        debug!("Recovery sync for {} failed: {}", name, err);
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(engine) = engine.upgrade() else {
                break;
            };
            let payload = match event {
                CollectionEvent::Added(doc) => ChangePayload::Insert(doc),
                CollectionEvent::Changed { id, modifier } => {
                    ChangePayload::Update { id, modifier }
                }
                CollectionEvent::Removed(id) => ChangePayload::Remove(id),
            };
            if let Err(err) = engine.record_local_change(&name, payload).await {
                (engine.on_error)(Some(&name), &err);
            }
        }
    }

    async fn record_local_change(self: &Arc<Self>, name: &str, payload: ChangePayload) -> Result<()> {
        // A matching marker means the mutation was applied from remote
        // data; consume it instead of logging an outgoing change.
        if self.remote_changes.consume(name, &payload).await? {
            return Ok(());
        }
        self.changes.append(Change::new(name, payload)).await?;
        self.schedule_push(name).await;
        Ok(())
    }

    async fn schedule_push(self: &Arc<Self>, name: &str) {
        let collections = self.collections.read().await;
        let Some(entry) = collections.get(name) else {
            return;
        };
        let engine = Arc::downgrade(self);
        let name = name.to_string();
        entry.debouncer.call(async move {
            let Some(engine) = engine.upgrade() else {
                return;
            };
            if let Err(err) = engine.push_changes(&name).await {
                // Already reported through the error hook
                debug!("Debounced push for {} failed: {}", name, err);
            }
        });
    }

    /// Reconcile one collection.
    ///
    /// Defers one tick to let same-turn mutations settle, then runs on
    /// the collection's serialized queue (or immediately with
    /// `force`). Failures are returned and reported through the error
    /// hook.
    pub async fn sync(self: &Arc<Self>, name: &str, options: SyncCallOptions) -> Result<()> {
        self.ensure_active()?;
        tokio::task::yield_now().await;

        if options.force {
            self.do_sync(name, options).await
        } else {
            let queue = self.queue_for(name).await?;
            queue.run(self.do_sync(name, options)).await
        }
    }

    /// Reconcile every registered collection in parallel.
    ///
    /// Every failing collection is reported through the error hook;
    /// the first failure is returned.
    pub async fn sync_all(self: &Arc<Self>) -> Result<()> {
        self.ensure_active()?;
        let names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        let results = futures::future::join_all(
            names
                .iter()
                .map(|name| self.sync(name, SyncCallOptions::default())),
        )
        .await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Whether a reconciliation is in flight, optionally scoped by
    /// collection name.
    pub async fn is_syncing(&self, name: Option<&str>) -> Result<bool> {
        self.operations.any_active(name).await
    }

    /// Push pending local changes, if any. Debounce target.
    pub async fn push_changes(self: &Arc<Self>, name: &str) -> Result<()> {
        self.sync(name, SyncCallOptions::default().only_with_changes())
            .await
    }

    /// Tear down the engine: stop observing collections, clear queues
    /// and ledgers. In-flight reconciliations are not aborted; they
    /// fail once they touch a disposed ledger. Subsequent operations
    /// fail with [`Error::Disposed`].
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Disposing sync engine");
        let mut collections = self.collections.write().await;
        for (_, entry) in collections.drain() {
            entry.debouncer.cancel();
            entry.dispatcher.abort();
        }
        self.queues.lock().await.clear();
        self.changes.dispose().await;
        self.remote_changes.dispose().await;
        self.snapshots.dispose().await;
        self.operations.dispose().await;
        Ok(())
    }

    async fn queue_for(&self, name: &str) -> Result<Arc<TaskQueue>> {
        self.ensure_active()?;
        let mut queues = self.queues.lock().await;
        Ok(queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TaskQueue::new()))
            .clone())
    }

    async fn do_sync(self: &Arc<Self>, name: &str, options: SyncCallOptions) -> Result<()> {
        if options.only_with_changes {
            let since = self.operations.last_finished_end(name).await?;
            let pending = self
                .changes
                .count_in_window(name, since, monotonic_millis())
                .await?;
            if pending == 0 {
                debug!("No pending changes for {}, skipping sync", name);
                return Ok(());
            }
        }

        let (_, config) = self.collection(name).await?;
        let data = match self.transport.pull(&config).await {
            Ok(data) => data,
            Err(err) => {
                (self.on_error)(Some(name), &err);
                return Err(err);
            }
        };
        self.sync_with_data(name, data).await
    }

    /// Run the reconciliation sequence with already-resolved remote
    /// data (from a pull or an out-of-band notification), then flush
    /// any local writes that occurred during the reconciliation
    /// window.
    ///
    /// The flush re-enters `sync`, making this the recursive knot of
    /// the sync path; the boxed return fixes both the future's size
    /// and its `Send` bound.
    pub fn sync_with_data<'a>(
        self: &'a Arc<Self>,
        name: &'a str,
        data: LoadResponse,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            match self.run_reconciliation(name, data).await {
                Ok(()) => {
                    let flush = SyncCallOptions::default().force().only_with_changes();
                    self.sync(name, flush).await
                }
                Err(err) => {
                    (self.on_error)(Some(name), &err);
                    let engine = Arc::downgrade(self);
                    let name = name.to_string();
                    tokio::spawn(async move {
                        let Some(engine) = engine.upgrade() else {
                            return;
                        };
                        let flush = SyncCallOptions::default().force().only_with_changes();
                        // Failures are reported inside the sync path
                        let _ = engine.sync(&name, flush).await;
                    });
                    Err(err)
                }
            }
        }
        .boxed()
    }

    async fn run_reconciliation(self: &Arc<Self>, name: &str, data: LoadResponse) -> Result<()> {
        let (collection, config) = self.collection(name).await?;
        let sync_time = monotonic_millis();
        let operation = self.operations.begin(name, sync_time).await?;
        debug!("Reconciliation started for {}", name);

        let outcome: Result<()> = async {
            let since = self.operations.last_finished_end(name).await?;
            // Markers from before the window belong to mutations that
            // never produced an event; left in place they would swallow
            // a later identical local write
            self.remote_changes.sweep_stale(name, since).await?;
            let last_snapshot = self.snapshots.latest(name).await?.map(|s| s.items);
            let window = self.changes.in_window(name, since, sync_time).await?;

            let target = EngineTarget {
                engine: self,
                name,
                collection,
                config,
            };
            let items = reconcile::reconcile(&target, &window, last_snapshot, data).await?;

            self.snapshots
                .replace(
                    name,
                    sync_time,
                    Snapshot {
                        time: sync_time,
                        collection: name.to_string(),
                        items,
                    },
                )
                .await?;
            let consumed: Vec<Uuid> = window.iter().map(|c| c.id).collect();
            self.changes.prune(name, &consumed).await?;

            // Let other scheduled tasks observe the active operation
            // before it settles
            tokio::task::yield_now().await;
            self.operations.finish(operation).await?;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                info!("Reconciliation finished for {}", name);
                Ok(())
            }
            Err(err) => {
                error!("Reconciliation failed for {}: {}", name, err);
                if let Err(settle_err) = self.operations.fail(operation, &err).await {
                    warn!(
                        "Failed to settle sync operation for {}: {}",
                        name, settle_err
                    );
                }
                Err(err)
            }
        }
    }
}

/// Wires the reconciliation algorithm to the transport and the live
/// collection, recording a de-dup marker before each mutation so the
/// event dispatcher sees the marker already present.
struct EngineTarget<'a> {
    engine: &'a SyncEngine,
    name: &'a str,
    collection: Arc<dyn LocalCollection>,
    config: CollectionConfig,
}

#[async_trait::async_trait]
impl SyncTarget for EngineTarget<'_> {
    async fn pull(&self) -> Result<LoadResponse> {
        self.engine.transport.pull(&self.config).await
    }

    async fn push(&self, changes: &Changeset) -> Result<()> {
        self.engine.transport.push(&self.config, changes).await
    }

    async fn insert(&self, doc: Document) -> Result<()> {
        self.engine
            .remote_changes
            .mark(Change::new(self.name, ChangePayload::Insert(doc.clone())))
            .await?;
        self.collection.insert(doc).await
    }

    async fn update(&self, id: &ItemId, modifier: Modifier) -> Result<()> {
        self.engine
            .remote_changes
            .mark(Change::new(
                self.name,
                ChangePayload::Update {
                    id: id.clone(),
                    modifier: modifier.clone(),
                },
            ))
            .await?;
        self.collection.update_one(id, &modifier).await
    }

    async fn remove(&self, id: &ItemId) -> Result<()> {
        self.engine
            .remote_changes
            .mark(Change::new(self.name, ChangePayload::Remove(id.clone())))
            .await?;
        self.collection.remove_one(id).await
    }
}

/// Entry point for out-of-band remote change notifications.
///
/// Holds a weak reference; notifications after `dispose` (or after the
/// engine is dropped) fail with [`Error::Disposed`].
#[derive(Clone)]
pub struct RemoteChangeHandle {
    engine: Weak<SyncEngine>,
}

impl RemoteChangeHandle {
    /// Handle a notification. Without payload this runs a normal sync
    /// (including a pull); with payload the data feeds straight into
    /// the reconciliation sequence.
    pub async fn notify(&self, name: &str, data: Option<LoadResponse>) -> Result<()> {
        let Some(engine) = self.engine.upgrade() else {
            return Err(Error::Disposed);
        };
        match data {
            None => engine.sync(name, SyncCallOptions::default()).await,
            Some(data) => engine.sync_with_data(name, data).await,
        }
    }
}
