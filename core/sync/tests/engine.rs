//! End-to-end engine tests against a scripted in-process server.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use driftsync_common::{Error, ItemId, Result};
use driftsync_store::{Document, JsonFilePersistence, LocalCollection, MemoryCollection, Modifier};
use driftsync_sync::{
    Changeset, CollectionConfig, LoadResponse, RemoteChangeHandle, SyncCallOptions, SyncEngine,
    SyncOptions, Transport,
};

/// In-process server: pulls serve its item lists, pushes are applied
/// to them, so a re-pull observes the merged result.
#[derive(Default)]
struct MockServer {
    items: Mutex<HashMap<String, Vec<Document>>>,
    pushes: Mutex<Vec<(String, Changeset)>>,
    pull_count: AtomicUsize,
    fail_pulls: AtomicUsize,
    fail_pushes: AtomicUsize,
}

impl MockServer {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn seed(&self, collection: &str, items: Vec<Document>) {
        self.items
            .lock()
            .unwrap()
            .insert(collection.to_string(), items);
    }

    fn items(&self, collection: &str) -> Vec<Document> {
        self.items
            .lock()
            .unwrap()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    fn pushes(&self) -> Vec<(String, Changeset)> {
        self.pushes.lock().unwrap().clone()
    }

    fn pull_count(&self) -> usize {
        self.pull_count.load(Ordering::SeqCst)
    }

    fn fail_next_pulls(&self, count: usize) {
        self.fail_pulls.store(count, Ordering::SeqCst);
    }

    fn fail_next_pushes(&self, count: usize) {
        self.fail_pushes.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for MockServer {
    async fn pull(&self, collection: &CollectionConfig) -> Result<LoadResponse> {
        if Self::take_failure(&self.fail_pulls) {
            return Err(Error::Pull("load failed".to_string()));
        }
        self.pull_count.fetch_add(1, Ordering::SeqCst);
        Ok(LoadResponse::Items(self.items(&collection.name)))
    }

    async fn push(&self, collection: &CollectionConfig, changes: &Changeset) -> Result<()> {
        if Self::take_failure(&self.fail_pushes) {
            return Err(Error::Push("save failed".to_string()));
        }
        self.pushes
            .lock()
            .unwrap()
            .push((collection.name.clone(), changes.clone()));

        let mut all = self.items.lock().unwrap();
        let items = all.entry(collection.name.clone()).or_default();
        for doc in changes.added.iter().chain(&changes.modified) {
            match items.iter_mut().find(|d| d.id == doc.id) {
                Some(existing) => *existing = doc.clone(),
                None => items.push(doc.clone()),
            }
        }
        items.retain(|d| !changes.removed.contains(&d.id));
        Ok(())
    }
}

fn doc(id: &str, name: &str) -> Document {
    Document::new(id).field("name", name)
}

async fn engine_with(server: &Arc<MockServer>) -> (Arc<SyncEngine>, Arc<MemoryCollection>) {
    let engine = SyncEngine::new(SyncOptions::new(server.clone())).await;
    let collection = Arc::new(MemoryCollection::new());
    engine
        .add_collection(collection.clone(), CollectionConfig::new("todos"))
        .await
        .unwrap();
    (engine, collection)
}

/// Generous settle window for debounce (100ms) plus the sync itself.
async fn settle() {
    sleep(Duration::from_millis(400)).await;
}

#[tokio::test]
async fn test_burst_of_local_inserts_coalesces_into_one_push() {
    let server = MockServer::new();
    let (_engine, collection) = engine_with(&server).await;

    collection.insert(doc("1", "Item 1")).await.unwrap();
    collection.insert(doc("2", "Item 2")).await.unwrap();
    settle().await;

    let pushes = server.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, "todos");
    assert_eq!(
        pushes[0].1.added,
        vec![doc("1", "Item 1"), doc("2", "Item 2")]
    );
    assert_eq!(
        server.items("todos"),
        vec![doc("1", "Item 1"), doc("2", "Item 2")]
    );
}

#[tokio::test]
async fn test_sync_pulls_remote_items_into_local_collection() {
    let server = MockServer::new();
    server.seed("todos", vec![doc("1", "Item 1")]);
    let (engine, collection) = engine_with(&server).await;

    engine.sync("todos", SyncCallOptions::default()).await.unwrap();

    assert_eq!(collection.fetch().await.unwrap(), vec![doc("1", "Item 1")]);

    // The applied insert must not echo back as an outgoing change
    settle().await;
    assert!(server.pushes().is_empty());
}

#[tokio::test]
async fn test_local_update_pushes_full_modified_item() {
    let server = MockServer::new();
    server.seed("todos", vec![doc("1", "Item 1")]);
    let (engine, collection) = engine_with(&server).await;
    engine.sync("todos", SyncCallOptions::default()).await.unwrap();

    collection
        .update_one(&ItemId::from("1"), &Modifier::set_field("name", "Updated Item 1"))
        .await
        .unwrap();
    settle().await;

    let pushes = server.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].1.modified, vec![doc("1", "Updated Item 1")]);
    assert_eq!(server.items("todos"), vec![doc("1", "Updated Item 1")]);
}

#[tokio::test]
async fn test_local_removal_pushes_removed_id() {
    let server = MockServer::new();
    server.seed("todos", vec![doc("1", "Item 1")]);
    let (engine, collection) = engine_with(&server).await;
    engine.sync("todos", SyncCallOptions::default()).await.unwrap();

    collection.remove_one(&ItemId::from("1")).await.unwrap();
    settle().await;

    let pushes = server.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].1.removed, vec![ItemId::from("1")]);
    assert!(server.items("todos").is_empty());
}

#[tokio::test]
async fn test_pull_failure_rejects_and_reports_exactly_once() {
    let server = MockServer::new();
    let errors: Arc<Mutex<Vec<(Option<String>, String)>>> = Arc::default();
    let seen = errors.clone();

    let engine = SyncEngine::new(
        SyncOptions::new(server.clone()).on_error(move |name, err| {
            seen.lock()
                .unwrap()
                .push((name.map(str::to_string), err.to_string()));
        }),
    )
    .await;
    let collection = Arc::new(MemoryCollection::new());
    engine
        .add_collection(collection, CollectionConfig::new("todos"))
        .await
        .unwrap();

    server.fail_next_pulls(1);
    let result = engine.sync("todos", SyncCallOptions::default()).await;

    assert!(matches!(result, Err(Error::Pull(_))));
    assert!(!engine.is_syncing(None).await.unwrap());
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0.as_deref(), Some("todos"));
}

#[tokio::test]
async fn test_push_failure_reports_once_and_background_retry_recovers() {
    let server = MockServer::new();
    let errors: Arc<Mutex<Vec<String>>> = Arc::default();
    let seen = errors.clone();

    let engine = SyncEngine::new(
        SyncOptions::new(server.clone()).on_error(move |_, err| {
            seen.lock().unwrap().push(err.to_string());
        }),
    )
    .await;
    let collection = Arc::new(MemoryCollection::new());
    engine
        .add_collection(collection.clone(), CollectionConfig::new("todos"))
        .await
        .unwrap();

    server.fail_next_pushes(1);
    collection.insert(doc("1", "Item 1")).await.unwrap();
    sleep(Duration::from_millis(700)).await;

    // The change survived the failed attempt and the follow-up sync
    // delivered it
    assert_eq!(server.items("todos"), vec![doc("1", "Item 1")]);
    assert_eq!(server.pushes().len(), 1);
    assert_eq!(errors.lock().unwrap().len(), 1);
    assert!(!engine.is_syncing(Some("todos")).await.unwrap());
}

#[tokio::test]
async fn test_sync_runs_on_a_spawned_task() {
    let server = MockServer::new();
    server.seed("todos", vec![doc("1", "Item 1")]);
    let (engine, collection) = engine_with(&server).await;

    let spawned = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sync("todos", SyncCallOptions::default()).await })
    };
    spawned.await.unwrap().unwrap();

    assert_eq!(collection.fetch().await.unwrap(), vec![doc("1", "Item 1")]);
}

#[tokio::test]
async fn test_event_overflow_triggers_recovery_sync() {
    let server = MockServer::new();
    server.seed("todos", vec![doc("remote", "Remote Item")]);
    let (engine, collection) = engine_with(&server).await;

    // Flood more mutations than the event buffer holds before the
    // dispatcher gets a chance to run; the overflow must not leave the
    // collection out of sync with the server
    for i in 0..1100 {
        collection
            .insert(doc(&format!("local-{i}"), "Local"))
            .await
            .unwrap();
    }
    sleep(Duration::from_millis(800)).await;

    assert!(collection.find_one(&ItemId::from("remote")).is_some());
    drop(engine);
}

#[tokio::test]
async fn test_sync_all_reconciles_every_registered_collection() {
    let server = MockServer::new();
    server.seed("todos", vec![doc("1", "Todo")]);
    server.seed("posts", vec![doc("9", "Post")]);

    let engine = SyncEngine::new(SyncOptions::new(server.clone())).await;
    let todos = Arc::new(MemoryCollection::new());
    let posts = Arc::new(MemoryCollection::new());
    engine
        .add_collection(todos.clone(), CollectionConfig::new("todos"))
        .await
        .unwrap();
    engine
        .add_collection(posts.clone(), CollectionConfig::new("posts"))
        .await
        .unwrap();

    engine.sync_all().await.unwrap();

    assert_eq!(todos.fetch().await.unwrap(), vec![doc("1", "Todo")]);
    assert_eq!(posts.fetch().await.unwrap(), vec![doc("9", "Post")]);
}

#[tokio::test]
async fn test_sync_all_surfaces_failure_and_reports_each_collection() {
    let server = MockServer::new();
    let errors: Arc<Mutex<Vec<Option<String>>>> = Arc::default();
    let seen = errors.clone();

    let engine = SyncEngine::new(
        SyncOptions::new(server.clone()).on_error(move |name, _| {
            seen.lock().unwrap().push(name.map(str::to_string));
        }),
    )
    .await;
    engine
        .add_collection(Arc::new(MemoryCollection::new()), CollectionConfig::new("todos"))
        .await
        .unwrap();
    engine
        .add_collection(Arc::new(MemoryCollection::new()), CollectionConfig::new("posts"))
        .await
        .unwrap();

    server.fail_next_pulls(2);
    assert!(engine.sync_all().await.is_err());

    let mut reported: Vec<Option<String>> = errors.lock().unwrap().clone();
    reported.sort();
    assert_eq!(
        reported,
        vec![Some("posts".to_string()), Some("todos".to_string())]
    );
}

#[tokio::test]
async fn test_dispose_rejects_further_operations() {
    let server = MockServer::new();
    let (engine, collection) = engine_with(&server).await;

    engine.dispose().await.unwrap();

    assert!(matches!(
        engine.sync("todos", SyncCallOptions::default()).await,
        Err(Error::Disposed)
    ));
    assert!(matches!(
        engine.collection("todos").await,
        Err(Error::Disposed)
    ));

    // Local writes are no longer observed
    collection.insert(doc("1", "Item 1")).await.unwrap();
    settle().await;
    assert!(server.pushes().is_empty());
}

#[tokio::test]
async fn test_unknown_collection_is_not_found() {
    let server = MockServer::new();
    let (engine, _) = engine_with(&server).await;

    assert!(matches!(
        engine.collection("missing").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        engine.sync("missing", SyncCallOptions::default()).await,
        Err(Error::NotFound(_))
    ));
}

fn capture_handle(
    options: SyncOptions,
    slot: &Arc<Mutex<Option<RemoteChangeHandle>>>,
) -> SyncOptions {
    let slot = slot.clone();
    options.register_remote_change(move |handle| {
        *slot.lock().unwrap() = Some(handle);
    })
}

#[tokio::test]
async fn test_remote_notification_with_payload_skips_pull() {
    let server = MockServer::new();
    let slot: Arc<Mutex<Option<RemoteChangeHandle>>> = Arc::default();
    let engine = SyncEngine::new(capture_handle(SyncOptions::new(server.clone()), &slot)).await;
    let collection = Arc::new(MemoryCollection::new());
    engine
        .add_collection(collection.clone(), CollectionConfig::new("todos"))
        .await
        .unwrap();

    let handle = slot.lock().unwrap().clone().unwrap();
    handle
        .notify("todos", Some(LoadResponse::Items(vec![doc("1", "Item 1")])))
        .await
        .unwrap();

    assert_eq!(collection.fetch().await.unwrap(), vec![doc("1", "Item 1")]);
    assert_eq!(server.pull_count(), 0);
}

#[tokio::test]
async fn test_remote_notification_with_changeset_applies_deltas() {
    let server = MockServer::new();
    let slot: Arc<Mutex<Option<RemoteChangeHandle>>> = Arc::default();
    let engine = SyncEngine::new(capture_handle(SyncOptions::new(server.clone()), &slot)).await;
    let collection = Arc::new(MemoryCollection::new());
    engine
        .add_collection(collection.clone(), CollectionConfig::new("todos"))
        .await
        .unwrap();
    let handle = slot.lock().unwrap().clone().unwrap();

    handle
        .notify(
            "todos",
            Some(LoadResponse::Items(vec![
                doc("1", "Item 1"),
                doc("2", "Item 2"),
            ])),
        )
        .await
        .unwrap();
    handle
        .notify(
            "todos",
            Some(LoadResponse::Changes(Changeset {
                added: vec![],
                modified: vec![doc("1", "Updated Item 1")],
                removed: vec![ItemId::from("2")],
            })),
        )
        .await
        .unwrap();

    assert_eq!(
        collection.fetch().await.unwrap(),
        vec![doc("1", "Updated Item 1")]
    );

    // None of the applied deltas leak back upstream
    settle().await;
    assert!(server.pushes().is_empty());
}

#[tokio::test]
async fn test_remote_notification_without_payload_pulls() {
    let server = MockServer::new();
    server.seed("todos", vec![doc("1", "Item 1")]);
    let slot: Arc<Mutex<Option<RemoteChangeHandle>>> = Arc::default();
    let engine = SyncEngine::new(capture_handle(SyncOptions::new(server.clone()), &slot)).await;
    let collection = Arc::new(MemoryCollection::new());
    engine
        .add_collection(collection.clone(), CollectionConfig::new("todos"))
        .await
        .unwrap();

    let handle = slot.lock().unwrap().clone().unwrap();
    handle.notify("todos", None).await.unwrap();

    assert_eq!(collection.fetch().await.unwrap(), vec![doc("1", "Item 1")]);
    assert_eq!(server.pull_count(), 1);
}

#[tokio::test]
async fn test_notification_after_dispose_is_rejected() {
    let server = MockServer::new();
    let slot: Arc<Mutex<Option<RemoteChangeHandle>>> = Arc::default();
    let engine = SyncEngine::new(capture_handle(SyncOptions::new(server.clone()), &slot)).await;
    let handle = slot.lock().unwrap().clone().unwrap();

    engine.dispose().await.unwrap();
    drop(engine);

    assert!(matches!(
        handle.notify("todos", None).await,
        Err(Error::Disposed)
    ));
}

#[tokio::test]
async fn test_ledgers_are_persisted_under_engine_id() {
    let temp = tempfile::TempDir::new().unwrap();
    let server = MockServer::new();
    server.seed("todos", vec![doc("1", "Item 1")]);

    let engine = SyncEngine::new(
        SyncOptions::new(server.clone())
            .id("app")
            .persistence(JsonFilePersistence::factory(temp.path())),
    )
    .await;
    let collection = Arc::new(MemoryCollection::new());
    engine
        .add_collection(collection, CollectionConfig::new("todos"))
        .await
        .unwrap();
    engine.sync("todos", SyncCallOptions::default()).await.unwrap();

    assert!(temp.path().join("app-sync-operations.json").exists());
    let content = std::fs::read_to_string(temp.path().join("app-snapshots.json")).unwrap();
    let snapshots: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(snapshots[0]["collection"], "todos");
    assert_eq!(snapshots[0]["items"][0]["id"], "1");
}
