//! Shared harness: a device wired to a fake server.

#![allow(dead_code)]

use appstate_crypto::{IndexMac, MacChange, SyncKey, ValueMac};
use appstate_protocol::{action_names, ExternalBlobReference, KeyId, Node, PatchType};
use appstate_sync_engine::{
    AppStateStore, BlobDownloader, CollectionMetadata, CollectionState, HandlerMap, MemoryStore,
    RecordingErrorSink, RecordingHandler, SyncConfig, SyncCoordinator, SyncError, SyncResult,
    Transport,
};
use appstate_testkit::FakeServer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A transport that connects to an in-memory server.
pub struct InMemoryTransport {
    server: Arc<FakeServer>,
}

impl InMemoryTransport {
    pub fn new(server: Arc<FakeServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, request: Node) -> SyncResult<Node> {
        Ok(self.server.handle(&request)?)
    }
}

#[async_trait]
impl BlobDownloader for InMemoryTransport {
    async fn download(&self, reference: &ExternalBlobReference) -> SyncResult<Vec<u8>> {
        self.server
            .blobs()
            .fetch(reference)
            .ok_or_else(|| {
                SyncError::transport_retryable(format!("{} not found", reference.direct_path))
            })
    }
}

/// One client device.
pub struct Device {
    pub coordinator: Arc<SyncCoordinator>,
    pub store: Arc<MemoryStore>,
    pub handler: Arc<RecordingHandler>,
    pub sink: Arc<RecordingErrorSink>,
}

impl Device {
    pub fn new(server: &Arc<FakeServer>, config: SyncConfig, keys: Vec<SyncKey>) -> Self {
        let store = Arc::new(MemoryStore::new());
        for key in keys {
            store.add_sync_key(key);
        }

        let handler = Arc::new(RecordingHandler::new());
        let handlers = Arc::new(HandlerMap::new());
        for action in [
            action_names::ARCHIVE,
            action_names::PIN,
            action_names::MUTE,
            action_names::STAR,
            action_names::MARK_READ,
        ] {
            handlers.register(action, handler.clone());
        }

        let transport = Arc::new(InMemoryTransport::new(Arc::clone(server)));
        let sink = Arc::new(RecordingErrorSink::new());
        let coordinator = SyncCoordinator::new(config, transport.clone(), store.clone(), handlers)
            .with_blob_downloader(transport)
            .with_error_sink(sink.clone());

        Self {
            coordinator: Arc::new(coordinator),
            store,
            handler,
            sink,
        }
    }
}

/// A memory store that remembers every state persisted for a collection
/// and counts sync key lookups.
#[derive(Default)]
pub struct StateLog {
    pub inner: MemoryStore,
    states: Mutex<Vec<(PatchType, CollectionState)>>,
    key_lookups: AtomicUsize,
}

impl StateLog {
    pub fn key_lookups(&self) -> usize {
        self.key_lookups.load(Ordering::SeqCst)
    }

    pub fn states(&self, patch_type: PatchType) -> Vec<CollectionState> {
        self.states
            .lock()
            .iter()
            .filter(|(pt, _)| *pt == patch_type)
            .map(|(_, state)| *state)
            .collect()
    }
}

impl AppStateStore for StateLog {
    fn sync_key(&self, key_id: &KeyId) -> SyncResult<Option<SyncKey>> {
        self.key_lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.sync_key(key_id)
    }

    fn latest_sync_key(&self) -> SyncResult<Option<SyncKey>> {
        self.inner.latest_sync_key()
    }

    fn collection_metadata(&self, patch_type: PatchType) -> SyncResult<Option<CollectionMetadata>> {
        self.inner.collection_metadata(patch_type)
    }

    fn persist_collection_metadata(&self, metadata: &CollectionMetadata) -> SyncResult<()> {
        self.states.lock().push((metadata.name, metadata.state));
        self.inner.persist_collection_metadata(metadata)
    }

    fn value_mac(
        &self,
        patch_type: PatchType,
        index_mac: &IndexMac,
    ) -> SyncResult<Option<ValueMac>> {
        self.inner.value_mac(patch_type, index_mac)
    }

    fn apply_mac_changes(&self, patch_type: PatchType, changes: &[MacChange]) -> SyncResult<()> {
        self.inner.apply_mac_changes(patch_type, changes)
    }

    fn clear_mac_table(&self, patch_type: PatchType) -> SyncResult<()> {
        self.inner.clear_mac_table(patch_type)
    }
}
