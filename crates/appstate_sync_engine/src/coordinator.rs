//! Pull/push coordination across collections.
//!
//! Every flow claims its collection with [`CollectionTable::try_begin`], so at
//! most one request per collection is in flight. A flow loops "request page,
//! verify, commit" until the server reports nothing more, then resolves the
//! accumulated remote mutations against the pending local ones and dispatches
//! the winners to their handlers as one batch.

use crate::config::SyncConfig;
use crate::conflict::resolve;
use crate::error::{FailureClass, SyncError, SyncResult};
use crate::handler::{ErrorSink, HandlerRegistry, TracingErrorSink};
use crate::pending::PendingQueue;
use crate::retry::RetryScheduler;
use crate::state::{CollectionMetadata, CollectionState, CollectionTable};
use crate::store::AppStateStore;
use crate::transport::{download_verified, BlobDownloader, NoBlobDownloader, Transport};
use appstate_crypto::{
    apply_batch, decrypt_mutation, encrypt_mutation, patch_mac, record_macs, CryptoResult,
    DerivedKeys, IndexMac, IntegrityVerifier, LtHash, TrustedMutation, UntrustedMutation, ValueMac,
};
use appstate_protocol::{
    build_pull_request, build_push_request, parse_sync_response, KeyId, Mutation, MutationRecord,
    MutationsBlob, Node, Operation, PatchRecord, PatchType, SnapshotRecord, SnapshotSource,
    SyncResponse,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Flows that ended with the collection up to date.
    pub cycles_completed: u64,
    /// Remote mutations that passed verification.
    pub mutations_pulled: u64,
    /// Local mutations acknowledged by the server.
    pub mutations_pushed: u64,
    /// Mutations handed to an action handler.
    pub mutations_dispatched: u64,
    /// Index collisions between remote and pending local mutations.
    pub conflicts_resolved: u64,
    /// Retries scheduled after transient failures.
    pub retries_scheduled: u64,
    /// When a collection last finished syncing.
    pub last_sync_time: Option<Instant>,
    /// Last failure message.
    pub last_error: Option<String>,
}

/// Outcome of one flow for one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSync {
    /// The collection.
    pub patch_type: PatchType,
    /// State after the flow.
    pub state: CollectionState,
    /// Version after the flow.
    pub version: u64,
    /// Local mutations acknowledged by the server.
    pub pushed: usize,
    /// Remote mutations dispatched to handlers.
    pub dispatched: usize,
    /// Why the flow did not finish, if it did not.
    pub error: Option<SyncError>,
}

impl CollectionSync {
    fn new(patch_type: PatchType) -> Self {
        Self {
            patch_type,
            state: CollectionState::UpToDate,
            version: 0,
            pushed: 0,
            dispatched: 0,
            error: None,
        }
    }

    /// Returns true if the flow finished without error.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcomes of a multi-collection pull, ordered by patch type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// One entry per requested collection.
    pub collections: Vec<CollectionSync>,
}

impl SyncReport {
    /// Outcome for one collection.
    pub fn get(&self, patch_type: PatchType) -> Option<&CollectionSync> {
        self.collections.iter().find(|c| c.patch_type == patch_type)
    }

    /// Returns true if every collection finished without error.
    pub fn is_success(&self) -> bool {
        self.collections.iter().all(CollectionSync::is_success)
    }

    /// Collections that did not finish.
    pub fn failures(&self) -> impl Iterator<Item = &CollectionSync> {
        self.collections.iter().filter(|c| !c.is_success())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Pull,
    PushThenPull,
    /// Pull, push whatever is still queued, pull again.
    Reconcile,
}

type RetryFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn retry_collection(coordinator: Weak<SyncCoordinator>, patch_type: PatchType) -> RetryFuture {
    Box::pin(async move {
        if let Some(coordinator) = coordinator.upgrade() {
            coordinator.run_flow(patch_type, Flow::Reconcile).await;
        }
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct OpenedRecords {
    macs: Vec<(Operation, IndexMac, ValueMac)>,
    mutations: Vec<UntrustedMutation>,
}

/// Drives pulls and pushes for every collection.
///
/// Public flows take `self: &Arc<Self>` because failed flows schedule
/// retries that hold a weak reference back to the coordinator.
pub struct SyncCoordinator {
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    downloader: Arc<dyn BlobDownloader>,
    store: Arc<dyn AppStateStore>,
    handlers: Arc<dyn HandlerRegistry>,
    error_sink: Arc<dyn ErrorSink>,
    collections: CollectionTable,
    pending: Mutex<PendingQueue>,
    retries: RetryScheduler,
    stats: RwLock<SyncStats>,
}

impl SyncCoordinator {
    /// Creates a coordinator without blob support that reports failures
    /// through `tracing`.
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn AppStateStore>,
        handlers: Arc<dyn HandlerRegistry>,
    ) -> Self {
        let retries = RetryScheduler::new(config.retry.clone());
        Self {
            config,
            transport,
            downloader: Arc::new(NoBlobDownloader),
            store,
            handlers,
            error_sink: Arc::new(TracingErrorSink),
            collections: CollectionTable::new(),
            pending: Mutex::new(PendingQueue::new()),
            retries,
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Uses `downloader` for external mutation blobs and snapshots.
    pub fn with_blob_downloader(mut self, downloader: Arc<dyn BlobDownloader>) -> Self {
        self.downloader = downloader;
        self
    }

    /// Reports fatal failures to `sink`.
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    /// Gets the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Gets a collection's metadata, loading it from the store if needed.
    pub fn metadata(&self, patch_type: PatchType) -> SyncResult<CollectionMetadata> {
        self.ensure_loaded(patch_type)?;
        Ok(self.collections.get(patch_type))
    }

    /// Gets a collection's state.
    pub fn state(&self, patch_type: PatchType) -> SyncResult<CollectionState> {
        Ok(self.metadata(patch_type)?.state)
    }

    /// Number of local mutations not yet acknowledged by the server.
    pub fn pending_count(&self, patch_type: PatchType) -> usize {
        self.pending.lock().pending_count(patch_type)
    }

    /// Returns true if a retry is waiting for the collection.
    pub fn has_scheduled_retry(&self, patch_type: PatchType) -> bool {
        self.retries.has_pending(patch_type)
    }

    /// Queues local mutations and runs a push followed by a pull.
    ///
    /// With no mutations this flushes whatever is already queued.
    pub async fn push_patches(
        self: &Arc<Self>,
        patch_type: PatchType,
        mutations: Vec<Mutation>,
    ) -> CollectionSync {
        if let Err(error) = self
            .check_cancelled()
            .and_then(|()| self.ensure_loaded(patch_type))
        {
            return self.summarize(CollectionSync::new(patch_type), Some(error));
        }

        {
            let mut pending = self.pending.lock();
            for mutation in mutations {
                pending.enqueue(patch_type, mutation);
            }
        }
        self.collections.mark_dirty(patch_type);

        self.run_flow(patch_type, Flow::PushThenPull).await
    }

    /// Pulls the given collections.
    ///
    /// Critical collections run first, one after the other; the rest run
    /// concurrently, bounded by `max_concurrent_pulls`. A collection that
    /// still has queued local mutations pushes them between two pulls.
    pub async fn pull_patches(self: &Arc<Self>, patch_types: &[PatchType]) -> SyncReport {
        let mut requested: Vec<PatchType> = Vec::with_capacity(patch_types.len());
        for &patch_type in patch_types {
            if !requested.contains(&patch_type) {
                requested.push(patch_type);
            }
        }

        let mut report = SyncReport::default();
        for patch_type in PatchType::CRITICAL {
            if requested.contains(&patch_type) {
                let flow = self.pull_flow(patch_type);
                report.collections.push(self.run_flow(patch_type, flow).await);
            }
        }

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_pulls.max(1)));
        let mut tasks = JoinSet::new();
        for patch_type in requested.into_iter().filter(|pt| !pt.is_critical()) {
            let coordinator = Arc::clone(self);
            let permits = Arc::clone(&permits);
            let flow = self.pull_flow(patch_type);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                coordinator.run_flow(patch_type, flow).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(sync) => report.collections.push(sync),
                Err(error) => tracing::error!(%error, "collection pull task failed"),
            }
        }

        report.collections.sort_by_key(|c| c.patch_type);
        report
    }

    /// Handles a server notification that collections changed.
    pub async fn on_server_sync(self: &Arc<Self>, patch_types: &[PatchType]) -> SyncReport {
        tracing::debug!(collections = patch_types.len(), "server sync notification");
        self.pull_patches(patch_types).await
    }

    /// Retries every `Blocked` collection after new sync keys arrived.
    ///
    /// Mutations whose push was blocked are sent once the collection has
    /// caught up with the server.
    pub async fn on_sync_keys_received(self: &Arc<Self>) -> SyncReport {
        let blocked = self.collections.blocked();
        if blocked.is_empty() {
            return SyncReport::default();
        }
        tracing::info!(
            collections = blocked.len(),
            "sync keys received, unblocking collections"
        );

        for &patch_type in &blocked {
            if let Err(error) = self.reset_collection(patch_type) {
                tracing::warn!(%patch_type, %error, "could not unblock collection");
            }
        }
        self.pull_patches(&blocked).await
    }

    /// Takes a collection out of `Blocked`, `ErrorRetry` or `ErrorFatal`,
    /// keeping its version and hash.
    pub fn reset_collection(&self, patch_type: PatchType) -> SyncResult<()> {
        self.ensure_loaded(patch_type)?;
        self.retries.cancel_retry(patch_type);
        let metadata = self.collections.reset(patch_type)?;
        self.store.persist_collection_metadata(&metadata)?;
        tracing::info!(%patch_type, version = metadata.version, "collection reset");
        Ok(())
    }

    /// Forgets a collection's version, hash and MAC table, then pulls it
    /// from a fresh snapshot.
    pub async fn full_resync(
        self: &Arc<Self>,
        patch_type: PatchType,
    ) -> SyncResult<CollectionSync> {
        self.ensure_loaded(patch_type)?;
        self.retries.cancel_retry(patch_type);
        let metadata = self.collections.forget(patch_type)?;
        self.store.clear_mac_table(patch_type)?;
        self.store.persist_collection_metadata(&metadata)?;
        tracing::info!(%patch_type, "full resync requested");
        let flow = self.pull_flow(patch_type);
        Ok(self.run_flow(patch_type, flow).await)
    }

    /// Cancels every scheduled retry and refuses further flows.
    ///
    /// A request already in flight runs to completion.
    pub fn shutdown(&self) {
        self.retries.shutdown();
        tracing::info!("sync coordinator shut down");
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.retries.is_shut_down() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn ensure_loaded(&self, patch_type: PatchType) -> SyncResult<()> {
        if self.collections.contains(patch_type) {
            return Ok(());
        }
        if let Some(metadata) = self.store.collection_metadata(patch_type)? {
            self.collections.insert_if_absent(metadata);
        }
        Ok(())
    }

    fn pull_flow(&self, patch_type: PatchType) -> Flow {
        if self.pending.lock().is_empty(patch_type) {
            Flow::Pull
        } else {
            Flow::Reconcile
        }
    }

    /// Fetches a sync key and derives a fresh set of subkeys from it.
    ///
    /// Callers keep the result for one encrypt, decrypt or verify call.
    fn derive_keys(&self, key_id: &KeyId) -> SyncResult<DerivedKeys> {
        let key = self
            .store
            .sync_key(key_id)?
            .ok_or_else(|| SyncError::MissingKey {
                key_id: key_id.clone(),
            })?;
        Ok(key.derive()?)
    }

    fn persist(&self, patch_type: PatchType) -> SyncResult<()> {
        self.store
            .persist_collection_metadata(&self.collections.get(patch_type))
    }

    fn summarize(&self, mut summary: CollectionSync, error: Option<SyncError>) -> CollectionSync {
        let metadata = self.collections.get(summary.patch_type);
        summary.state = metadata.state;
        summary.version = metadata.version;
        summary.error = error;
        summary
    }

    async fn run_flow(self: &Arc<Self>, patch_type: PatchType, flow: Flow) -> CollectionSync {
        let mut summary = CollectionSync::new(patch_type);
        if let Err(error) = self
            .check_cancelled()
            .and_then(|()| self.ensure_loaded(patch_type))
        {
            return self.summarize(summary, Some(error));
        }

        let started = match self.collections.try_begin(patch_type) {
            Ok(metadata) => metadata,
            Err(state) => {
                if state.is_terminal() {
                    tracing::debug!(%patch_type, %state, "collection parked, flow skipped");
                } else {
                    tracing::debug!(%patch_type, %state, "collection busy, flow skipped");
                }
                return self.summarize(
                    summary,
                    Some(SyncError::CollectionUnavailable { patch_type, state }),
                );
            }
        };
        tracing::debug!(%patch_type, version = started.version, ?flow, "collection sync started");

        let result = self.run_stages(patch_type, flow, &mut summary).await;
        let error = self.settle(patch_type, result, &summary);
        self.summarize(summary, error)
    }

    async fn run_stages(
        &self,
        patch_type: PatchType,
        flow: Flow,
        summary: &mut CollectionSync,
    ) -> SyncResult<()> {
        match flow {
            Flow::Pull => self.pull_and_dispatch(patch_type, summary).await,
            Flow::PushThenPull => {
                self.push_pending(patch_type, summary).await?;
                self.pull_and_dispatch(patch_type, summary).await
            }
            Flow::Reconcile => {
                self.pull_and_dispatch(patch_type, summary).await?;
                let has_pending = !self.pending.lock().is_empty(patch_type);
                if has_pending {
                    self.push_pending(patch_type, summary).await?;
                    self.pull_and_dispatch(patch_type, summary).await?;
                }
                Ok(())
            }
        }
    }

    async fn round_trip(&self, request: Node) -> SyncResult<Node> {
        self.check_cancelled()?;
        let response = self.transport.send(request);
        match tokio::time::timeout(self.config.request_timeout, response).await {
            Ok(response) => response,
            Err(_) => Err(SyncError::Timeout),
        }
    }

    async fn push_pending(
        &self,
        patch_type: PatchType,
        summary: &mut CollectionSync,
    ) -> SyncResult<()> {
        let pending = self.pending.lock().pending(patch_type);
        let Some(last_seq) = pending.iter().map(|p| p.seq).max() else {
            return Ok(());
        };

        let key = self
            .store
            .latest_sync_key()?
            .ok_or(SyncError::NoSyncKey { patch_type })?;
        let local = self.collections.get(patch_type);
        let version = local.version + 1;

        let (patch, update) = {
            let encrypted = pending
                .iter()
                .map(|p| {
                    let keys = key.derive()?;
                    encrypt_mutation(&p.mutation, key.id(), &keys, self.config.max_padding)
                })
                .collect::<CryptoResult<Vec<_>>>()?;

            let mut previous = HashMap::new();
            for e in &encrypted {
                if let Some(value_mac) = self.store.value_mac(patch_type, &e.index_mac)? {
                    previous.insert(e.index_mac, value_mac);
                }
            }
            let update = apply_batch(
                &local.hash,
                encrypted
                    .iter()
                    .map(|e| (e.record.operation, &e.index_mac, &e.value_mac)),
                |index_mac| previous.get(index_mac).copied(),
            );

            let keys = key.derive()?;
            let patch = PatchRecord {
                version,
                patch_mac: patch_mac(&keys, &update.hash, version, patch_type).to_vec(),
                mutations: encrypted.into_iter().map(|e| e.record).collect(),
                external_mutations: None,
                key_id: key.id().clone(),
                device_index: None,
            };
            (patch, update)
        };

        let request = build_push_request(patch_type, local.version, &patch)?;
        let response = self.round_trip(request).await?;
        let response = parse_sync_response(&response, patch_type)?;

        self.pending.lock().acknowledge_up_to(patch_type, last_seq);
        summary.pushed += pending.len();
        self.stats.write().mutations_pushed += pending.len() as u64;

        if response.version == version {
            self.store.apply_mac_changes(patch_type, &update.changes)?;
            self.collections.commit(patch_type, version, update.hash)?;
            self.persist(patch_type)?;
            tracing::debug!(%patch_type, version, mutations = pending.len(), "push confirmed");
        } else {
            tracing::debug!(
                %patch_type,
                expected = version,
                confirmed = response.version,
                "push confirmed at another version, pull will reconcile"
            );
        }
        Ok(())
    }

    async fn pull_and_dispatch(
        &self,
        patch_type: PatchType,
        summary: &mut CollectionSync,
    ) -> SyncResult<()> {
        let mut accepted = Vec::new();
        let result = self.pull_pages(patch_type, &mut accepted).await;
        // Pages committed before a failure are still dispatched.
        self.dispatch(patch_type, accepted, summary);
        result
    }

    async fn pull_pages(
        &self,
        patch_type: PatchType,
        accepted: &mut Vec<TrustedMutation>,
    ) -> SyncResult<()> {
        loop {
            let before = self.collections.get(patch_type).version;
            let response = self.round_trip(build_pull_request(patch_type, before)).await?;
            let response = parse_sync_response(&response, patch_type)?;
            let has_more = response.has_more;
            let server_version = response.version;

            self.apply_response(patch_type, response, accepted).await?;

            let after = self.collections.get(patch_type).version;
            if after != server_version {
                tracing::debug!(
                    %patch_type,
                    local = after,
                    server = server_version,
                    "page applied"
                );
            }
            if !has_more {
                return Ok(());
            }
            if after == before {
                return Err(SyncError::Protocol(format!(
                    "{patch_type} reported more patches without advancing past version {before}"
                )));
            }

            self.collections.mark_pending(patch_type)?;
            self.persist(patch_type)?;
            tracing::debug!(%patch_type, version = after, "more patches pending");
            self.collections.continue_paging(patch_type)?;
        }
    }

    async fn apply_response(
        &self,
        patch_type: PatchType,
        response: SyncResponse,
        accepted: &mut Vec<TrustedMutation>,
    ) -> SyncResult<()> {
        if let Some(source) = response.snapshot {
            let snapshot = match source {
                SnapshotSource::Inline(record) => record,
                SnapshotSource::External(reference) => {
                    let bytes = download_verified(self.downloader.as_ref(), &reference).await?;
                    SnapshotRecord::decode(&bytes)?
                }
            };
            self.apply_snapshot(patch_type, snapshot, accepted)?;
        }

        for patch in &response.patches {
            let external = match &patch.external_mutations {
                Some(reference) => {
                    let bytes = download_verified(self.downloader.as_ref(), reference).await?;
                    MutationsBlob::decode(&bytes)?.mutations
                }
                None => Vec::new(),
            };
            self.apply_patch(patch_type, patch, &external, accepted)?;
        }
        Ok(())
    }

    fn open_records<'r>(
        &self,
        patch_type: PatchType,
        records: impl IntoIterator<Item = &'r MutationRecord>,
    ) -> SyncResult<OpenedRecords> {
        let mut opened = OpenedRecords {
            macs: Vec::new(),
            mutations: Vec::new(),
        };
        for record in records {
            let (index_mac, value_mac) = match record_macs(record) {
                Ok(macs) => macs,
                Err(error) => {
                    tracing::warn!(%patch_type, %error, "skipping malformed record");
                    continue;
                }
            };
            opened.macs.push((record.operation, index_mac, value_mac));

            let keys = self.derive_keys(&record.key_id)?;
            match decrypt_mutation(record, &keys) {
                Ok(mutation) => opened.mutations.push(mutation),
                Err(error) => {
                    tracing::warn!(
                        %patch_type,
                        key_id = %record.key_id,
                        %error,
                        "skipping undecryptable record"
                    );
                }
            }
        }
        Ok(opened)
    }

    fn apply_snapshot(
        &self,
        patch_type: PatchType,
        snapshot: SnapshotRecord,
        accepted: &mut Vec<TrustedMutation>,
    ) -> SyncResult<()> {
        let local = self.collections.get(patch_type);
        if local.version > 0 && snapshot.version <= local.version {
            tracing::warn!(
                %patch_type,
                local = local.version,
                snapshot = snapshot.version,
                "skipping stale snapshot"
            );
            return Ok(());
        }

        let opened = self.open_records(patch_type, &snapshot.records)?;
        let update = apply_batch(
            &LtHash::EMPTY,
            opened
                .macs
                .iter()
                .map(|(op, index_mac, value_mac)| (*op, index_mac, value_mac)),
            |_| None,
        );

        let verifier = IntegrityVerifier::with_skip(self.store.skip_mac_verification());
        let keys = self.derive_keys(&snapshot.key_id)?;
        let trusted = verifier.verify_snapshot(
            &keys,
            patch_type,
            snapshot.version,
            &update.hash,
            &snapshot.mac,
            opened.mutations,
        )?;

        self.store.clear_mac_table(patch_type)?;
        self.store.apply_mac_changes(patch_type, &update.changes)?;
        self.collections.commit(patch_type, snapshot.version, update.hash)?;
        self.persist(patch_type)?;

        tracing::debug!(
            %patch_type,
            version = snapshot.version,
            records = trusted.len(),
            "snapshot applied"
        );
        self.stats.write().mutations_pulled += trusted.len() as u64;
        accepted.extend(trusted);
        Ok(())
    }

    fn apply_patch(
        &self,
        patch_type: PatchType,
        patch: &PatchRecord,
        external: &[MutationRecord],
        accepted: &mut Vec<TrustedMutation>,
    ) -> SyncResult<()> {
        let local = self.collections.get(patch_type);
        if patch.version <= local.version {
            tracing::warn!(
                %patch_type,
                local = local.version,
                patch = patch.version,
                "skipping stale patch"
            );
            return Ok(());
        }

        let opened = self.open_records(patch_type, patch.mutations.iter().chain(external))?;

        let mut previous = HashMap::new();
        for (_, index_mac, _) in &opened.macs {
            if previous.contains_key(index_mac) {
                continue;
            }
            if let Some(value_mac) = self.store.value_mac(patch_type, index_mac)? {
                previous.insert(*index_mac, value_mac);
            }
        }
        let update = apply_batch(
            &local.hash,
            opened
                .macs
                .iter()
                .map(|(op, index_mac, value_mac)| (*op, index_mac, value_mac)),
            |index_mac| previous.get(index_mac).copied(),
        );
        if update.missing_previous > 0 {
            tracing::warn!(
                %patch_type,
                version = patch.version,
                missing = update.missing_previous,
                "removes without a known previous value"
            );
        }

        let verifier = IntegrityVerifier::with_skip(self.store.skip_mac_verification());
        let keys = self.derive_keys(&patch.key_id)?;
        let trusted = verifier.verify_patch(
            &keys,
            patch_type,
            patch.version,
            &update.hash,
            &patch.patch_mac,
            opened.mutations,
        )?;

        self.store.apply_mac_changes(patch_type, &update.changes)?;
        self.collections.commit(patch_type, patch.version, update.hash)?;
        self.persist(patch_type)?;

        tracing::debug!(
            %patch_type,
            version = patch.version,
            mutations = trusted.len(),
            "patch applied"
        );
        self.stats.write().mutations_pulled += trusted.len() as u64;
        accepted.extend(trusted);
        Ok(())
    }

    fn dispatch(
        &self,
        patch_type: PatchType,
        accepted: Vec<TrustedMutation>,
        summary: &mut CollectionSync,
    ) {
        if accepted.is_empty() {
            return;
        }

        let resolution = {
            let mut pending = self.pending.lock();
            let local = pending.pending(patch_type);
            let resolution = resolve(accepted, &local);
            let superseded: Vec<u64> = resolution
                .superseded_local
                .iter()
                .map(|&pos| local[pos].seq)
                .collect();
            pending.remove(patch_type, &superseded);
            resolution
        };
        let conflicts = resolution.conflicts();
        if conflicts > 0 {
            tracing::debug!(%patch_type, conflicts, "resolved conflicts with pending mutations");
        }

        let mut dispatched = 0;
        for mutation in resolution.into_remote() {
            let action = mutation.mutation().action_name();
            match self.handlers.find_handler(action) {
                Some(handler) => match handler.apply(patch_type, &mutation) {
                    Ok(()) => dispatched += 1,
                    Err(error) => {
                        tracing::warn!(%patch_type, action, %error, "action handler failed");
                        self.error_sink.report_failure(action, &error);
                    }
                },
                None => tracing::debug!(%patch_type, action, "no handler registered"),
            }
        }

        summary.dispatched += dispatched;
        let mut stats = self.stats.write();
        stats.mutations_dispatched += dispatched as u64;
        stats.conflicts_resolved += conflicts as u64;
    }

    fn settle(
        self: &Arc<Self>,
        patch_type: PatchType,
        result: SyncResult<()>,
        summary: &CollectionSync,
    ) -> Option<SyncError> {
        let now = now_millis();
        let error = match result {
            Ok(()) => match self.collections.finish(patch_type, now) {
                Ok(metadata) => {
                    let has_pending = !self.pending.lock().is_empty(patch_type);
                    if has_pending {
                        self.collections.mark_dirty(patch_type);
                    }
                    self.retries.cancel_retry(patch_type);
                    {
                        let mut stats = self.stats.write();
                        stats.cycles_completed += 1;
                        stats.last_sync_time = Some(Instant::now());
                        stats.last_error = None;
                    }
                    tracing::info!(
                        %patch_type,
                        version = metadata.version,
                        pushed = summary.pushed,
                        dispatched = summary.dispatched,
                        "collection synced"
                    );
                    None
                }
                Err(error) => Some(error),
            },
            Err(error) => Some(self.fail(patch_type, error, now)),
        };

        if let Err(persist_error) = self.persist(patch_type) {
            tracing::error!(
                %patch_type,
                error = %persist_error,
                "could not persist collection metadata"
            );
            self.error_sink.report_failure(patch_type.as_str(), &persist_error);
        }
        error
    }

    fn fail(self: &Arc<Self>, patch_type: PatchType, error: SyncError, now: u64) -> SyncError {
        self.stats.write().last_error = Some(error.to_string());

        let transition = match error.failure_class() {
            FailureClass::MissingKey => {
                tracing::warn!(%patch_type, %error, "collection blocked until the key arrives");
                self.collections.block(patch_type, now).map(|_| error)
            }
            FailureClass::Transient => {
                self.collections
                    .fail_retry(patch_type, now)
                    .map(|metadata| {
                        let attempt = metadata.retry_count;
                        let coordinator = Arc::downgrade(self);
                        let scheduled = self.retries.schedule_retry(patch_type, attempt, move || {
                            retry_collection(coordinator, patch_type)
                        });
                        if scheduled {
                            tracing::warn!(
                                %patch_type,
                                attempt,
                                %error,
                                "transient failure, retry scheduled"
                            );
                            self.stats.write().retries_scheduled += 1;
                            error
                        } else {
                            let exhausted = SyncError::RetriesExhausted {
                                patch_type,
                                attempts: attempt,
                                last_error: error.to_string(),
                            };
                            self.give_up(patch_type, exhausted, now)
                        }
                    })
            }
            FailureClass::Integrity | FailureClass::Fatal => {
                Ok(self.give_up(patch_type, error, now))
            }
        };

        transition.unwrap_or_else(|transition_error| {
            tracing::error!(
                %patch_type,
                error = %transition_error,
                "collection state transition failed"
            );
            self.error_sink.report_failure(patch_type.as_str(), &transition_error);
            transition_error
        })
    }

    fn give_up(&self, patch_type: PatchType, error: SyncError, now: u64) -> SyncError {
        self.retries.cancel_retry(patch_type);
        if let Err(transition_error) = self.collections.fail_fatal(patch_type, now) {
            tracing::error!(
                %patch_type,
                error = %transition_error,
                "collection state transition failed"
            );
        }
        tracing::error!(%patch_type, %error, "collection sync abandoned");
        self.error_sink.report_failure(patch_type.as_str(), &error);
        error
    }
}
