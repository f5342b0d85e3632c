//! An in-memory authoritative sync server.
//!
//! The server encrypts its own mutations with a [`SyncKey`], keeps the
//! collection hash and patch history, pages responses and accepts pushes
//! whose base version matches its own. It never decrypts pushed records;
//! their wire MACs are enough to keep the hash.

use crate::blobs::BlobHost;
use appstate_crypto::{
    apply_batch, encrypt_mutation, patch_mac, record_macs, snapshot_mac, IndexMac, LtHash,
    SyncKey, ValueMac,
};
use appstate_protocol::{
    build_error_response, parse_sync_request, Mutation, MutationRecord, MutationsBlob, Node,
    Operation, PatchRecord, PatchType, ProtocolError, ProtocolResult, SnapshotRecord,
    SnapshotSource, SyncRequest, SyncResponse,
};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct ServerCollection {
    version: u64,
    hash: LtHash,
    live: HashMap<IndexMac, (ValueMac, MutationRecord)>,
    patches: Vec<PatchRecord>,
}

impl ServerCollection {
    /// Hashes `records` on top of the current state and returns the new hash.
    fn hash_after(&self, records: &[MutationRecord]) -> ProtocolResult<LtHash> {
        let macs = wire_macs(records)?;
        let update = apply_batch(
            &self.hash,
            macs.iter()
                .map(|(op, index_mac, value_mac)| (*op, index_mac, value_mac)),
            |index_mac| self.live.get(index_mac).map(|(value_mac, _)| *value_mac),
        );
        Ok(update.hash)
    }

    fn commit(
        &mut self,
        patch: PatchRecord,
        records: &[MutationRecord],
        hash: LtHash,
    ) -> ProtocolResult<()> {
        for (record, (_, index_mac, value_mac)) in records.iter().zip(wire_macs(records)?) {
            match record.operation {
                Operation::Set => {
                    self.live.insert(index_mac, (value_mac, record.clone()));
                }
                Operation::Remove => {
                    self.live.remove(&index_mac);
                }
            }
        }
        self.version = patch.version;
        self.hash = hash;
        self.patches.push(patch);
        Ok(())
    }
}

fn wire_macs(records: &[MutationRecord]) -> ProtocolResult<Vec<(Operation, IndexMac, ValueMac)>> {
    records
        .iter()
        .map(|record| {
            let (index_mac, value_mac) =
                record_macs(record).map_err(|e| ProtocolError::malformed(e.to_string()))?;
            Ok((record.operation, index_mac, value_mac))
        })
        .collect()
}

struct ServerState {
    key: SyncKey,
    collections: HashMap<PatchType, ServerCollection>,
    requests: Vec<SyncRequest>,
    failures: HashMap<PatchType, (u16, usize)>,
    page_size: usize,
    snapshot_on_first_sync: bool,
    external_snapshots: bool,
}

/// Fake server speaking the sync request/response documents.
pub struct FakeServer {
    state: Mutex<ServerState>,
    blobs: BlobHost,
}

impl FakeServer {
    /// Creates a server that encrypts with `key`.
    ///
    /// Defaults: unlimited page size, snapshots on first sync, snapshots
    /// inline.
    pub fn new(key: SyncKey) -> Self {
        Self {
            state: Mutex::new(ServerState {
                key,
                collections: HashMap::new(),
                requests: Vec::new(),
                failures: HashMap::new(),
                page_size: usize::MAX,
                snapshot_on_first_sync: true,
                external_snapshots: false,
            }),
            blobs: BlobHost::new(),
        }
    }

    /// The blob host backing external mutations and snapshots.
    pub fn blobs(&self) -> &BlobHost {
        &self.blobs
    }

    /// Maximum number of patches per response.
    pub fn set_page_size(&self, page_size: usize) {
        self.state.lock().page_size = page_size.max(1);
    }

    /// Whether a first sync is answered with a snapshot instead of patches.
    pub fn set_snapshot_on_first_sync(&self, enabled: bool) {
        self.state.lock().snapshot_on_first_sync = enabled;
    }

    /// Whether snapshots are served through the blob host.
    pub fn set_external_snapshots(&self, enabled: bool) {
        self.state.lock().external_snapshots = enabled;
    }

    /// Encrypts future server-side mutations with `key`.
    pub fn rotate_key(&self, key: SyncKey) {
        self.state.lock().key = key;
    }

    /// Answers the next `count` requests for `patch_type` with error `code`.
    pub fn fail_next(&self, patch_type: PatchType, code: u16, count: usize) {
        self.state.lock().failures.insert(patch_type, (code, count));
    }

    /// Adds a patch written by another device. Returns its version.
    pub fn add_remote_patch(&self, patch_type: PatchType, mutations: Vec<Mutation>) -> u64 {
        self.add_patch(patch_type, mutations, false)
    }

    /// Adds a patch whose mutations live in the blob host. Returns its version.
    pub fn add_external_patch(&self, patch_type: PatchType, mutations: Vec<Mutation>) -> u64 {
        self.add_patch(patch_type, mutations, true)
    }

    fn add_patch(&self, patch_type: PatchType, mutations: Vec<Mutation>, external: bool) -> u64 {
        let mut state = self.state.lock();
        let keys = state.key.derive().expect("server key derives");
        let key_id = state.key.id().clone();

        let records: Vec<MutationRecord> = mutations
            .iter()
            .map(|m| {
                encrypt_mutation(m, &key_id, &keys, 0)
                    .expect("server mutation encrypts")
                    .record
            })
            .collect();

        let collection = state.collections.entry(patch_type).or_default();
        let version = collection.version + 1;
        let hash = collection.hash_after(&records).expect("server records are well formed");

        let (inline, external_mutations) = if external {
            let blob = MutationsBlob {
                mutations: records.clone(),
            }
            .encode()
            .expect("mutations blob encodes");
            (Vec::new(), Some(self.blobs.upload(blob)))
        } else {
            (records.clone(), None)
        };

        let patch = PatchRecord {
            version,
            mutations: inline,
            external_mutations,
            patch_mac: patch_mac(&keys, &hash, version, patch_type).to_vec(),
            key_id,
            device_index: Some(1),
        };
        collection
            .commit(patch, &records, hash)
            .expect("server records are well formed");
        version
    }

    /// Flips one bit of the stored MAC of patch `version`.
    pub fn tamper_patch_mac(&self, patch_type: PatchType, version: u64) {
        let mut state = self.state.lock();
        let patch = state
            .collections
            .get_mut(&patch_type)
            .and_then(|c| c.patches.iter_mut().find(|p| p.version == version))
            .expect("patch exists");
        patch.patch_mac[0] ^= 0x01;
    }

    /// Current version of a collection.
    pub fn version(&self, patch_type: PatchType) -> u64 {
        self.state
            .lock()
            .collections
            .get(&patch_type)
            .map_or(0, |c| c.version)
    }

    /// Current hash of a collection.
    pub fn hash(&self, patch_type: PatchType) -> LtHash {
        self.state
            .lock()
            .collections
            .get(&patch_type)
            .map_or(LtHash::EMPTY, |c| c.hash)
    }

    /// Number of live SETs in a collection.
    pub fn live_count(&self, patch_type: PatchType) -> usize {
        self.state
            .lock()
            .collections
            .get(&patch_type)
            .map_or(0, |c| c.live.len())
    }

    /// Every request handled so far, in arrival order.
    pub fn requests(&self) -> Vec<SyncRequest> {
        self.state.lock().requests.clone()
    }

    /// Order in which collections were first requested.
    pub fn request_order(&self) -> Vec<PatchType> {
        let mut order = Vec::new();
        for request in &self.state.lock().requests {
            if !order.contains(&request.patch_type) {
                order.push(request.patch_type);
            }
        }
        order
    }

    /// Handles one request document.
    pub fn handle(&self, request: &Node) -> ProtocolResult<Node> {
        let request = parse_sync_request(request)?;
        let patch_type = request.patch_type;

        let mut state = self.state.lock();
        state.requests.push(request.clone());

        if let Some((code, remaining)) = state.failures.get_mut(&patch_type) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(build_error_response(patch_type, *code, "injected failure"));
            }
        }

        if let Some(patch) = request.patches.first() {
            return self.accept_push(&mut state, &request, patch);
        }
        self.serve_pull(&state, &request)
    }

    fn accept_push(
        &self,
        state: &mut ServerState,
        request: &SyncRequest,
        patch: &PatchRecord,
    ) -> ProtocolResult<Node> {
        let patch_type = request.patch_type;
        let collection = state.collections.entry(patch_type).or_default();
        let base = request.version.unwrap_or(0);
        if base != collection.version {
            return Ok(build_error_response(patch_type, 409, "conflict"));
        }

        let hash = collection.hash_after(&patch.mutations)?;
        let mut stored = patch.clone();
        stored.version = collection.version + 1;
        let version = stored.version;
        let records = patch.mutations.clone();
        collection.commit(stored, &records, hash)?;

        SyncResponse::new(patch_type, version).to_node()
    }

    fn serve_pull(&self, state: &ServerState, request: &SyncRequest) -> ProtocolResult<Node> {
        let patch_type = request.patch_type;
        let Some(collection) = state.collections.get(&patch_type) else {
            return SyncResponse::new(patch_type, 0).to_node();
        };

        let since = request.version.unwrap_or(0);
        if request.return_snapshot && state.snapshot_on_first_sync && collection.version > 0 {
            return self.serve_snapshot(state, patch_type, collection);
        }

        let remaining: Vec<&PatchRecord> = collection
            .patches
            .iter()
            .filter(|p| p.version > since)
            .collect();
        let has_more = remaining.len() > state.page_size;
        let page: Vec<PatchRecord> = remaining
            .into_iter()
            .take(state.page_size)
            .cloned()
            .collect();

        let mut response = SyncResponse::new(
            patch_type,
            if has_more {
                page.last().map_or(since, |p| p.version)
            } else {
                collection.version
            },
        );
        response.has_more = has_more;
        response.patches = page;
        response.to_node()
    }

    fn serve_snapshot(
        &self,
        state: &ServerState,
        patch_type: PatchType,
        collection: &ServerCollection,
    ) -> ProtocolResult<Node> {
        let keys = state
            .key
            .derive()
            .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
        let snapshot = SnapshotRecord {
            version: collection.version,
            records: collection.live.values().map(|(_, record)| record.clone()).collect(),
            mac: snapshot_mac(&keys, &collection.hash, collection.version, patch_type).to_vec(),
            key_id: state.key.id().clone(),
        };

        let mut response = SyncResponse::new(patch_type, collection.version);
        response.snapshot = Some(if state.external_snapshots {
            SnapshotSource::External(self.blobs.upload(snapshot.encode()?))
        } else {
            SnapshotSource::Inline(snapshot)
        });
        response.to_node()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{archive, sync_key};
    use appstate_protocol::{build_pull_request, build_push_request, parse_sync_response};

    #[test]
    fn pages_patches() {
        let server = FakeServer::new(sync_key(1));
        for i in 0..5 {
            let jid = format!("{i}@s.whatsapp.net");
            server.add_remote_patch(PatchType::Regular, vec![archive(&jid, i)]);
        }
        server.set_page_size(2);
        server.set_snapshot_on_first_sync(false);

        let node = server.handle(&build_pull_request(PatchType::Regular, 0)).unwrap();
        let first = parse_sync_response(&node, PatchType::Regular).unwrap();
        assert!(first.has_more);
        assert_eq!(first.version, 2);
        assert_eq!(first.patches.len(), 2);

        let node = server.handle(&build_pull_request(PatchType::Regular, 4)).unwrap();
        let last = parse_sync_response(&node, PatchType::Regular).unwrap();
        assert!(!last.has_more);
        assert_eq!(last.version, 5);
        assert_eq!(last.patches.len(), 1);
    }

    #[test]
    fn first_sync_gets_snapshot_of_live_values() {
        let server = FakeServer::new(sync_key(1));
        server.add_remote_patch(PatchType::Regular, vec![archive("a@s.whatsapp.net", 1)]);
        server.add_remote_patch(PatchType::Regular, vec![archive("a@s.whatsapp.net", 2)]);

        let node = server.handle(&build_pull_request(PatchType::Regular, 0)).unwrap();
        let response = parse_sync_response(&node, PatchType::Regular).unwrap();
        match response.snapshot {
            Some(SnapshotSource::Inline(snapshot)) => {
                assert_eq!(snapshot.version, 2);
                assert_eq!(snapshot.records.len(), 1);
            }
            other => panic!("expected inline snapshot, got {other:?}"),
        }
        assert_eq!(server.live_count(PatchType::Regular), 1);
    }

    #[test]
    fn push_requires_current_base_version() {
        let server = FakeServer::new(sync_key(1));
        server.add_remote_patch(PatchType::Regular, vec![archive("a@s.whatsapp.net", 1)]);

        let patch = PatchRecord {
            version: 1,
            mutations: Vec::new(),
            external_mutations: None,
            patch_mac: vec![0; 32],
            key_id: sync_key(1).id().clone(),
            device_index: None,
        };
        let stale = server
            .handle(&build_push_request(PatchType::Regular, 0, &patch).unwrap())
            .unwrap();
        assert!(matches!(
            parse_sync_response(&stale, PatchType::Regular),
            Err(ProtocolError::ServerError { code: 409, .. })
        ));

        let accepted = server
            .handle(&build_push_request(PatchType::Regular, 1, &patch).unwrap())
            .unwrap();
        assert_eq!(parse_sync_response(&accepted, PatchType::Regular).unwrap().version, 2);
        assert_eq!(server.version(PatchType::Regular), 2);
    }

    #[test]
    fn injected_failures_run_out() {
        let server = FakeServer::new(sync_key(1));
        server.fail_next(PatchType::RegularLow, 503, 1);

        let request = build_pull_request(PatchType::RegularLow, 0);
        let failed = server.handle(&request).unwrap();
        assert!(parse_sync_response(&failed, PatchType::RegularLow).is_err());
        let ok = server.handle(&request).unwrap();
        assert!(parse_sync_response(&ok, PatchType::RegularLow).is_ok());
        assert_eq!(server.requests().len(), 2);
    }
}
