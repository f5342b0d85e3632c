//! Persistent store abstraction and an in-memory implementation.

use crate::error::SyncResult;
use crate::state::CollectionMetadata;
use appstate_crypto::{IndexMac, MacChange, SyncKey, ValueMac};
use appstate_protocol::{KeyId, PatchType};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Storage for sync keys, collection metadata and the per-collection
/// index→value-MAC tables.
///
/// Implementations must make each call atomic. The engine never holds
/// store state across calls.
pub trait AppStateStore: Send + Sync {
    /// Looks up a sync key by ID.
    fn sync_key(&self, key_id: &KeyId) -> SyncResult<Option<SyncKey>>;

    /// Returns the newest sync key, used to encrypt pushes.
    fn latest_sync_key(&self) -> SyncResult<Option<SyncKey>>;

    /// Loads persisted metadata for a collection.
    fn collection_metadata(&self, patch_type: PatchType) -> SyncResult<Option<CollectionMetadata>>;

    /// Persists a collection's metadata.
    fn persist_collection_metadata(&self, metadata: &CollectionMetadata) -> SyncResult<()>;

    /// Value MAC of the live SET at `index_mac`, if any.
    fn value_mac(
        &self,
        patch_type: PatchType,
        index_mac: &IndexMac,
    ) -> SyncResult<Option<ValueMac>>;

    /// Applies changes produced by hashing a patch or push.
    fn apply_mac_changes(&self, patch_type: PatchType, changes: &[MacChange]) -> SyncResult<()>;

    /// Forgets every value MAC of a collection (before a snapshot).
    fn clear_mac_table(&self, patch_type: PatchType) -> SyncResult<()>;

    /// Turns off snapshot and patch MAC verification.
    fn skip_mac_verification(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct StoreState {
    keys: HashMap<KeyId, SyncKey>,
    metadata: HashMap<PatchType, CollectionMetadata>,
    mac_tables: HashMap<PatchType, HashMap<IndexMac, ValueMac>>,
}

/// An in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    skip_mac_verification: bool,
}

impl MemoryStore {
    /// Creates an empty store that verifies MACs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with MAC verification turned off.
    pub fn without_mac_verification() -> Self {
        Self {
            state: RwLock::default(),
            skip_mac_verification: true,
        }
    }

    /// Adds a sync key, as delivered by the key-share flow.
    pub fn add_sync_key(&self, key: SyncKey) {
        self.state.write().keys.insert(key.id().clone(), key);
    }

    /// Number of live entries in a collection's MAC table.
    pub fn mac_table_len(&self, patch_type: PatchType) -> usize {
        self.state
            .read()
            .mac_tables
            .get(&patch_type)
            .map_or(0, HashMap::len)
    }
}

impl AppStateStore for MemoryStore {
    fn sync_key(&self, key_id: &KeyId) -> SyncResult<Option<SyncKey>> {
        Ok(self.state.read().keys.get(key_id).cloned())
    }

    fn latest_sync_key(&self) -> SyncResult<Option<SyncKey>> {
        Ok(self
            .state
            .read()
            .keys
            .values()
            .max_by(|a, b| {
                a.timestamp()
                    .cmp(&b.timestamp())
                    .then_with(|| a.id().cmp(b.id()))
            })
            .cloned())
    }

    fn collection_metadata(&self, patch_type: PatchType) -> SyncResult<Option<CollectionMetadata>> {
        Ok(self.state.read().metadata.get(&patch_type).cloned())
    }

    fn persist_collection_metadata(&self, metadata: &CollectionMetadata) -> SyncResult<()> {
        self.state
            .write()
            .metadata
            .insert(metadata.name, metadata.clone());
        Ok(())
    }

    fn value_mac(
        &self,
        patch_type: PatchType,
        index_mac: &IndexMac,
    ) -> SyncResult<Option<ValueMac>> {
        Ok(self
            .state
            .read()
            .mac_tables
            .get(&patch_type)
            .and_then(|table| table.get(index_mac))
            .copied())
    }

    fn apply_mac_changes(&self, patch_type: PatchType, changes: &[MacChange]) -> SyncResult<()> {
        let mut state = self.state.write();
        let table = state.mac_tables.entry(patch_type).or_default();
        for change in changes {
            match change {
                MacChange::Set {
                    index_mac,
                    value_mac,
                } => {
                    table.insert(*index_mac, *value_mac);
                }
                MacChange::Remove { index_mac } => {
                    table.remove(index_mac);
                }
            }
        }
        Ok(())
    }

    fn clear_mac_table(&self, patch_type: PatchType) -> SyncResult<()> {
        self.state.write().mac_tables.remove(&patch_type);
        Ok(())
    }

    fn skip_mac_verification(&self) -> bool {
        self.skip_mac_verification
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u8, timestamp: u64) -> SyncKey {
        SyncKey::new(KeyId::new([id]), &[id; 32], timestamp).unwrap()
    }

    #[test]
    fn keys_by_id_and_latest() {
        let store = MemoryStore::new();
        assert!(store.latest_sync_key().unwrap().is_none());

        store.add_sync_key(key(1, 10));
        store.add_sync_key(key(2, 30));
        store.add_sync_key(key(3, 20));

        let third = store.sync_key(&KeyId::new([3])).unwrap().unwrap();
        assert_eq!(third.timestamp(), 20);
        assert!(store.sync_key(&KeyId::new([9])).unwrap().is_none());
        let latest = store.latest_sync_key().unwrap().unwrap();
        assert_eq!(latest.id(), &KeyId::new([2]));
    }

    #[test]
    fn metadata_roundtrip() {
        let store = MemoryStore::new();
        assert!(store
            .collection_metadata(PatchType::Regular)
            .unwrap()
            .is_none());

        let mut metadata = CollectionMetadata::new(PatchType::Regular);
        metadata.version = 12;
        store.persist_collection_metadata(&metadata).unwrap();
        assert_eq!(
            store.collection_metadata(PatchType::Regular).unwrap(),
            Some(metadata)
        );
    }

    #[test]
    fn mac_table_changes() {
        let store = MemoryStore::new();
        let a = [1u8; 32];
        let b = [2u8; 32];

        store
            .apply_mac_changes(
                PatchType::Regular,
                &[
                    MacChange::Set {
                        index_mac: a,
                        value_mac: [10; 16],
                    },
                    MacChange::Set {
                        index_mac: b,
                        value_mac: [20; 16],
                    },
                ],
            )
            .unwrap();
        store
            .apply_mac_changes(PatchType::Regular, &[MacChange::Remove { index_mac: a }])
            .unwrap();

        assert_eq!(store.value_mac(PatchType::Regular, &a).unwrap(), None);
        assert_eq!(store.value_mac(PatchType::Regular, &b).unwrap(), Some([20; 16]));
        assert_eq!(store.value_mac(PatchType::RegularLow, &b).unwrap(), None);

        store.clear_mac_table(PatchType::Regular).unwrap();
        assert_eq!(store.mac_table_len(PatchType::Regular), 0);
    }

    #[test]
    fn verification_flag() {
        assert!(!MemoryStore::new().skip_mac_verification());
        assert!(MemoryStore::without_mac_verification().skip_mac_verification());
    }
}
