//! Order-independent accumulator hash over a collection's live mutations.
//!
//! Each 48-byte entry (`index_mac || value_mac`) is expanded to 128 bytes
//! with HKDF-SHA256 and added to or subtracted from the digest as 64
//! little-endian `u16` lanes with wrapping arithmetic. Lane-wise addition
//! commutes, so the digest depends only on the multiset of entries.
//!
//! Entries are additive: adding the same entry twice contributes it twice,
//! and one removal cancels one addition. Callers keep the multiset free of
//! duplicates by removing an index's previous value before adding its new
//! one (see [`apply_batch`]).

use appstate_protocol::Operation;
use hkdf::Hkdf;
use sha2::Sha256;
use std::collections::HashMap;

/// Size of the digest in bytes.
pub const LT_HASH_SIZE: usize = 128;
/// Size of an index MAC in bytes.
pub const INDEX_MAC_SIZE: usize = 32;
/// Size of a value MAC in bytes.
pub const VALUE_MAC_SIZE: usize = 16;
/// Size of one accumulator entry in bytes.
pub const ENTRY_SIZE: usize = INDEX_MAC_SIZE + VALUE_MAC_SIZE;

const PATCH_INTEGRITY_INFO: &[u8] = b"WhatsApp Patch Integrity";

/// HMAC of a mutation's plaintext index.
pub type IndexMac = [u8; INDEX_MAC_SIZE];
/// Truncated HMAC of a mutation's encrypted value.
pub type ValueMac = [u8; VALUE_MAC_SIZE];

/// Builds the accumulator entry for an index/value MAC pair.
pub fn entry(index_mac: &IndexMac, value_mac: &ValueMac) -> [u8; ENTRY_SIZE] {
    let mut out = [0u8; ENTRY_SIZE];
    out[..INDEX_MAC_SIZE].copy_from_slice(index_mac);
    out[INDEX_MAC_SIZE..].copy_from_slice(value_mac);
    out
}

/// Accumulator digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LtHash([u8; LT_HASH_SIZE]);

impl LtHash {
    /// Digest of the empty set.
    pub const EMPTY: LtHash = LtHash([0u8; LT_HASH_SIZE]);

    /// Wraps raw digest bytes.
    pub fn from_bytes(bytes: [u8; LT_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; LT_HASH_SIZE] {
        &self.0
    }

    /// Returns a new digest with `to_remove` subtracted and `to_add` added.
    pub fn subtract_then_add<A, R>(&self, to_add: &[A], to_remove: &[R]) -> LtHash
    where
        A: AsRef<[u8]>,
        R: AsRef<[u8]>,
    {
        let mut out = *self;
        for item in to_remove {
            out.apply(item.as_ref(), false);
        }
        for item in to_add {
            out.apply(item.as_ref(), true);
        }
        out
    }

    fn apply(&mut self, item: &[u8], add: bool) {
        let expanded = expand(item);
        for (lane, delta) in self.0.chunks_exact_mut(2).zip(expanded.chunks_exact(2)) {
            let current = u16::from_le_bytes([lane[0], lane[1]]);
            let delta = u16::from_le_bytes([delta[0], delta[1]]);
            let next = if add {
                current.wrapping_add(delta)
            } else {
                current.wrapping_sub(delta)
            };
            lane.copy_from_slice(&next.to_le_bytes());
        }
    }
}

impl Default for LtHash {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl std::fmt::Debug for LtHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LtHash(")?;
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

fn expand(item: &[u8]) -> [u8; LT_HASH_SIZE] {
    let mut out = [0u8; LT_HASH_SIZE];
    Hkdf::<Sha256>::new(None, item)
        .expand(PATCH_INTEGRITY_INFO, &mut out)
        .expect("128 bytes is a valid HKDF-SHA256 output length");
    out
}

/// Change to a collection's index→value-MAC table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacChange {
    /// The index now holds this value MAC.
    Set {
        /// Index MAC.
        index_mac: IndexMac,
        /// Value MAC of the live SET.
        value_mac: ValueMac,
    },
    /// The index no longer holds a value.
    Remove {
        /// Index MAC.
        index_mac: IndexMac,
    },
}

/// Result of hashing a batch of mutations onto a base digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashUpdate {
    /// Digest after the batch.
    pub hash: LtHash,
    /// Table changes to persist alongside the digest, one per touched index.
    pub changes: Vec<MacChange>,
    /// REMOVE mutations whose previous value was unknown.
    pub missing_previous: usize,
}

/// Applies a batch of `(operation, index_mac, value_mac)` triples to `base`.
///
/// A SET adds its entry and subtracts the previous entry for the same index;
/// a REMOVE only subtracts the previous entry. Earlier mutations in the batch
/// shadow `previous`, which looks up values committed before the batch.
pub fn apply_batch<'a, I, F>(base: &LtHash, mutations: I, previous: F) -> HashUpdate
where
    I: IntoIterator<Item = (Operation, &'a IndexMac, &'a ValueMac)>,
    F: Fn(&IndexMac) -> Option<ValueMac>,
{
    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut overlay: HashMap<IndexMac, Option<ValueMac>> = HashMap::new();
    let mut order = Vec::new();
    let mut missing_previous = 0;

    for (operation, index_mac, value_mac) in mutations {
        let prior = match overlay.get(index_mac) {
            Some(shadowed) => *shadowed,
            None => {
                order.push(*index_mac);
                previous(index_mac)
            }
        };

        if let Some(prior) = prior {
            removed.push(entry(index_mac, &prior));
        } else if operation == Operation::Remove {
            missing_previous += 1;
        }

        match operation {
            Operation::Set => {
                added.push(entry(index_mac, value_mac));
                overlay.insert(*index_mac, Some(*value_mac));
            }
            Operation::Remove => {
                overlay.insert(*index_mac, None);
            }
        }
    }

    let changes = order
        .into_iter()
        .map(|index_mac| match overlay.get(&index_mac).copied().flatten() {
            Some(value_mac) => MacChange::Set {
                index_mac,
                value_mac,
            },
            None => MacChange::Remove { index_mac },
        })
        .collect();

    HashUpdate {
        hash: base.subtract_then_add(&added, &removed),
        changes,
        missing_previous,
    }
}
