//! Sync keys and the subkeys derived from them.

use crate::error::{CryptoError, CryptoResult};
use appstate_protocol::KeyId;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Size of a sync key in bytes.
pub const SYNC_KEY_SIZE: usize = 32;
/// Size of each derived subkey in bytes.
pub const DERIVED_KEY_SIZE: usize = 32;

const EXPANDED_SIZE: usize = 5 * DERIVED_KEY_SIZE;
const MUTATION_KEYS_INFO: &[u8] = b"WhatsApp Mutation Keys";

/// A 32-byte collection key delivered out of band.
///
/// The key bytes are zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SyncKey {
    #[zeroize(skip)]
    id: KeyId,
    bytes: [u8; SYNC_KEY_SIZE],
    #[zeroize(skip)]
    timestamp: u64,
}

impl SyncKey {
    /// Creates a sync key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKeyLength` unless `bytes` is exactly 32 bytes.
    pub fn new(id: KeyId, bytes: &[u8], timestamp: u64) -> CryptoResult<Self> {
        if bytes.len() != SYNC_KEY_SIZE {
            return Err(CryptoError::invalid_key_length(bytes.len(), SYNC_KEY_SIZE));
        }
        let mut key_bytes = [0u8; SYNC_KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self {
            id,
            bytes: key_bytes,
            timestamp,
        })
    }

    /// Returns the key ID.
    pub fn id(&self) -> &KeyId {
        &self.id
    }

    /// Returns when the key was issued (unix millis).
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Returns the raw key bytes. Don't log or serialize the result.
    pub fn as_bytes(&self) -> &[u8; SYNC_KEY_SIZE] {
        &self.bytes
    }

    /// Derives the five subkeys for one operation.
    pub fn derive(&self) -> CryptoResult<DerivedKeys> {
        derive_keys(&self.bytes)
    }
}

impl std::fmt::Debug for SyncKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncKey")
            .field("id", &self.id)
            .field("bytes", &"[REDACTED]")
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// The five purpose-specific subkeys of a sync key.
///
/// Not `Clone`: each operation derives its own copy, and the bytes are wiped
/// when the value goes out of scope, whichever path it leaves by.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    index: [u8; DERIVED_KEY_SIZE],
    value_encryption: [u8; DERIVED_KEY_SIZE],
    value_mac: [u8; DERIVED_KEY_SIZE],
    snapshot_mac: [u8; DERIVED_KEY_SIZE],
    patch_mac: [u8; DERIVED_KEY_SIZE],
}

impl DerivedKeys {
    /// Key for index MACs.
    pub fn index_key(&self) -> &[u8; DERIVED_KEY_SIZE] {
        &self.index
    }

    /// Key for value encryption.
    pub fn value_encryption_key(&self) -> &[u8; DERIVED_KEY_SIZE] {
        &self.value_encryption
    }

    /// Key for value MACs.
    pub fn value_mac_key(&self) -> &[u8; DERIVED_KEY_SIZE] {
        &self.value_mac
    }

    /// Key for snapshot MACs.
    pub fn snapshot_mac_key(&self) -> &[u8; DERIVED_KEY_SIZE] {
        &self.snapshot_mac
    }

    /// Key for patch MACs.
    pub fn patch_mac_key(&self) -> &[u8; DERIVED_KEY_SIZE] {
        &self.patch_mac
    }
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKeys([REDACTED])")
    }
}

/// Expands a 32-byte sync key into [`DerivedKeys`].
///
/// Uses HKDF-SHA256 Expand with the key as PRK and 160 bytes of output,
/// split in order: index, value encryption, value MAC, snapshot MAC,
/// patch MAC.
///
/// # Errors
///
/// Returns `InvalidKeyLength` unless `key` is exactly 32 bytes.
pub fn derive_keys(key: &[u8]) -> CryptoResult<DerivedKeys> {
    if key.len() != SYNC_KEY_SIZE {
        return Err(CryptoError::invalid_key_length(key.len(), SYNC_KEY_SIZE));
    }

    let hk = Hkdf::<Sha256>::from_prk(key)
        .map_err(|_| CryptoError::key_derivation_failed("PRK rejected"))?;

    let mut okm = Zeroizing::new([0u8; EXPANDED_SIZE]);
    hk.expand(MUTATION_KEYS_INFO, &mut okm[..])
        .map_err(|_| CryptoError::key_derivation_failed("HKDF expand failed"))?;

    let mut keys = DerivedKeys {
        index: [0u8; DERIVED_KEY_SIZE],
        value_encryption: [0u8; DERIVED_KEY_SIZE],
        value_mac: [0u8; DERIVED_KEY_SIZE],
        snapshot_mac: [0u8; DERIVED_KEY_SIZE],
        patch_mac: [0u8; DERIVED_KEY_SIZE],
    };
    let slots = [
        &mut keys.index,
        &mut keys.value_encryption,
        &mut keys.value_mac,
        &mut keys.snapshot_mac,
        &mut keys.patch_mac,
    ];
    for (slot, chunk) in slots.into_iter().zip(okm.chunks_exact(DERIVED_KEY_SIZE)) {
        slot.copy_from_slice(chunk);
    }

    Ok(keys)
}
