//! # App State Crypto
//!
//! Cryptographic building blocks for app state synchronization.
//!
//! ## Security Model
//!
//! - Each 32-byte sync key expands (HKDF-SHA256) into five subkeys
//! - Subkeys live in [`DerivedKeys`], which is zeroized on drop and never cloned
//! - Mutation values use AES-256-GCM plus a truncated HMAC-SHA512 value MAC,
//!   checked before decryption
//! - Collection integrity uses an order-independent LT-hash and HMAC-SHA256
//!   snapshot/patch MACs
//!
//! ## Usage
//!
//! ```ignore
//! use appstate_crypto::{derive_keys, encrypt_mutation, decrypt_mutation};
//!
//! let keys = derive_keys(&sync_key_bytes)?;
//! let encrypted = encrypt_mutation(&mutation, &key_id, &keys, 16)?;
//! let untrusted = decrypt_mutation(&encrypted.record, &keys)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod integrity;
mod keys;
mod lthash;
mod mutation;

pub use error::{CryptoError, CryptoResult};
pub use integrity::{patch_mac, snapshot_mac, IntegrityVerifier, COLLECTION_MAC_SIZE};
pub use keys::{derive_keys, DerivedKeys, SyncKey, DERIVED_KEY_SIZE, SYNC_KEY_SIZE};
pub use lthash::{
    apply_batch, entry, HashUpdate, IndexMac, LtHash, MacChange, ValueMac, ENTRY_SIZE,
    INDEX_MAC_SIZE, LT_HASH_SIZE, VALUE_MAC_SIZE,
};
pub use mutation::{
    decrypt_mutation, encrypt_mutation, index_mac, record_macs, EncryptedMutation, TrustedMutation,
    UntrustedMutation, NONCE_SIZE, TAG_SIZE,
};
