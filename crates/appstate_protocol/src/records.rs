//! Wire records carried inside sync documents.
//!
//! All records are CBOR encoded. A mutation record's `value_blob` is
//! `nonce || ciphertext || value_mac`; splitting and verifying it is the job
//! of the crypto layer.

use crate::cbor::{from_cbor, to_cbor};
use crate::error::ProtocolResult;
use crate::mutation::Operation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a sync key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct KeyId(pub Vec<u8>);

impl KeyId {
    /// Creates a key ID from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({self})")
    }
}

/// One encrypted mutation as transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    /// SET or REMOVE.
    pub operation: Operation,
    /// HMAC of the plaintext index.
    pub index_mac: Vec<u8>,
    /// `nonce || ciphertext || value_mac`.
    pub value_blob: Vec<u8>,
    /// Key the value was encrypted with.
    pub key_id: KeyId,
}

/// Reference to a blob too large to inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalBlobReference {
    /// Path on the media host.
    pub direct_path: String,
    /// Key for the media layer.
    pub media_key: Vec<u8>,
    /// SHA-256 of the downloaded bytes.
    pub file_sha256: Vec<u8>,
    /// Size of the downloaded bytes.
    pub file_size: u64,
}

impl ExternalBlobReference {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes, "external blob reference")
    }
}

/// Mutations stored out of line for a patch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MutationsBlob {
    /// The mutation records.
    pub mutations: Vec<MutationRecord>,
}

impl MutationsBlob {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes, "mutations blob")
    }
}

/// An incremental set of mutations moving a collection to `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    /// Collection version after this patch.
    pub version: u64,
    /// Inline mutations.
    pub mutations: Vec<MutationRecord>,
    /// Mutations stored out of line, appended after the inline ones.
    pub external_mutations: Option<ExternalBlobReference>,
    /// MAC over the resulting collection hash, version and name.
    pub patch_mac: Vec<u8>,
    /// Key the patch MAC was computed with.
    pub key_id: KeyId,
    /// Index of the device that produced the patch.
    pub device_index: Option<u32>,
}

impl PatchRecord {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes, "patch")
    }
}

/// Full replacement state of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Collection version of this snapshot.
    pub version: u64,
    /// Every live SET record.
    pub records: Vec<MutationRecord>,
    /// MAC over the snapshot hash, version and name.
    pub mac: Vec<u8>,
    /// Key the MAC was computed with.
    pub key_id: KeyId,
}

impl SnapshotRecord {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes, "snapshot")
    }
}
