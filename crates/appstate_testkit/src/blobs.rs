//! In-memory media host for external blobs.

use appstate_protocol::ExternalBlobReference;
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Stores blobs under generated direct paths.
#[derive(Debug, Default)]
pub struct BlobHost {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl BlobHost {
    /// Creates an empty host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `bytes` and returns a reference to them.
    pub fn upload(&self, bytes: Vec<u8>) -> ExternalBlobReference {
        let mut media_key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut media_key);

        let mut blobs = self.blobs.lock();
        let reference = ExternalBlobReference {
            direct_path: format!("/v/t62/blob-{}", blobs.len() + 1),
            media_key,
            file_sha256: Sha256::digest(&bytes).to_vec(),
            file_size: bytes.len() as u64,
        };
        blobs.insert(reference.direct_path.clone(), bytes);
        reference
    }

    /// Returns the blob behind `reference`, if stored.
    pub fn fetch(&self, reference: &ExternalBlobReference) -> Option<Vec<u8>> {
        self.blobs.lock().get(&reference.direct_path).cloned()
    }

    /// Overwrites the blob at `direct_path`; references to it keep their
    /// original digest.
    pub fn corrupt(&self, direct_path: &str, bytes: Vec<u8>) {
        self.blobs.lock().insert(direct_path.to_string(), bytes);
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_then_fetch() {
        let host = BlobHost::new();
        let first = host.upload(b"one".to_vec());
        let second = host.upload(b"two".to_vec());

        assert_ne!(first.direct_path, second.direct_path);
        assert_eq!(first.file_size, 3);
        assert_eq!(host.fetch(&first), Some(b"one".to_vec()));
        assert_eq!(host.len(), 2);

        host.corrupt(&first.direct_path, b"bad".to_vec());
        assert_eq!(host.fetch(&first), Some(b"bad".to_vec()));
    }
}
