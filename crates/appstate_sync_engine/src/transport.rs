//! Transport and blob download abstractions.

use crate::error::{SyncError, SyncResult};
use appstate_protocol::{ExternalBlobReference, Node};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};

/// Sends sync documents to the server.
///
/// This trait abstracts the network layer and the binary node encoding.
/// Failures should be reported as [`SyncError::Transport`], with
/// `retryable` set for connection-level problems.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and waits for its response.
    async fn send(&self, request: Node) -> SyncResult<Node>;
}

/// Fetches mutation blobs that were too large to inline.
#[async_trait]
pub trait BlobDownloader: Send + Sync {
    /// Downloads the blob's bytes.
    async fn download(&self, reference: &ExternalBlobReference) -> SyncResult<Vec<u8>>;
}

/// Downloads a blob and checks it against the reference's SHA-256.
pub async fn download_verified(
    downloader: &dyn BlobDownloader,
    reference: &ExternalBlobReference,
) -> SyncResult<Vec<u8>> {
    let bytes = downloader.download(reference).await?;
    let digest = Sha256::digest(&bytes);
    if digest.as_slice() != reference.file_sha256.as_slice() {
        return Err(SyncError::malformed(format!(
            "blob {} failed its SHA-256 check",
            reference.direct_path
        )));
    }
    Ok(bytes)
}

/// A downloader for setups without external blobs. Every download fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBlobDownloader;

#[async_trait]
impl BlobDownloader for NoBlobDownloader {
    async fn download(&self, reference: &ExternalBlobReference) -> SyncResult<Vec<u8>> {
        Err(SyncError::transport_fatal(format!(
            "no blob downloader configured for {}",
            reference.direct_path
        )))
    }
}

/// A scripted transport for testing.
///
/// Responses are returned in the order they were queued. Every request is
/// recorded.
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<SyncResult<Node>>>,
    requests: Mutex<Vec<Node>>,
}

impl MockTransport {
    /// Creates a transport with no queued responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful response.
    pub fn push_response(&self, response: Node) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues a failure.
    pub fn push_error(&self, error: SyncError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Returns every request sent so far.
    pub fn requests(&self) -> Vec<Node> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: Node) -> SyncResult<Node> {
        self.requests.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::transport_fatal("no mock response queued")))
    }
}

/// An in-memory blob host for testing.
#[derive(Debug, Default)]
pub struct MemoryBlobDownloader {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobDownloader {
    /// Creates an empty host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `bytes` under `direct_path`.
    pub fn insert(&self, direct_path: impl Into<String>, bytes: Vec<u8>) {
        self.blobs.lock().insert(direct_path.into(), bytes);
    }
}

#[async_trait]
impl BlobDownloader for MemoryBlobDownloader {
    async fn download(&self, reference: &ExternalBlobReference) -> SyncResult<Vec<u8>> {
        self.blobs
            .lock()
            .get(&reference.direct_path)
            .cloned()
            .ok_or_else(|| {
                SyncError::transport_retryable(format!("blob {} not found", reference.direct_path))
            })
    }
}
