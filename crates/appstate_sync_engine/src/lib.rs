//! # App State Sync Engine
//!
//! Keeps named mutation collections in sync with the server.
//!
//! This crate provides:
//! - The per-collection state machine (`CollectionTable`)
//! - The pending local mutation queue and conflict resolution
//! - Retry scheduling with exponential backoff and jitter
//! - Collaborator traits for transport, storage and action handlers
//! - The `SyncCoordinator` that drives pulls and pushes
//!
//! ## Sync Model
//!
//! A pull pages through patches (or a snapshot on first sync), verifies each
//! against its collection MAC and commits the new version and hash. A push
//! encrypts the pending mutations into one patch and is always followed by a
//! pull, so local state is re-derived from the server.
//!
//! ## Key Invariants
//!
//! - At most one request per collection is in flight
//! - Critical collections sync first, in order
//! - Versions never go backwards except through a full resync
//! - Nothing reaches a handler before its collection MAC is verified

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod conflict;
mod coordinator;
mod error;
mod handler;
mod pending;
mod retry;
mod state;
mod store;
mod transport;

pub use config::{RetryConfig, SyncConfig};
pub use conflict::{resolve, Resolution, Resolved};
pub use coordinator::{CollectionSync, SyncCoordinator, SyncReport, SyncStats};
pub use error::{FailureClass, SyncError, SyncResult};
pub use handler::{
    ActionHandler, ErrorSink, HandlerMap, HandlerRegistry, RecordingErrorSink, RecordingHandler,
    TracingErrorSink,
};
pub use pending::{PendingMutation, PendingQueue};
pub use retry::RetryScheduler;
pub use state::{CollectionMetadata, CollectionState, CollectionTable};
pub use store::{AppStateStore, MemoryStore};
pub use transport::{
    download_verified, BlobDownloader, MemoryBlobDownloader, MockTransport, NoBlobDownloader,
    Transport,
};
