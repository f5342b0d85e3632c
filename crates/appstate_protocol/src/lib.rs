//! # App State Sync Protocol
//!
//! Protocol types and codecs for app state synchronization.
//!
//! This crate provides:
//! - `PatchType` for the named mutation collections
//! - The mutation model (`Mutation`, `MutationIndex`, `SyncAction`)
//! - Wire records (`MutationRecord`, `PatchRecord`, `SnapshotRecord`)
//! - The structured `Node` document and sync request/response codecs
//!
//! This is a pure protocol crate with no I/O and no cryptography.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod messages;
mod mutation;
mod node;
mod patch_type;
mod records;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    build_error_response, build_pull_request, build_push_request, parse_sync_request,
    parse_sync_response, SnapshotSource, SyncRequest, SyncResponse, SYNC_XMLNS,
};
pub use mutation::{
    action_names, Mutation, MutationIndex, Operation, SyncAction, SyncActionData, SyncActionValue,
};
pub use node::{Node, NodeContent};
pub use patch_type::PatchType;
pub use records::{
    ExternalBlobReference, KeyId, MutationRecord, MutationsBlob, PatchRecord, SnapshotRecord,
};
