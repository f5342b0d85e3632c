//! # App State Sync Testkit
//!
//! Test utilities for app state sync.
//!
//! This crate provides:
//! - `FakeServer`, an in-memory authoritative sync server
//! - `BlobHost` for external mutation blobs and snapshots
//! - Property-based test generators using proptest
//! - Fixtures for keys, common mutations and logging
//!
//! ## Usage
//!
//! ```rust,ignore
//! use appstate_testkit::prelude::*;
//!
//! let server = FakeServer::new(sync_key(1));
//! server.add_remote_patch(PatchType::Regular, vec![archive("123@s.whatsapp.net", 10)]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod blobs;
pub mod fixtures;
pub mod generators;
pub mod server;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::blobs::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::server::*;
}

pub use blobs::*;
pub use fixtures::*;
pub use generators::*;
pub use server::*;
