//! Per-collection sync state machine.
//!
//! ```text
//! UpToDate --queue--> Dirty
//! UpToDate | Dirty | ErrorRetry --begin--> InFlight
//! InFlight --has_more--> Pending --next page--> InFlight
//! InFlight --done--> UpToDate
//! InFlight --missing key--> Blocked
//! InFlight --transient--> ErrorRetry
//! InFlight | ErrorRetry --fatal--> ErrorFatal
//! ```
//!
//! [`CollectionTable::try_begin`] is the only way into `InFlight`, so at most
//! one flow owns a collection at a time.

use crate::error::{SyncError, SyncResult};
use appstate_crypto::LtHash;
use appstate_protocol::PatchType;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

/// Lifecycle state of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionState {
    /// Local and server state agree.
    UpToDate,
    /// Local mutations are waiting to be pushed.
    Dirty,
    /// A request is outstanding.
    InFlight,
    /// The server has more pages; the owning flow will request the next one.
    Pending,
    /// A sync key is missing. Waits for key delivery.
    Blocked,
    /// A retry is scheduled.
    ErrorRetry,
    /// Sync abandoned until an explicit reset.
    ErrorFatal,
}

impl CollectionState {
    /// Returns true while a flow owns the collection.
    pub fn is_active(&self) -> bool {
        matches!(self, CollectionState::InFlight | CollectionState::Pending)
    }

    /// Returns true if a new flow may claim the collection.
    pub fn can_start_sync(&self) -> bool {
        matches!(
            self,
            CollectionState::UpToDate | CollectionState::Dirty | CollectionState::ErrorRetry
        )
    }

    /// Returns true for states that only an external event leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CollectionState::Blocked | CollectionState::ErrorFatal)
    }

    /// Stable name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionState::UpToDate => "up_to_date",
            CollectionState::Dirty => "dirty",
            CollectionState::InFlight => "in_flight",
            CollectionState::Pending => "pending",
            CollectionState::Blocked => "blocked",
            CollectionState::ErrorRetry => "error_retry",
            CollectionState::ErrorFatal => "error_fatal",
        }
    }
}

impl fmt::Display for CollectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync bookkeeping for one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMetadata {
    /// The collection.
    pub name: PatchType,
    /// Last server-confirmed version.
    pub version: u64,
    /// LT-hash of every live mutation at `version`.
    pub hash: LtHash,
    /// When the collection last reached `UpToDate` (unix millis).
    pub last_sync_timestamp: u64,
    /// Current state.
    pub state: CollectionState,
    /// Consecutive failed attempts.
    pub retry_count: u32,
    /// When the last failure happened (unix millis).
    pub last_error_timestamp: u64,
}

impl CollectionMetadata {
    /// Metadata of a never-synced collection.
    pub fn new(name: PatchType) -> Self {
        Self {
            name,
            version: 0,
            hash: LtHash::EMPTY,
            last_sync_timestamp: 0,
            state: CollectionState::UpToDate,
            retry_count: 0,
            last_error_timestamp: 0,
        }
    }
}

/// Shared table of collection metadata.
///
/// Every method takes the lock once, so each transition is atomic.
#[derive(Debug, Default)]
pub struct CollectionTable {
    collections: Mutex<HashMap<PatchType, CollectionMetadata>>,
}

impl CollectionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the collection has been loaded.
    pub fn contains(&self, patch_type: PatchType) -> bool {
        self.collections.lock().contains_key(&patch_type)
    }

    /// Inserts metadata loaded from the store unless already present.
    ///
    /// A flow cannot survive a restart, so `InFlight` and `Pending` load as
    /// `UpToDate`.
    pub fn insert_if_absent(&self, mut metadata: CollectionMetadata) {
        if metadata.state.is_active() {
            metadata.state = CollectionState::UpToDate;
        }
        self.collections
            .lock()
            .entry(metadata.name)
            .or_insert(metadata);
    }

    /// Returns a copy of the collection's metadata, creating it if needed.
    pub fn get(&self, patch_type: PatchType) -> CollectionMetadata {
        self.collections
            .lock()
            .entry(patch_type)
            .or_insert_with(|| CollectionMetadata::new(patch_type))
            .clone()
    }

    /// Returns the collection's state.
    pub fn state(&self, patch_type: PatchType) -> CollectionState {
        self.get(patch_type).state
    }

    /// Collections currently `Blocked`.
    pub fn blocked(&self) -> Vec<PatchType> {
        let mut blocked: Vec<_> = self
            .collections
            .lock()
            .values()
            .filter(|m| m.state == CollectionState::Blocked)
            .map(|m| m.name)
            .collect();
        blocked.sort();
        blocked
    }

    fn update<R>(&self, patch_type: PatchType, f: impl FnOnce(&mut CollectionMetadata) -> R) -> R {
        let mut collections = self.collections.lock();
        let metadata = collections
            .entry(patch_type)
            .or_insert_with(|| CollectionMetadata::new(patch_type));
        f(metadata)
    }

    fn transition(
        &self,
        patch_type: PatchType,
        allowed: impl Fn(CollectionState) -> bool,
        to: CollectionState,
        f: impl FnOnce(&mut CollectionMetadata),
    ) -> SyncResult<CollectionMetadata> {
        self.update(patch_type, |m| {
            if !allowed(m.state) {
                return Err(SyncError::InvalidStateTransition {
                    patch_type,
                    from: m.state,
                    to,
                });
            }
            m.state = to;
            f(m);
            Ok(m.clone())
        })
    }

    /// Records that local mutations were queued.
    ///
    /// Only `UpToDate` becomes `Dirty`; other states already imply a push
    /// or are waiting on an external event.
    pub fn mark_dirty(&self, patch_type: PatchType) -> CollectionState {
        self.update(patch_type, |m| {
            if m.state == CollectionState::UpToDate {
                m.state = CollectionState::Dirty;
            }
            m.state
        })
    }

    /// Claims the collection for a new flow.
    ///
    /// Compare-and-swap into `InFlight`; on failure returns the state that
    /// prevented it.
    pub fn try_begin(&self, patch_type: PatchType) -> Result<CollectionMetadata, CollectionState> {
        self.update(patch_type, |m| {
            if m.state.can_start_sync() {
                m.state = CollectionState::InFlight;
                Ok(m.clone())
            } else {
                Err(m.state)
            }
        })
    }

    /// `InFlight` to `Pending`: the server has more pages.
    pub fn mark_pending(&self, patch_type: PatchType) -> SyncResult<CollectionMetadata> {
        self.transition(
            patch_type,
            |s| s == CollectionState::InFlight,
            CollectionState::Pending,
            |_| {},
        )
    }

    /// `Pending` to `InFlight`: the next page is being requested.
    pub fn continue_paging(&self, patch_type: PatchType) -> SyncResult<CollectionMetadata> {
        self.transition(
            patch_type,
            |s| s == CollectionState::Pending,
            CollectionState::InFlight,
            |_| {},
        )
    }

    /// Applies a server-confirmed version and its hash.
    ///
    /// Versions never go backwards, except through [`forget`](Self::forget).
    pub fn commit(
        &self,
        patch_type: PatchType,
        version: u64,
        hash: LtHash,
    ) -> SyncResult<CollectionMetadata> {
        self.update(patch_type, |m| {
            if !m.state.is_active() {
                return Err(SyncError::InvalidStateTransition {
                    patch_type,
                    from: m.state,
                    to: m.state,
                });
            }
            if version < m.version {
                return Err(SyncError::Protocol(format!(
                    "{patch_type} version would go backwards from {} to {version}",
                    m.version
                )));
            }
            m.version = version;
            m.hash = hash;
            m.retry_count = 0;
            Ok(m.clone())
        })
    }

    /// The flow finished with nothing left to fetch.
    pub fn finish(&self, patch_type: PatchType, now: u64) -> SyncResult<CollectionMetadata> {
        self.transition(
            patch_type,
            |s| s.is_active(),
            CollectionState::UpToDate,
            |m| {
                m.retry_count = 0;
                m.last_sync_timestamp = now;
            },
        )
    }

    /// Transient failure. Returns the updated metadata; `retry_count` is the
    /// number of consecutive failures including this one.
    pub fn fail_retry(&self, patch_type: PatchType, now: u64) -> SyncResult<CollectionMetadata> {
        self.transition(
            patch_type,
            |s| s.is_active(),
            CollectionState::ErrorRetry,
            |m| {
                m.retry_count = m.retry_count.saturating_add(1);
                m.last_error_timestamp = now;
            },
        )
    }

    /// Fatal failure, or retries exhausted.
    pub fn fail_fatal(&self, patch_type: PatchType, now: u64) -> SyncResult<CollectionMetadata> {
        self.transition(
            patch_type,
            |s| s.is_active() || s == CollectionState::ErrorRetry,
            CollectionState::ErrorFatal,
            |m| m.last_error_timestamp = now,
        )
    }

    /// A sync key is missing.
    pub fn block(&self, patch_type: PatchType, now: u64) -> SyncResult<CollectionMetadata> {
        self.transition(
            patch_type,
            |s| s.is_active(),
            CollectionState::Blocked,
            |m| m.last_error_timestamp = now,
        )
    }

    /// Leaves `Blocked`, `ErrorRetry` or `ErrorFatal`, keeping version and hash.
    pub fn reset(&self, patch_type: PatchType) -> SyncResult<CollectionMetadata> {
        self.transition(
            patch_type,
            |s| !s.is_active(),
            CollectionState::UpToDate,
            |m| m.retry_count = 0,
        )
    }

    /// Forgets version and hash so the next pull starts from a snapshot.
    pub fn forget(&self, patch_type: PatchType) -> SyncResult<CollectionMetadata> {
        self.transition(
            patch_type,
            |s| !s.is_active(),
            CollectionState::UpToDate,
            |m| {
                m.version = 0;
                m.hash = LtHash::EMPTY;
                m.retry_count = 0;
            },
        )
    }
}
