//! Error types for the sync engine.

use crate::state::CollectionState;
use appstate_crypto::CryptoError;
use appstate_protocol::{KeyId, PatchType, ProtocolError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// How a failure affects its collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// MAC or hash mismatch. The collection becomes `ErrorFatal`.
    Integrity,
    /// A sync key is missing. The collection becomes `Blocked`.
    MissingKey,
    /// Worth retrying with backoff.
    Transient,
    /// Unrecoverable. The collection becomes `ErrorFatal`.
    Fatal,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server answered with an error element.
    #[error("server error {code}: {text}")]
    Server {
        /// Numeric error code.
        code: u16,
        /// Error text.
        text: String,
    },

    /// A request did not complete within the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// A MAC or hash did not match.
    #[error("integrity violation: {message}")]
    IntegrityViolation {
        /// What failed to verify.
        message: String,
    },

    /// A referenced sync key is not available locally.
    #[error("missing sync key {key_id}")]
    MissingKey {
        /// The key that was requested.
        key_id: KeyId,
    },

    /// No sync key has been delivered yet, so nothing can be pushed.
    #[error("no sync key available to push {patch_type}")]
    NoSyncKey {
        /// The collection with queued mutations.
        patch_type: PatchType,
    },

    /// Key material has the wrong size.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required length.
        expected: usize,
        /// Supplied length.
        actual: usize,
    },

    /// A record or document could not be decoded.
    #[error("malformed record: {message}")]
    MalformedRecord {
        /// Description of the problem.
        message: String,
    },

    /// Protocol violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local encryption or key derivation failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The external store failed.
    #[error("store error: {0}")]
    Store(String),

    /// The collection cannot start a sync in its current state.
    #[error("collection {patch_type} is {state}")]
    CollectionUnavailable {
        /// The collection.
        patch_type: PatchType,
        /// Its state at the time of the attempt.
        state: CollectionState,
    },

    /// Invalid state transition.
    #[error("invalid state transition for {patch_type} from {from} to {to}")]
    InvalidStateTransition {
        /// The collection.
        patch_type: PatchType,
        /// Current state.
        from: CollectionState,
        /// Attempted target state.
        to: CollectionState,
    },

    /// The retry budget for a collection is spent.
    #[error("retries exhausted for {patch_type} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// The collection.
        patch_type: PatchType,
        /// Consecutive failed attempts.
        attempts: u32,
        /// The failure that ended the run.
        last_error: String,
    },

    /// The coordinator has been shut down.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Creates a malformed record error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRecord {
            message: message.into(),
        }
    }

    /// Classifies the error for the collection state machine.
    ///
    /// Malformed records and bad key lengths count as transient: a page
    /// decoded from a truncated or corrupted download may succeed on retry,
    /// and the retry budget bounds the cost when it does not.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            SyncError::IntegrityViolation { .. } => FailureClass::Integrity,
            SyncError::MissingKey { .. } | SyncError::NoSyncKey { .. } => {
                FailureClass::MissingKey
            }
            SyncError::Transport { retryable, .. } => {
                if *retryable {
                    FailureClass::Transient
                } else {
                    FailureClass::Fatal
                }
            }
            SyncError::Server { code, .. } => {
                if *code == 409 || *code >= 500 {
                    FailureClass::Transient
                } else {
                    FailureClass::Fatal
                }
            }
            SyncError::Timeout
            | SyncError::MalformedRecord { .. }
            | SyncError::InvalidKeyLength { .. } => FailureClass::Transient,
            SyncError::Protocol(_)
            | SyncError::Crypto(_)
            | SyncError::Store(_)
            | SyncError::CollectionUnavailable { .. }
            | SyncError::InvalidStateTransition { .. }
            | SyncError::RetriesExhausted { .. }
            | SyncError::Cancelled => FailureClass::Fatal,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        self.failure_class() == FailureClass::Transient
    }
}

impl From<CryptoError> for SyncError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidKeyLength { expected, actual } => {
                Self::InvalidKeyLength { expected, actual }
            }
            CryptoError::IntegrityViolation { message } => Self::IntegrityViolation { message },
            CryptoError::MalformedRecord { message } => Self::MalformedRecord { message },
            other @ (CryptoError::EncryptionFailed { .. }
            | CryptoError::KeyDerivationFailed { .. }) => Self::Crypto(other.to_string()),
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::MalformedRecord { message } => Self::MalformedRecord { message },
            ProtocolError::ServerError { code, text } => Self::Server { code, text },
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::malformed("truncated").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn server_codes() {
        let conflict = SyncError::Server {
            code: 409,
            text: "conflict".into(),
        };
        let unavailable = SyncError::Server {
            code: 503,
            text: "unavailable".into(),
        };
        let forbidden = SyncError::Server {
            code: 403,
            text: "forbidden".into(),
        };
        assert_eq!(conflict.failure_class(), FailureClass::Transient);
        assert_eq!(unavailable.failure_class(), FailureClass::Transient);
        assert_eq!(forbidden.failure_class(), FailureClass::Fatal);
    }

    #[test]
    fn classification_of_key_and_integrity_errors() {
        let missing = SyncError::MissingKey {
            key_id: KeyId::new([1, 2]),
        };
        assert_eq!(missing.failure_class(), FailureClass::MissingKey);
        assert_eq!(missing.to_string(), "missing sync key 0102");

        let none = SyncError::NoSyncKey {
            patch_type: PatchType::RegularHigh,
        };
        assert_eq!(none.failure_class(), FailureClass::MissingKey);
        assert_eq!(none.to_string(), "no sync key available to push regular_high");

        let integrity: SyncError = CryptoError::integrity_violation("patch MAC mismatch").into();
        assert_eq!(integrity.failure_class(), FailureClass::Integrity);
    }

    #[test]
    fn conversions_from_lower_layers() {
        let err: SyncError = ProtocolError::ServerError {
            code: 500,
            text: "boom".into(),
        }
        .into();
        assert_eq!(
            err,
            SyncError::Server {
                code: 500,
                text: "boom".into()
            }
        );

        let err: SyncError = ProtocolError::UnknownPatchType("nope".into()).into();
        assert_eq!(err.failure_class(), FailureClass::Fatal);

        let err: SyncError = CryptoError::invalid_key_length(31, 32).into();
        assert_eq!(
            err,
            SyncError::InvalidKeyLength {
                expected: 32,
                actual: 31
            }
        );
    }

    #[test]
    fn error_display() {
        let err = SyncError::CollectionUnavailable {
            patch_type: PatchType::Regular,
            state: CollectionState::InFlight,
        };
        assert_eq!(err.to_string(), "collection regular is in_flight");
    }
}
