//! Error types for the crypto crate.

use appstate_protocol::ProtocolError;
use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur while deriving keys, decrypting or verifying.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong size.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required length.
        expected: usize,
        /// Supplied length.
        actual: usize,
    },

    /// A MAC or hash did not match.
    #[error("integrity violation: {message}")]
    IntegrityViolation {
        /// What failed to verify.
        message: String,
    },

    /// A record could not be split or decoded.
    #[error("malformed record: {message}")]
    MalformedRecord {
        /// Description of the problem.
        message: String,
    },

    /// Encryption failed.
    #[error("encryption failed: {message}")]
    EncryptionFailed {
        /// Description of the problem.
        message: String,
    },

    /// HKDF expansion failed.
    #[error("key derivation failed: {message}")]
    KeyDerivationFailed {
        /// Description of the problem.
        message: String,
    },
}

impl CryptoError {
    /// Creates an invalid key length error.
    pub fn invalid_key_length(actual: usize, expected: usize) -> Self {
        Self::InvalidKeyLength { expected, actual }
    }

    /// Creates an integrity violation error.
    pub fn integrity_violation(message: impl Into<String>) -> Self {
        Self::IntegrityViolation {
            message: message.into(),
        }
    }

    /// Creates a malformed record error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRecord {
            message: message.into(),
        }
    }

    /// Creates an encryption failed error.
    pub fn encryption_failed(message: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            message: message.into(),
        }
    }

    /// Creates a key derivation failed error.
    pub fn key_derivation_failed(message: impl Into<String>) -> Self {
        Self::KeyDerivationFailed {
            message: message.into(),
        }
    }

    /// Returns true for MAC and hash mismatches.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, CryptoError::IntegrityViolation { .. })
    }
}

impl From<ProtocolError> for CryptoError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::EncodingFailed { message } => Self::EncryptionFailed { message },
            other => Self::MalformedRecord {
                message: other.to_string(),
            },
        }
    }
}
