//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while building or parsing protocol documents.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A record or document could not be decoded.
    #[error("malformed record: {message}")]
    MalformedRecord {
        /// Description of the problem.
        message: String,
    },

    /// A record could not be encoded.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the problem.
        message: String,
    },

    /// The collection name is not a known patch type.
    #[error("unknown patch type: {0}")]
    UnknownPatchType(String),

    /// The response describes a different collection than the one requested.
    #[error("unexpected collection in response: expected {expected}, got {actual}")]
    UnexpectedCollection {
        /// Collection that was requested.
        expected: String,
        /// Collection found in the response.
        actual: String,
    },

    /// The server answered with an error element.
    #[error("server error {code}: {text}")]
    ServerError {
        /// Numeric error code.
        code: u16,
        /// Human-readable error text.
        text: String,
    },
}

impl ProtocolError {
    /// Creates a malformed record error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRecord {
            message: message.into(),
        }
    }

    /// Creates an encoding error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Returns true if a server error may succeed when retried.
    ///
    /// 409 means the server has patches the client has not seen yet; the
    /// client must pull before pushing again.
    pub fn is_retryable_server_error(&self) -> bool {
        match self {
            ProtocolError::ServerError { code, .. } => *code == 409 || *code >= 500,
            _ => false,
        }
    }
}
