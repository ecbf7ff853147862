//! Error types for the protocol crate.

use thiserror::Error;

/// Broad failure class of a [`ProtocolError`].
///
/// Callers use the category to decide what to tear down: a network or crypto
/// failure ends the session, a protocol failure ends the exchange, a directory
/// failure is reported back to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connect, read or write failure.
    Network,
    /// Wrong field count, unknown command, malformed encoding.
    Protocol,
    /// Bad signature, undecryptable record.
    Crypto,
    /// Unknown uid, allocation exhaustion.
    Directory,
    /// Key or config file I/O.
    Storage,
}

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Any other socket failure.
    #[error("i/o error: {0}")]
    Io(String),

    /// Key agreement could not be completed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // Structural errors
    /// Bytes on the wire do not have the expected shape.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Field 0 of a request is not a known command tag.
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    /// A message carried the wrong number of fields.
    #[error("{context}: expected {expected} fields, got {got}")]
    FieldCount {
        /// What was being decoded.
        context: &'static str,
        /// Required number of fields.
        expected: usize,
        /// Number of fields received.
        got: usize,
    },

    /// A public key could not be parsed from its canonical encoding.
    #[error("malformed public key: {0}")]
    MalformedKey(String),

    /// Record exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual record size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Attempted an authenticated operation before the handshake finished.
    #[error("handshake incomplete: cannot perform operation before handshake is finished")]
    HandshakeIncomplete,

    /// A registered uid is configured but the server key is not cached.
    #[error("server public key missing from the local directory")]
    MissingServerKey,

    // Cryptographic errors
    /// Signature verification failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Decrypted record carried impossible padding (wrong key or corruption).
    #[error("invalid padding: wrong session key or corrupted record")]
    InvalidPadding,

    /// RSA modulus below the accepted minimum.
    #[error("key too weak: {bits} bits, minimum is {min}")]
    WeakKey {
        /// Requested modulus size.
        bits: usize,
        /// Minimum modulus size.
        min: usize,
    },

    /// Signing or key generation failed.
    #[error("signing failed: {0}")]
    Signing(String),

    // Directory errors
    /// The uid has no public key in the directory.
    #[error("unknown uid: {uid}")]
    UnknownUid {
        /// The missing uid.
        uid: String,
    },

    /// An authenticated request named a requester that never registered.
    #[error("unknown requester: {uid}")]
    UnknownRequester {
        /// The unregistered requester uid.
        uid: String,
    },

    /// The uid is already bound to a key.
    #[error("uid already assigned: {uid}")]
    UidTaken {
        /// The bound uid.
        uid: String,
    },

    /// Every uid below the limit is in use.
    #[error("uid space exhausted: all {limit} identifiers are taken")]
    DirectoryExhausted {
        /// Number of allocatable uids.
        limit: u64,
    },

    // Storage errors
    /// Key store or key file failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl ProtocolError {
    /// Returns the failure class of this error.
    pub fn category(&self) -> ErrorCategory {
        use ProtocolError::*;
        match self {
            ConnectionClosed(_) | Timeout(_) | Io(_) | HandshakeFailed(_) => ErrorCategory::Network,
            Malformed(_)
            | UnknownCommand(_)
            | FieldCount { .. }
            | MalformedKey(_)
            | FrameTooLarge { .. }
            | HandshakeIncomplete
            | MissingServerKey => ErrorCategory::Protocol,
            InvalidSignature(_) | InvalidPadding | WeakKey { .. } | Signing(_) => {
                ErrorCategory::Crypto
            }
            UnknownUid { .. }
            | UnknownRequester { .. }
            | UidTaken { .. }
            | DirectoryExhausted { .. } => ErrorCategory::Directory,
            Storage(_) => ErrorCategory::Storage,
        }
    }

    /// Whether the session must be torn down after this error.
    ///
    /// Network and crypto failures are never downgraded: once a record fails
    /// to decrypt or a signature fails to verify the peer is not trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network | ErrorCategory::Crypto
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ProtocolError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ProtocolError::Timeout(err.to_string())
    }
}

impl From<rsa::pkcs1::Error> for ProtocolError {
    fn from(err: rsa::pkcs1::Error) -> Self {
        ProtocolError::MalformedKey(err.to_string())
    }
}

impl From<rsa::signature::Error> for ProtocolError {
    fn from(err: rsa::signature::Error) -> Self {
        ProtocolError::InvalidSignature(err.to_string())
    }
}
