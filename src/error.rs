//! Error types for analyzer link operations
//!
//! This module defines all error types that can occur while ingesting
//! analyzer traffic, persisting records, and pushing results upstream.

use thiserror::Error;

/// Analyzer link error types
///
/// All fallible operations in this library return `Result<T, LinkError>`
/// to provide explicit error handling.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Malformed frame received from an analyzer
    ///
    /// This error occurs when:
    /// - A frame terminator (ETX/ETB) is missing or misplaced
    /// - The frame is too short to carry the checksum the dialect requires
    /// - The frame number is not a single ASCII digit
    ///
    /// Framing errors are answered with NAK on the wire; the session
    /// itself continues.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame checksum mismatch
    ///
    /// The 2-hex-digit ASTM checksum did not match the XOR computed over
    /// the received frame. The frame is discarded and NAK is returned to
    /// the analyzer so it can retransmit.
    #[error("Checksum mismatch: expected {expected:02X}, got {actual:02X}")]
    ChecksumMismatch {
        /// Checksum carried in the frame trailer
        expected: u8,
        /// Checksum computed over the received bytes
        actual: u8,
    },

    /// Record could not be interpreted
    ///
    /// This error occurs when:
    /// - A record has fewer fields than the dialect's layout requires
    /// - An XML payload fails to parse after sanitization
    /// - A mandatory identifier is absent from both P and O records
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Listener configuration rejected
    ///
    /// Ports must be unique across the active listener set, and every
    /// listener needs a resolvable bind address.
    #[error("Invalid listener configuration: {0}")]
    InvalidConfig(String),

    /// Persistence gateway failure
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Outbound synchronization failure
    ///
    /// Raised for non-2xx upstream responses and payload construction
    /// failures. Transport-level failures surface as [`LinkError::Http`].
    /// Affected records keep their local sync status and are retried with
    /// backoff.
    #[error("Sync failed: {0}")]
    Sync(String),

    /// Authentication failure during sync
    ///
    /// This error occurs when:
    /// - The OAuth2 token endpoint rejects the client credentials
    /// - The token response omits `access_token`
    ///
    /// The sync attempt is aborted rather than sent unauthenticated.
    #[error("Auth error: {0}")]
    Auth(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error occurred during network communication
    ///
    /// Wraps standard library I/O errors: bind failures, resets, broken
    /// pipes, timeouts. A session-level I/O error tears down that session
    /// only; the listener keeps accepting.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sync payload could not be serialized
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type alias for analyzer link operations
pub type Result<T> = std::result::Result<T, LinkError>;
