//! Error types for the dispatcher and its collaborators.

use std::time::Duration;

use hickory_proto::error::ProtoError;
use thiserror::Error;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading configuration or talking to an upstream.
///
/// None of these escape `Dispatcher::exchange`; upstream failures are folded
/// into "no answer from this upstream".
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or inconsistent configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be deserialized
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Upstream address could not be turned into a dial target
    #[error("invalid upstream address '{address}': {reason}")]
    InvalidUpstream { address: String, reason: String },

    /// Exchange exceeded the upstream's timeout
    #[error("exchange with {upstream} timed out after {timeout:?}")]
    Timeout { upstream: String, timeout: Duration },

    /// SOCKS5 negotiation failed
    #[error("SOCKS5 proxy error: {0}")]
    Socks5(String),

    /// TLS setup or handshake failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Reply did not answer the query that was sent
    #[error("reply id {got} does not match query id {expected}")]
    IdMismatch { expected: u16, got: u16 },

    /// DNS message could not be encoded or decoded
    #[error("malformed DNS message: {0}")]
    Proto(#[from] ProtoError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
