//! Pool error types.

use thiserror::Error;

/// Errors surfaced by the connection pool.
#[derive(Error, Debug)]
pub enum PoolError {
    /// A dial or accept is already in flight for this point.
    #[error("a connection to this point is already pending")]
    PendingConnection,

    /// The peer (or point) is already running in another connection.
    #[error("peer is already connected")]
    Connected,

    /// The remote end refused the connection.
    #[error("connection refused")]
    ConnectionRefused,

    /// The connection was closed. Socket errors are reported as this kind.
    #[error("connection closed")]
    ConnectionClosed,

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The authentication phase exceeded its budget.
    #[error("authentication timed out")]
    AuthenticationTimeout,

    /// The whole connection pipeline exceeded its budget.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// Rejected by policy: closed network or banned peer/point.
    #[error("connection rejected: {0}")]
    Rejected(String),

    /// The connection table is full.
    #[error("too many connections")]
    TooManyConnections,

    /// No common protocol version with the peer.
    #[error("no common protocol version")]
    NoCommonProtocol,

    /// A frame could not be decoded: unknown tag, over-length payload,
    /// checksum mismatch or malformed contents.
    #[error("decoding error: {0}")]
    DecodingError(String),

    /// The dialed peer presented our own identity.
    #[error("dialed our own identity")]
    Myself,
}

impl From<std::io::Error> for PoolError {
    fn from(_: std::io::Error) -> Self {
        PoolError::ConnectionClosed
    }
}

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_map_to_connection_closed() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: PoolError = io.into();
        assert!(matches!(err, PoolError::ConnectionClosed));
    }
}
