//! Error types

use std::io;

/// Main error type for broker connection operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection is disconnected, or failed while an operation was live
    #[error("connection error: {0}")]
    Connection(String),

    /// The peer closed the socket
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A connect or auth attempt is still in progress; requests are not
    /// accepted until the connection reaches the connected state
    #[error("node not ready: {0}")]
    NodeNotReady(String),

    /// The in-flight request limit is reached
    #[error("too many in-flight requests (limit {0})")]
    TooManyInFlightRequests(usize),

    /// Malformed or unexpected wire data; fatal for the connection
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The authentication handshake failed
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Invalid configuration or host specification
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the failed operation may succeed after a reconnect.
    ///
    /// Capacity and readiness errors (`NodeNotReady`,
    /// `TooManyInFlightRequests`) are local to a single request and leave the
    /// connection intact; connection-level errors require a fresh attempt.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Error::Protocol(_) | Error::Authentication(_) | Error::Config(_)
        )
    }
}
