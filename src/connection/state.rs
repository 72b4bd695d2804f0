//! Connection lifecycle states

/// Lifecycle state of a broker connection.
///
/// Transitions are driven by repeated `connect()` calls:
///
/// ```text
/// Disconnected -> Connecting -> [Authenticating ->] Connected
/// ```
///
/// Any state can fall back to `Disconnected` on error, timeout, or an
/// explicit close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; the connection may be blacked out after a failure
    Disconnected,
    /// Non-blocking TCP connect in progress
    Connecting,
    /// Socket established, authentication handshake in progress
    Authenticating,
    /// Ready to send requests and receive responses
    Connected,
}

impl ConnectionState {
    /// Check whether a transition to `next` is valid
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Disconnected, ConnectionState::Connecting)
                | (ConnectionState::Connecting, ConnectionState::Authenticating)
                | (ConnectionState::Connecting, ConnectionState::Connected)
                | (ConnectionState::Authenticating, ConnectionState::Connected)
                | (_, ConnectionState::Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}
