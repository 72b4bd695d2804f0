//! Authentication sub-protocols
//!
//! Once the raw socket reports connected, a connection whose security
//! protocol requires it enters the authenticating state and drives an
//! [`Authenticator`] one step per `connect()` call until the handshake
//! completes or fails. The connection treats all mechanisms uniformly; the
//! mechanism-specific exchange (and any cryptography it involves) lives
//! entirely behind the trait.

mod plain;

pub use plain::PlainAuthenticator;

use crate::connection::Transport;
use crate::{Error, Result};
use std::str::FromStr;

/// Progress report from a single authenticator step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// Handshake finished; the connection is usable for requests
    Complete,
    /// More I/O is needed; retry on a later `connect()` call.
    ///
    /// `made_progress` is true when bytes actually moved on the socket during
    /// this step. The connection refreshes its activity timer only then, so a
    /// slow but advancing handshake survives the connection timeout while a
    /// stalled one does not.
    InProgress {
        /// Whether any bytes were exchanged with the peer
        made_progress: bool,
    },
}

/// A resumable authentication handshake.
///
/// Implementations keep partially sent/received frames internally: a step
/// that returns [`AuthStatus::InProgress`] must be repeatable without losing
/// handshake state. Fatal outcomes (bad credentials, protocol violation,
/// peer closed) are reported as `Err`.
pub trait Authenticator: Send {
    /// Advance the handshake by at most one round of non-blocking I/O
    fn step(&mut self, transport: &mut dyn Transport) -> Result<AuthStatus>;

    /// Mechanism name for diagnostics ("PLAIN", "SCRAM-SHA-256", ...)
    fn mechanism(&self) -> &'static str;
}

/// Security protocol for a broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityProtocol {
    /// Plain TCP, no authentication
    #[default]
    Plaintext,
    /// TLS via an externally provided dialer, no authentication
    Ssl,
    /// SASL handshake over plain TCP
    SaslPlaintext,
    /// SASL handshake over an externally provided TLS dialer
    SaslSsl,
}

impl SecurityProtocol {
    /// Whether the connection must authenticate before accepting requests
    pub fn requires_auth(&self) -> bool {
        matches!(
            self,
            SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl
        )
    }
}

impl std::fmt::Display for SecurityProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityProtocol::Plaintext => write!(f, "PLAINTEXT"),
            SecurityProtocol::Ssl => write!(f, "SSL"),
            SecurityProtocol::SaslPlaintext => write!(f, "SASL_PLAINTEXT"),
            SecurityProtocol::SaslSsl => write!(f, "SASL_SSL"),
        }
    }
}

impl FromStr for SecurityProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PLAINTEXT" => Ok(SecurityProtocol::Plaintext),
            "SSL" => Ok(SecurityProtocol::Ssl),
            "SASL_PLAINTEXT" => Ok(SecurityProtocol::SaslPlaintext),
            "SASL_SSL" => Ok(SecurityProtocol::SaslSsl),
            other => Err(Error::Config(format!(
                "unknown security protocol {other:?}"
            ))),
        }
    }
}
