//! # kafka-conn
//!
//! A single-broker Kafka connection driven as an explicit, non-blocking state
//! machine. No event loop is embedded: the caller polls the connection from
//! its own control flow (typically one thread or reactor slot per broker) and
//! every operation returns immediately.
//!
//! ## Features
//!
//! - **Re-entrant `connect()`**: resumes an in-progress TCP connect or SASL
//!   handshake across many short calls; "would block" is a normal outcome
//! - **DNS-family fallback**: host specs resolve to candidate addresses that
//!   are tried in sequence, re-resolving once the list is exhausted
//! - **Correlation tracking**: in-flight requests are matched to responses by
//!   correlation id and observed through completion handles
//! - **Blackout/backoff**: failed attempts are throttled with exponential
//!   backoff plus jitter
//! - **Pluggable auth and transport**: SASL mechanisms and secure-transport
//!   wrappers plug in behind small traits
//! - **Observability**: `tracing` logs and `metrics` counters/histograms
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use kafka_conn::{AddressFamily, BrokerConnection, ConnectionConfig, Request};
//! use kafka_conn::protocol::constants::api_keys;
//!
//! let config = ConnectionConfig::builder().client_id("example").build();
//! let mut conn = BrokerConnection::new("localhost", 9092, AddressFamily::Unspecified, config);
//!
//! // Drive the connection from a poll loop until it is usable.
//! while !conn.connected() {
//!     conn.connect();
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//!
//! let future = conn.send(Request::new(api_keys::API_VERSIONS, 0, Bytes::new()));
//! while !future.is_done() {
//!     conn.recv();
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! ```

pub mod auth;
pub mod connection;
pub mod error;
pub mod future;
pub mod metrics;
pub mod protocol;
pub mod resolver;

pub use auth::{AuthStatus, Authenticator, PlainAuthenticator, SecurityProtocol};
pub use connection::{
    BrokerConnection, ConnectPoll, ConnectionConfig, ConnectionConfigBuilder, ConnectionState,
    Dialer, ReconnectBackoff, TcpDialer, TcpTransport, Transport,
};
pub use error::Error;
pub use future::ResponseFuture;
pub use protocol::{Request, Response};
pub use resolver::{
    collect_hosts, collect_hosts_list, AddressFamily, BrokerAddr, Resolve, SystemResolver,
    DEFAULT_PORT,
};

/// Crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
