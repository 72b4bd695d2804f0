//! Broker connection state machine
//!
//! A [`BrokerConnection`] is a poll-driven, non-blocking connection to a
//! single broker. The caller owns the event loop: it calls `connect()`
//! repeatedly until the connection reaches the connected state, then `send()`
//! and `recv()` as its loop allows. No call blocks; progress happens one
//! non-blocking step at a time.

pub mod backoff;
pub mod conn;
pub mod state;
pub mod transport;

pub use backoff::ReconnectBackoff;
pub use conn::{BrokerConnection, ConnectionConfig, ConnectionConfigBuilder};
pub use state::ConnectionState;
pub use transport::{ConnectPoll, Dialer, TcpDialer, TcpTransport, Transport};
