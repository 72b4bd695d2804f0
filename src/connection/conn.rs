//! Single-broker connection state machine

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, info, trace, warn};

use super::backoff::ReconnectBackoff;
use super::state::ConnectionState;
use super::transport::{ConnectPoll, Dialer, TcpDialer, Transport};
use crate::auth::{AuthStatus, Authenticator, PlainAuthenticator, SecurityProtocol};
use crate::future::ResponseFuture;
use crate::metrics::{counters, histograms};
use crate::protocol::{decode_response, encode_request, try_decode_frame, Request, Response};
use crate::resolver::{AddressFamily, BrokerAddr, Resolve, SystemResolver};
use crate::Error;

/// Connection tuning knobs
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Client id sent in every request header
    pub client_id: String,
    /// Maximum wall time a connect or auth attempt may go without progress
    pub connection_timeout: Duration,
    /// Maximum wall time an in-flight request may wait for its response
    pub request_timeout: Duration,
    /// Base blackout after the first consecutive failure
    pub reconnect_backoff: Duration,
    /// Blackout cap, before jitter
    pub reconnect_backoff_max: Duration,
    /// In-flight request limit
    pub max_in_flight_requests_per_connection: usize,
    /// Security protocol for this connection
    pub security_protocol: SecurityProtocol,
    /// SASL PLAIN username, required for SASL protocols unless a custom
    /// authenticator is installed
    pub sasl_plain_username: Option<String>,
    /// SASL PLAIN password
    pub sasl_plain_password: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            client_id: "kafka-conn".to_string(),
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            reconnect_backoff: Duration::from_millis(50),
            reconnect_backoff_max: Duration::from_secs(1),
            max_in_flight_requests_per_connection: 5,
            security_protocol: SecurityProtocol::Plaintext,
            sasl_plain_username: None,
            sasl_plain_password: None,
        }
    }
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder {
            config: ConnectionConfig::default(),
        }
    }
}

/// Builder for [`ConnectionConfig`]
#[derive(Debug, Clone)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn reconnect_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.reconnect_backoff = base;
        self.config.reconnect_backoff_max = max;
        self
    }

    pub fn max_in_flight_requests(mut self, limit: usize) -> Self {
        self.config.max_in_flight_requests_per_connection = limit;
        self
    }

    pub fn security_protocol(mut self, protocol: SecurityProtocol) -> Self {
        self.config.security_protocol = protocol;
        self
    }

    pub fn sasl_plain_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.config.sasl_plain_username = Some(username.into());
        self.config.sasl_plain_password = Some(password.into());
        self
    }

    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

struct InFlightRequest {
    sent_at: Instant,
    future: ResponseFuture,
}

type AuthFactory = Box<dyn Fn() -> Box<dyn Authenticator> + Send>;

/// A poll-driven, non-blocking connection to a single broker.
///
/// Nothing here blocks: the caller drives progress by calling [`connect`]
/// until the connection reaches [`ConnectionState::Connected`], then
/// [`send`], [`send_pending`] and [`recv`] as its event loop allows. After a
/// failure the connection blacks itself out for an exponentially growing,
/// jittered interval before [`connect`] will try again.
///
/// [`connect`]: BrokerConnection::connect
/// [`send`]: BrokerConnection::send
/// [`send_pending`]: BrokerConnection::send_pending
/// [`recv`]: BrokerConnection::recv
pub struct BrokerConnection {
    host: String,
    port: u16,
    family: AddressFamily,
    config: ConnectionConfig,

    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    dialer: Box<dyn Dialer>,
    resolver: Box<dyn Resolve>,
    auth_factory: Option<AuthFactory>,
    authenticator: Option<Box<dyn Authenticator>>,

    addrs: Vec<SocketAddr>,
    addr_index: usize,

    last_activity: Instant,
    last_attempt: Instant,
    auth_started: Instant,
    failures: u32,
    current_blackout: Duration,
    backoff: ReconnectBackoff,

    correlation_id: i32,
    in_flight: BTreeMap<i32, InFlightRequest>,
    send_buf: BytesMut,
    recv_buf: BytesMut,
}

impl BrokerConnection {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        family: AddressFamily,
        config: ConnectionConfig,
    ) -> Self {
        let backoff = ReconnectBackoff::new(config.reconnect_backoff, config.reconnect_backoff_max);
        Self {
            host: host.into(),
            port,
            family,
            config,
            state: ConnectionState::Disconnected,
            transport: None,
            dialer: Box::new(TcpDialer),
            resolver: Box::new(SystemResolver),
            auth_factory: None,
            authenticator: None,
            addrs: Vec::new(),
            addr_index: 0,
            last_activity: Instant::now(),
            last_attempt: Instant::now(),
            auth_started: Instant::now(),
            failures: 0,
            current_blackout: Duration::ZERO,
            backoff,
            correlation_id: 0,
            in_flight: BTreeMap::new(),
            send_buf: BytesMut::new(),
            recv_buf: BytesMut::new(),
        }
    }

    /// Build a connection from a parsed host entry
    pub fn from_broker_addr(addr: BrokerAddr, config: ConnectionConfig) -> Self {
        Self::new(addr.host, addr.port, addr.family, config)
    }

    /// Replace the dialer, e.g. with one that wraps streams in TLS
    pub fn with_dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Box::new(dialer);
        self
    }

    /// Replace the DNS resolver
    pub fn with_resolver(mut self, resolver: impl Resolve + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Install a factory for custom authenticators.
    ///
    /// The factory is invoked once per connection attempt, so reconnects get
    /// a fresh handshake. Without one, SASL protocols fall back to PLAIN
    /// using the configured credentials.
    pub fn with_authenticator<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Authenticator> + Send + 'static,
    {
        self.auth_factory = Some(Box::new(factory));
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn connecting(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Authenticating
        )
    }

    pub fn disconnected(&self) -> bool {
        self.state == ConnectionState::Disconnected
    }

    /// Whether the connection is serving a post-failure blackout
    pub fn blacked_out(&self) -> bool {
        self.state == ConnectionState::Disconnected
            && self.last_activity.elapsed() < self.current_blackout
    }

    /// Time until the next `connect()` call can make progress.
    ///
    /// While disconnected this is the remaining blackout (zero when a retry
    /// is allowed now). For a live connection there is no point polling on a
    /// timer, so the delay is effectively infinite; readiness comes from
    /// socket events instead.
    pub fn connection_delay(&self) -> Duration {
        match self.state {
            ConnectionState::Disconnected => self
                .current_blackout
                .saturating_sub(self.last_activity.elapsed()),
            _ => Duration::MAX,
        }
    }

    /// Whether another request fits under the in-flight limit
    pub fn can_send_more(&self) -> bool {
        self.in_flight.len() < self.config.max_in_flight_requests_per_connection
    }

    /// Number of requests awaiting responses
    pub fn in_flight_requests(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether any in-flight request has outlived the request timeout.
    ///
    /// Responses on one connection arrive strictly in request order, so a
    /// timed-out oldest request means everything behind it is stuck too. The
    /// caller's remedy is `close()`, not waiting.
    pub fn requests_timed_out(&self) -> bool {
        self.in_flight
            .values()
            .any(|entry| entry.sent_at.elapsed() > self.config.request_timeout)
    }

    /// Advance the connection by one non-blocking step.
    ///
    /// Safe to call in any state; returns the state after the step. Call
    /// repeatedly (respecting [`connection_delay`]) until it reports
    /// [`ConnectionState::Connected`].
    ///
    /// [`connection_delay`]: BrokerConnection::connection_delay
    pub fn connect(&mut self) -> ConnectionState {
        if self.connecting() && self.last_activity.elapsed() > self.config.connection_timeout {
            warn!(
                conn = %self,
                timeout = ?self.config.connection_timeout,
                "connect attempt timed out without progress"
            );
            counters::connect_timeout();
            self.fail_attempt(Error::Connection(format!(
                "connect attempt timed out after {:?}",
                self.config.connection_timeout
            )));
            return self.state;
        }

        match self.state {
            ConnectionState::Disconnected => self.step_disconnected(),
            ConnectionState::Connecting => self.step_connecting(),
            ConnectionState::Authenticating => self.step_authenticating(),
            ConnectionState::Connected => {}
        }
        self.state
    }

    fn step_disconnected(&mut self) {
        if self.blacked_out() {
            return;
        }

        let addr = match self.next_addr() {
            Some(addr) => addr,
            None => {
                warn!(conn = %self, "no addresses available for broker");
                self.register_failure();
                return;
            }
        };

        counters::connect_attempted();
        self.last_attempt = Instant::now();
        self.last_activity = Instant::now();
        debug!(conn = %self, %addr, "initiating connection");

        match self.dialer.dial(addr) {
            Ok(transport) => {
                self.transport = Some(transport);
                self.transition(ConnectionState::Connecting);
                // The connect may have completed synchronously (loopback)
                self.step_connecting();
            }
            Err(e) => self.fail_attempt(Error::Io(e)),
        }
    }

    fn step_connecting(&mut self) {
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => {
                self.fail_attempt(Error::Connection("transport lost while connecting".into()));
                return;
            }
        };

        match transport.poll_connect() {
            // Not refreshing the activity timer here is what makes the
            // connection timeout fire on a socket that never completes
            Ok(ConnectPoll::Pending) => {}
            Ok(ConnectPoll::Connected) => {
                if self.config.security_protocol.requires_auth() {
                    match self.make_authenticator() {
                        Ok(authenticator) => {
                            counters::auth_attempted(authenticator.mechanism());
                            debug!(
                                conn = %self,
                                mechanism = authenticator.mechanism(),
                                "socket connected, starting authentication"
                            );
                            self.authenticator = Some(authenticator);
                            self.auth_started = Instant::now();
                            self.last_activity = Instant::now();
                            self.transition(ConnectionState::Authenticating);
                        }
                        Err(e) => self.fail_attempt(e),
                    }
                } else {
                    self.finish_connect();
                }
            }
            Err(e) => self.fail_attempt(Error::Io(e)),
        }
    }

    fn step_authenticating(&mut self) {
        let mut authenticator = match self.authenticator.take() {
            Some(authenticator) => authenticator,
            None => {
                self.fail_attempt(Error::Authentication(
                    "authenticator lost mid-handshake".into(),
                ));
                return;
            }
        };
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => {
                self.fail_attempt(Error::Connection(
                    "transport lost while authenticating".into(),
                ));
                return;
            }
        };

        match authenticator.step(transport.as_mut()) {
            Ok(AuthStatus::Complete) => {
                counters::auth_successful(authenticator.mechanism());
                histograms::auth_duration(authenticator.mechanism(), self.auth_started.elapsed());
                self.finish_connect();
            }
            Ok(AuthStatus::InProgress { made_progress }) => {
                if made_progress {
                    self.last_activity = Instant::now();
                }
                self.authenticator = Some(authenticator);
            }
            Err(e) => {
                warn!(conn = %self, error = %e, "authentication failed");
                counters::auth_failed(authenticator.mechanism());
                self.fail_attempt(e);
            }
        }
    }

    fn finish_connect(&mut self) {
        self.transition(ConnectionState::Connected);
        self.last_activity = Instant::now();
        self.failures = 0;
        self.current_blackout = Duration::ZERO;
        counters::connect_established();
        histograms::connect_duration(self.last_attempt.elapsed());
        info!(conn = %self, "connection established");
    }

    fn make_authenticator(&self) -> crate::Result<Box<dyn Authenticator>> {
        if let Some(factory) = &self.auth_factory {
            return Ok(factory());
        }
        match (
            &self.config.sasl_plain_username,
            &self.config.sasl_plain_password,
        ) {
            (Some(username), Some(password)) => {
                Ok(Box::new(PlainAuthenticator::new(username, password)))
            }
            _ => Err(Error::Config(format!(
                "security protocol {} requires sasl credentials or a custom authenticator",
                self.config.security_protocol
            ))),
        }
    }

    /// Next candidate address, re-resolving once the current list is spent
    fn next_addr(&mut self) -> Option<SocketAddr> {
        if self.addr_index >= self.addrs.len() {
            self.addr_index = 0;
            self.addrs = match self.resolver.resolve(&self.host, self.port, self.family) {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!(conn = %self, error = %e, "dns lookup failed");
                    Vec::new()
                }
            };
            if !self.addrs.is_empty() {
                debug!(conn = %self, count = self.addrs.len(), "resolved broker addresses");
            }
        }
        self.addrs.get(self.addr_index).copied()
    }

    fn register_failure(&mut self) {
        self.failures += 1;
        self.current_blackout = self.backoff.backoff(self.failures);
        self.last_activity = Instant::now();
    }

    /// Fail the current attempt: advance to the next candidate address for
    /// the following attempt, then close with the error
    fn fail_attempt(&mut self, error: Error) {
        self.addr_index += 1;
        counters::connect_failed();
        self.close(Some(error));
    }

    /// Tear the connection down.
    ///
    /// All in-flight requests fail through their handles. With an error the
    /// failure counter grows and a new blackout starts; a clean close instead
    /// drops the resolved address list so the next attempt re-resolves DNS.
    pub fn close(&mut self, error: Option<Error>) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
        }
        self.authenticator = None;
        self.send_buf.clear();
        self.recv_buf.clear();

        let reason = match &error {
            Some(e) => e.to_string(),
            None => format!("{self} closed"),
        };
        self.fail_all_in_flight(&reason);

        if self.state != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected);
        }

        match error {
            Some(e) => {
                self.register_failure();
                warn!(
                    conn = %self,
                    error = %e,
                    failures = self.failures,
                    blackout = ?self.current_blackout,
                    "connection closed"
                );
            }
            None => {
                self.addrs.clear();
                self.addr_index = 0;
                self.last_activity = Instant::now();
                debug!(conn = %self, "connection closed");
            }
        }
    }

    fn fail_all_in_flight(&mut self, reason: &str) {
        let in_flight = std::mem::take(&mut self.in_flight);
        if in_flight.is_empty() {
            return;
        }
        counters::in_flight_failed(in_flight.len() as u64);
        for (correlation_id, entry) in in_flight {
            trace!(conn = %self, correlation_id, "failing in-flight request");
            entry.future.fail(Error::Connection(reason.to_string()));
        }
    }

    fn next_correlation_id(&mut self) -> i32 {
        self.correlation_id = if self.correlation_id == i32::MAX {
            0
        } else {
            self.correlation_id + 1
        };
        self.correlation_id
    }

    /// Queue a request for sending.
    ///
    /// Never blocks and never returns an error directly: admission failures
    /// (disconnected, still connecting, in-flight limit) fail the returned
    /// handle immediately without touching the socket. Fire-and-forget
    /// requests resolve their handle to `Ok(None)` as soon as the frame is
    /// queued.
    pub fn send(&mut self, request: Request) -> ResponseFuture {
        let future = ResponseFuture::new();
        match self.state {
            ConnectionState::Disconnected => {
                future.fail(Error::Connection(format!("{self} is disconnected")));
                return future;
            }
            ConnectionState::Connecting | ConnectionState::Authenticating => {
                future.fail(Error::NodeNotReady(self.state.to_string()));
                return future;
            }
            ConnectionState::Connected => {}
        }
        if !self.can_send_more() {
            future.fail(Error::TooManyInFlightRequests(
                self.config.max_in_flight_requests_per_connection,
            ));
            return future;
        }

        let correlation_id = self.next_correlation_id();
        let frame = encode_request(&request, correlation_id, Some(&self.config.client_id));
        self.send_buf.extend_from_slice(&frame);

        if let Err(e) = self.flush_send_buf() {
            future.fail(Error::Connection(e.to_string()));
            self.close(Some(Error::Io(e)));
            return future;
        }

        counters::request_sent();
        trace!(
            conn = %self,
            correlation_id,
            api_key = request.api_key,
            "request queued"
        );

        if request.expect_response {
            self.in_flight.insert(
                correlation_id,
                InFlightRequest {
                    sent_at: Instant::now(),
                    future: future.clone(),
                },
            );
        } else {
            future.resolve(None);
        }
        future
    }

    /// Retry sending bytes a previous `send()` could not fully write
    pub fn send_pending(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if let Err(e) = self.flush_send_buf() {
            self.close(Some(Error::Io(e)));
        }
    }

    fn flush_send_buf(&mut self) -> io::Result<()> {
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => return Ok(()),
        };
        while !self.send_buf.is_empty() {
            match transport.send(&self.send_buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = self.send_buf.split_to(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drain readable bytes and return any completed responses.
    ///
    /// Each response also resolves its request's handle, so callers may
    /// consume results from either side. A peer close, read error, decode
    /// error, or a response with no matching in-flight request tears the
    /// connection down; already-decoded responses from the same call are
    /// still returned.
    pub fn recv(&mut self) -> Vec<Response> {
        let mut responses = Vec::new();
        if self.state != ConnectionState::Connected {
            return responses;
        }

        // Flush first so a request stuck in the send buffer cannot deadlock
        // a caller that only polls recv
        self.send_pending();
        if self.state != ConnectionState::Connected {
            return responses;
        }

        let mut chunk = [0u8; 4096];
        loop {
            let transport = match self.transport.as_mut() {
                Some(transport) => transport,
                None => break,
            };
            match transport.recv(&mut chunk) {
                Ok(0) => {
                    self.close(Some(Error::ConnectionClosed));
                    return responses;
                }
                Ok(n) => {
                    self.recv_buf.extend_from_slice(&chunk[..n]);
                    self.last_activity = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close(Some(Error::Io(e)));
                    return responses;
                }
            }
        }

        loop {
            let frame = match try_decode_frame(&mut self.recv_buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.close(Some(e));
                    return responses;
                }
            };
            let response = match decode_response(frame) {
                Ok(response) => response,
                Err(e) => {
                    self.close(Some(e));
                    return responses;
                }
            };
            match self.in_flight.remove(&response.correlation_id) {
                Some(entry) => {
                    counters::response_received();
                    trace!(
                        conn = %self,
                        correlation_id = response.correlation_id,
                        bytes = response.body.len(),
                        "response received"
                    );
                    entry.future.resolve(Some(response.clone()));
                    responses.push(response);
                }
                None => {
                    self.close(Some(Error::Protocol(format!(
                        "response with unexpected correlation id {}",
                        response.correlation_id
                    ))));
                    return responses;
                }
            }
        }
        responses
    }

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {next}",
            self.state
        );
        debug!(conn = %self, from = %self.state, to = %next, "state change");
        self.state = next;
    }
}

impl std::fmt::Display for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} <{}>", self.host, self.port, self.state)
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("family", &self.family)
            .field("state", &self.state)
            .field("failures", &self.failures)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MockScript {
        connect_polls: VecDeque<io::Result<ConnectPoll>>,
        send_results: VecDeque<io::Result<usize>>,
        recv_data: VecDeque<io::Result<Vec<u8>>>,
        dial_errors: VecDeque<io::Error>,
        sent: Vec<u8>,
        dials: usize,
        shutdowns: usize,
    }

    type SharedScript = Arc<Mutex<MockScript>>;

    fn script() -> SharedScript {
        Arc::new(Mutex::new(MockScript::default()))
    }

    /// Scripted transport; exhausted queues mean "connected, accepts all
    /// writes, nothing to read".
    struct MockTransport {
        script: SharedScript,
    }

    impl Transport for MockTransport {
        fn poll_connect(&mut self) -> io::Result<ConnectPoll> {
            match self.script.lock().unwrap().connect_polls.pop_front() {
                Some(result) => result,
                None => Ok(ConnectPoll::Connected),
            }
        }

        fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut script = self.script.lock().unwrap();
            match script.send_results.pop_front() {
                Some(Ok(n)) => {
                    let n = n.min(buf.len());
                    script.sent.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => {
                    script.sent.extend_from_slice(buf);
                    Ok(buf.len())
                }
            }
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.script.lock().unwrap().recv_data.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }

        fn shutdown(&mut self) {
            self.script.lock().unwrap().shutdowns += 1;
        }
    }

    struct MockDialer {
        script: SharedScript,
    }

    impl Dialer for MockDialer {
        fn dial(&self, _addr: SocketAddr) -> io::Result<Box<dyn Transport>> {
            let mut script = self.script.lock().unwrap();
            script.dials += 1;
            if let Some(e) = script.dial_errors.pop_front() {
                return Err(e);
            }
            Ok(Box::new(MockTransport {
                script: self.script.clone(),
            }))
        }
    }

    /// Resolver with optional scripted results; falls back to loopback
    #[derive(Clone, Default)]
    struct TestResolver {
        calls: Arc<AtomicUsize>,
        scripted: Arc<Mutex<VecDeque<Vec<SocketAddr>>>>,
    }

    impl Resolve for TestResolver {
        fn resolve(
            &self,
            _host: &str,
            port: u16,
            _family: AddressFamily,
        ) -> io::Result<Vec<SocketAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.scripted.lock().unwrap().pop_front() {
                Some(addrs) => Ok(addrs),
                None => Ok(vec![SocketAddr::from(([127, 0, 0, 1], port))]),
            }
        }
    }

    /// Authenticator driven by a shared script of step outcomes
    struct MockAuth {
        script: Arc<Mutex<VecDeque<crate::Result<AuthStatus>>>>,
    }

    impl Authenticator for MockAuth {
        fn step(&mut self, _transport: &mut dyn Transport) -> crate::Result<AuthStatus> {
            match self.script.lock().unwrap().pop_front() {
                Some(result) => result,
                None => Ok(AuthStatus::Complete),
            }
        }

        fn mechanism(&self) -> &'static str {
            "MOCK"
        }
    }

    fn mock_conn(script: &SharedScript, config: ConnectionConfig) -> BrokerConnection {
        BrokerConnection::new("localhost", 9092, AddressFamily::Unspecified, config)
            .with_dialer(MockDialer {
                script: script.clone(),
            })
            .with_resolver(TestResolver::default())
    }

    fn sasl_conn(
        script: &SharedScript,
        auth_script: Vec<crate::Result<AuthStatus>>,
    ) -> BrokerConnection {
        let auth_script = Arc::new(Mutex::new(VecDeque::from(auth_script)));
        let config = ConnectionConfig::builder()
            .security_protocol(SecurityProtocol::SaslPlaintext)
            .build();
        mock_conn(script, config).with_authenticator(move || {
            Box::new(MockAuth {
                script: auth_script.clone(),
            })
        })
    }

    fn connect_to_connected(conn: &mut BrokerConnection) {
        for _ in 0..10 {
            if conn.connect() == ConnectionState::Connected {
                return;
            }
        }
        panic!("connection never reached connected: {conn:?}");
    }

    fn response_frame(correlation_id: i32, body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        frame.extend_from_slice(&correlation_id.to_be_bytes());
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn test_connect_completes_after_pending_polls() {
        let script = script();
        {
            let mut s = script.lock().unwrap();
            s.connect_polls.push_back(Ok(ConnectPoll::Pending));
            s.connect_polls.push_back(Ok(ConnectPoll::Pending));
            s.connect_polls.push_back(Ok(ConnectPoll::Connected));
        }
        let mut conn = mock_conn(&script, ConnectionConfig::default());

        assert_eq!(conn.connect(), ConnectionState::Connecting);
        assert!(conn.connecting());
        assert_eq!(conn.connect(), ConnectionState::Connecting);
        assert_eq!(conn.connect(), ConnectionState::Connected);
        assert!(conn.connected());
        assert_eq!(conn.failures, 0);
    }

    #[test]
    fn test_connect_immediate_success() {
        let script = script();
        let mut conn = mock_conn(&script, ConnectionConfig::default());
        assert_eq!(conn.connect(), ConnectionState::Connected);
        assert_eq!(script.lock().unwrap().dials, 1);
    }

    #[test]
    fn test_connect_error_blacks_out() {
        let script = script();
        {
            let mut s = script.lock().unwrap();
            s.connect_polls.push_back(Ok(ConnectPoll::Pending));
            s.connect_polls
                .push_back(Err(io::Error::from(io::ErrorKind::ConnectionRefused)));
        }
        let mut conn = mock_conn(&script, ConnectionConfig::default());

        assert_eq!(conn.connect(), ConnectionState::Connecting);
        assert_eq!(conn.connect(), ConnectionState::Disconnected);
        assert_eq!(script.lock().unwrap().shutdowns, 1);
        assert_eq!(conn.failures, 1);
        assert!(conn.blacked_out());
    }

    #[test]
    fn test_dial_error_blacks_out() {
        let script = script();
        script
            .lock()
            .unwrap()
            .dial_errors
            .push_back(io::Error::from(io::ErrorKind::ConnectionRefused));
        let mut conn = mock_conn(&script, ConnectionConfig::default());

        assert_eq!(conn.connect(), ConnectionState::Disconnected);
        assert_eq!(conn.failures, 1);
        assert!(conn.blacked_out());
    }

    #[test]
    fn test_pending_poll_does_not_refresh_activity() {
        let script = script();
        script
            .lock()
            .unwrap()
            .connect_polls
            .push_back(Ok(ConnectPoll::Pending));
        let mut conn = mock_conn(&script, ConnectionConfig::default());

        assert_eq!(conn.connect(), ConnectionState::Connecting);
        conn.last_activity = Instant::now() - Duration::from_secs(5);
        script
            .lock()
            .unwrap()
            .connect_polls
            .push_back(Ok(ConnectPoll::Pending));

        assert_eq!(conn.connect(), ConnectionState::Connecting);
        assert!(conn.last_activity.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn test_connect_timeout_forces_disconnect() {
        let script = script();
        script
            .lock()
            .unwrap()
            .connect_polls
            .push_back(Ok(ConnectPoll::Pending));
        let mut conn = mock_conn(&script, ConnectionConfig::default());

        assert_eq!(conn.connect(), ConnectionState::Connecting);
        conn.last_activity = Instant::now() - (conn.config.connection_timeout + Duration::from_secs(1));

        assert_eq!(conn.connect(), ConnectionState::Disconnected);
        assert!(conn.blacked_out());
    }

    #[test]
    fn test_slow_handshake_survives_while_progressing() {
        let script = script();
        let mut conn = sasl_conn(
            &script,
            vec![
                Ok(AuthStatus::InProgress { made_progress: true }),
                Ok(AuthStatus::InProgress {
                    made_progress: false,
                }),
            ],
        );
        let timeout = conn.config.connection_timeout;

        assert_eq!(conn.connect(), ConnectionState::Authenticating);

        // Progress refreshes the activity timer
        conn.last_activity = Instant::now() - timeout / 2;
        assert_eq!(conn.connect(), ConnectionState::Authenticating);
        assert!(conn.last_activity.elapsed() < Duration::from_secs(1));

        // A step without progress leaves the timer alone
        conn.last_activity = Instant::now() - timeout / 2;
        assert_eq!(conn.connect(), ConnectionState::Authenticating);
        assert!(conn.last_activity.elapsed() >= timeout / 2);

        // A fully stalled handshake eventually times out
        conn.last_activity = Instant::now() - (timeout + Duration::from_secs(1));
        assert_eq!(conn.connect(), ConnectionState::Disconnected);
        assert!(conn.blacked_out());
    }

    #[test]
    fn test_auth_completes_to_connected() {
        let script = script();
        let mut conn = sasl_conn(
            &script,
            vec![
                Ok(AuthStatus::InProgress { made_progress: true }),
                Ok(AuthStatus::Complete),
            ],
        );

        assert_eq!(conn.connect(), ConnectionState::Authenticating);
        assert_eq!(conn.connect(), ConnectionState::Authenticating);
        assert_eq!(conn.connect(), ConnectionState::Connected);
        assert_eq!(conn.failures, 0);
    }

    #[test]
    fn test_auth_error_disconnects() {
        let script = script();
        let mut conn = sasl_conn(
            &script,
            vec![Err(Error::Authentication("bad credentials".into()))],
        );

        assert_eq!(conn.connect(), ConnectionState::Authenticating);
        assert_eq!(conn.connect(), ConnectionState::Disconnected);
        assert!(conn.blacked_out());
        assert_eq!(script.lock().unwrap().shutdowns, 1);
    }

    #[test]
    fn test_sasl_without_credentials_fails() {
        let script = script();
        let config = ConnectionConfig::builder()
            .security_protocol(SecurityProtocol::SaslPlaintext)
            .build();
        let mut conn = mock_conn(&script, config);

        assert_eq!(conn.connect(), ConnectionState::Disconnected);
        assert!(conn.blacked_out());
    }

    #[test]
    fn test_sasl_plain_from_config_credentials() {
        let script = script();
        let config = ConnectionConfig::builder()
            .security_protocol(SecurityProtocol::SaslPlaintext)
            .sasl_plain_credentials("user", "secret")
            .build();
        let mut conn = mock_conn(&script, config);

        // Client token goes out, server replies with an empty token
        assert_eq!(conn.connect(), ConnectionState::Authenticating);
        script.lock().unwrap().recv_data.push_back(Ok(vec![0, 0, 0, 0]));
        assert_eq!(conn.connect(), ConnectionState::Connected);
        assert!(script.lock().unwrap().sent.ends_with(b"\0user\0secret"));
    }

    #[test]
    fn test_fresh_connection_not_blacked_out() {
        let script = script();
        let conn = mock_conn(&script, ConnectionConfig::default());
        assert!(!conn.blacked_out());
        assert_eq!(conn.connection_delay(), Duration::ZERO);
    }

    #[test]
    fn test_blackout_expires() {
        let script = script();
        script
            .lock()
            .unwrap()
            .dial_errors
            .push_back(io::Error::from(io::ErrorKind::ConnectionRefused));
        let mut conn = mock_conn(&script, ConnectionConfig::default());

        conn.connect();
        assert!(conn.blacked_out());
        assert!(conn.connection_delay() > Duration::ZERO);

        conn.last_activity = Instant::now() - conn.current_blackout;
        assert!(!conn.blacked_out());
        assert_eq!(conn.connection_delay(), Duration::ZERO);
    }

    #[test]
    fn test_connection_delay_infinite_while_live() {
        let script = script();
        script
            .lock()
            .unwrap()
            .connect_polls
            .push_back(Ok(ConnectPoll::Pending));
        let mut conn = mock_conn(&script, ConnectionConfig::default());

        conn.connect();
        assert_eq!(conn.connection_delay(), Duration::MAX);

        script
            .lock()
            .unwrap()
            .connect_polls
            .push_back(Ok(ConnectPoll::Connected));
        connect_to_connected(&mut conn);
        assert_eq!(conn.connection_delay(), Duration::MAX);
    }

    #[test]
    fn test_failures_reset_on_connected() {
        let script = script();
        script
            .lock()
            .unwrap()
            .dial_errors
            .push_back(io::Error::from(io::ErrorKind::ConnectionRefused));
        let mut conn = mock_conn(&script, ConnectionConfig::default());

        conn.connect();
        assert_eq!(conn.failures, 1);

        conn.last_activity = Instant::now() - conn.current_blackout;
        connect_to_connected(&mut conn);
        assert_eq!(conn.failures, 0);
        assert!(!conn.blacked_out());
    }

    #[test]
    fn test_send_while_disconnected_fails_future() {
        let script = script();
        let mut conn = mock_conn(&script, ConnectionConfig::default());

        let future = conn.send(Request::new(0, 0, Bytes::new()));
        assert!(future.failed());
        assert!(matches!(
            future.take().unwrap().unwrap_err(),
            Error::Connection(_)
        ));
        assert!(script.lock().unwrap().sent.is_empty());
    }

    #[test]
    fn test_send_while_connecting_fails_future() {
        let script = script();
        script
            .lock()
            .unwrap()
            .connect_polls
            .push_back(Ok(ConnectPoll::Pending));
        let mut conn = mock_conn(&script, ConnectionConfig::default());
        conn.connect();

        let future = conn.send(Request::new(0, 0, Bytes::new()));
        assert!(matches!(
            future.take().unwrap().unwrap_err(),
            Error::NodeNotReady(_)
        ));
        assert!(script.lock().unwrap().sent.is_empty());
    }

    #[test]
    fn test_send_over_in_flight_limit_fails_future() {
        let script = script();
        let config = ConnectionConfig::builder().max_in_flight_requests(1).build();
        let mut conn = mock_conn(&script, config);
        connect_to_connected(&mut conn);

        let first = conn.send(Request::new(0, 0, Bytes::new()));
        assert!(!first.is_done());
        assert!(!conn.can_send_more());

        let second = conn.send(Request::new(0, 0, Bytes::new()));
        assert!(matches!(
            second.take().unwrap().unwrap_err(),
            Error::TooManyInFlightRequests(1)
        ));
        assert_eq!(conn.in_flight_requests(), 1);
    }

    #[test]
    fn test_fire_and_forget_resolves_immediately() {
        let script = script();
        // First write is partial, the rest stays buffered
        {
            let mut s = script.lock().unwrap();
            s.send_results.push_back(Ok(5));
            s.send_results
                .push_back(Err(io::Error::from(io::ErrorKind::WouldBlock)));
        }
        let mut conn = mock_conn(&script, ConnectionConfig::default());
        connect_to_connected(&mut conn);

        let future = conn.send(Request::new(0, 0, Bytes::from_static(b"payload")).no_response());
        assert_eq!(future.take().unwrap().unwrap(), None);
        assert_eq!(conn.in_flight_requests(), 0);
        assert!(!conn.send_buf.is_empty());

        // A later poll drains the remainder
        conn.send_pending();
        assert!(conn.send_buf.is_empty());
        let sent = script.lock().unwrap().sent.clone();
        let frame_len = i32::from_be_bytes([sent[0], sent[1], sent[2], sent[3]]);
        assert_eq!(frame_len as usize, sent.len() - 4);
        assert!(sent.ends_with(b"payload"));
    }

    #[test]
    fn test_send_tracks_in_flight_request() {
        let script = script();
        let mut conn = mock_conn(&script, ConnectionConfig::default());
        connect_to_connected(&mut conn);

        let future = conn.send(Request::new(3, 0, Bytes::from_static(b"md")));
        assert!(!future.is_done());
        assert_eq!(conn.in_flight_requests(), 1);
        assert!(conn.in_flight.contains_key(&1));
    }

    #[test]
    fn test_send_write_error_closes_connection() {
        let script = script();
        script
            .lock()
            .unwrap()
            .send_results
            .push_back(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        let mut conn = mock_conn(&script, ConnectionConfig::default());
        connect_to_connected(&mut conn);

        let future = conn.send(Request::new(0, 0, Bytes::new()));
        assert!(future.failed());
        assert!(conn.disconnected());
        assert_eq!(script.lock().unwrap().shutdowns, 1);
    }

    #[test]
    fn test_recv_peer_close_fails_in_flight() {
        let script = script();
        let mut conn = mock_conn(&script, ConnectionConfig::default());
        connect_to_connected(&mut conn);

        let future = conn.send(Request::new(0, 0, Bytes::new()));
        script.lock().unwrap().recv_data.push_back(Ok(Vec::new()));

        let responses = conn.recv();
        assert!(responses.is_empty());
        assert!(conn.disconnected());
        assert!(matches!(
            future.take().unwrap().unwrap_err(),
            Error::Connection(_)
        ));
    }

    #[test]
    fn test_recv_reassembles_partial_frames() {
        let script = script();
        let mut conn = mock_conn(&script, ConnectionConfig::default());
        connect_to_connected(&mut conn);

        let future = conn.send(Request::new(3, 0, Bytes::new()));
        let frame = response_frame(1, b"metadata");
        script
            .lock()
            .unwrap()
            .recv_data
            .push_back(Ok(frame[..6].to_vec()));

        assert!(conn.recv().is_empty());
        assert!(!future.is_done());
        assert!(conn.connected());

        script
            .lock()
            .unwrap()
            .recv_data
            .push_back(Ok(frame[6..].to_vec()));
        let responses = conn.recv();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].correlation_id, 1);
        assert_eq!(responses[0].body.as_ref(), b"metadata");
        assert_eq!(future.take().unwrap().unwrap().unwrap().body.as_ref(), b"metadata");
        assert_eq!(conn.in_flight_requests(), 0);
    }

    #[test]
    fn test_recv_multiple_responses_in_order() {
        let script = script();
        let mut conn = mock_conn(&script, ConnectionConfig::default());
        connect_to_connected(&mut conn);

        conn.send(Request::new(0, 0, Bytes::new()));
        conn.send(Request::new(0, 0, Bytes::new()));

        let mut data = response_frame(1, b"one");
        data.extend_from_slice(&response_frame(2, b"two"));
        script.lock().unwrap().recv_data.push_back(Ok(data));

        let responses = conn.recv();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].correlation_id, 1);
        assert_eq!(responses[1].correlation_id, 2);
    }

    #[test]
    fn test_recv_unknown_correlation_id_is_fatal() {
        let script = script();
        let mut conn = mock_conn(&script, ConnectionConfig::default());
        connect_to_connected(&mut conn);

        script
            .lock()
            .unwrap()
            .recv_data
            .push_back(Ok(response_frame(99, b"stray")));
        let responses = conn.recv();
        assert!(responses.is_empty());
        assert!(conn.disconnected());
    }

    #[test]
    fn test_recv_malformed_frame_is_fatal() {
        let script = script();
        let mut conn = mock_conn(&script, ConnectionConfig::default());
        connect_to_connected(&mut conn);

        // Negative frame length
        script
            .lock()
            .unwrap()
            .recv_data
            .push_back(Ok(vec![0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]));
        assert!(conn.recv().is_empty());
        assert!(conn.disconnected());
    }

    #[test]
    fn test_requests_timed_out() {
        let script = script();
        let mut conn = mock_conn(&script, ConnectionConfig::default());
        connect_to_connected(&mut conn);

        conn.send(Request::new(0, 0, Bytes::new()));
        assert!(!conn.requests_timed_out());

        let stale = Instant::now() - (conn.config.request_timeout + Duration::from_secs(1));
        conn.in_flight.get_mut(&1).unwrap().sent_at = stale;
        assert!(conn.requests_timed_out());
    }

    #[test]
    fn test_clean_close_fails_in_flight_and_drops_addresses() {
        let script = script();
        let mut conn = mock_conn(&script, ConnectionConfig::default());
        connect_to_connected(&mut conn);
        let future = conn.send(Request::new(0, 0, Bytes::new()));

        conn.close(None);
        assert!(conn.disconnected());
        assert!(future.failed());
        assert!(conn.addrs.is_empty());
        assert_eq!(conn.failures, 0);
        assert!(!conn.blacked_out());
    }

    #[test]
    fn test_lookup_happens_once_per_attempt() {
        let script = script();
        {
            let mut s = script.lock().unwrap();
            s.connect_polls.push_back(Ok(ConnectPoll::Pending));
            s.connect_polls.push_back(Ok(ConnectPoll::Pending));
        }
        let resolver = TestResolver::default();
        let calls = resolver.calls.clone();
        let mut conn = mock_conn(&script, ConnectionConfig::default()).with_resolver(resolver);

        connect_to_connected(&mut conn);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_relookup_after_empty_resolution() {
        let script = script();
        let resolver = TestResolver::default();
        resolver.scripted.lock().unwrap().push_back(Vec::new());
        let calls = resolver.calls.clone();
        let mut conn = mock_conn(&script, ConnectionConfig::default()).with_resolver(resolver);

        // Empty lookup counts as a failure and starts a blackout
        assert_eq!(conn.connect(), ConnectionState::Disconnected);
        assert_eq!(conn.failures, 1);
        assert!(conn.blacked_out());
        assert_eq!(script.lock().unwrap().dials, 0);

        conn.last_activity = Instant::now() - conn.current_blackout;
        connect_to_connected(&mut conn);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_correlation_ids_increment_per_request() {
        let script = script();
        let mut conn = mock_conn(&script, ConnectionConfig::default());
        connect_to_connected(&mut conn);

        conn.send(Request::new(0, 0, Bytes::new()));
        conn.send(Request::new(0, 0, Bytes::new()));
        conn.send(Request::new(0, 0, Bytes::new()));
        let ids: Vec<i32> = conn.in_flight.keys().copied().collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_correlation_id_wraps_at_i32_max() {
        let script = script();
        let mut conn = mock_conn(&script, ConnectionConfig::default());
        conn.correlation_id = i32::MAX - 1;
        assert_eq!(conn.next_correlation_id(), i32::MAX);
        assert_eq!(conn.next_correlation_id(), 0);
        assert_eq!(conn.next_correlation_id(), 1);
    }

    #[test]
    fn test_recv_while_not_connected_is_empty() {
        let script = script();
        let mut conn = mock_conn(&script, ConnectionConfig::default());
        assert!(conn.recv().is_empty());
    }

    #[test]
    fn test_config_builder() {
        let config = ConnectionConfig::builder()
            .client_id("test-client")
            .connection_timeout(Duration::from_secs(3))
            .request_timeout(Duration::from_secs(7))
            .reconnect_backoff(Duration::from_millis(10), Duration::from_millis(200))
            .max_in_flight_requests(2)
            .build();
        assert_eq!(config.client_id, "test-client");
        assert_eq!(config.connection_timeout, Duration::from_secs(3));
        assert_eq!(config.request_timeout, Duration::from_secs(7));
        assert_eq!(config.reconnect_backoff, Duration::from_millis(10));
        assert_eq!(config.reconnect_backoff_max, Duration::from_millis(200));
        assert_eq!(config.max_in_flight_requests_per_connection, 2);
    }
}
