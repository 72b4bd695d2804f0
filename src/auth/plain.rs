//! SASL PLAIN token exchange
//!
//! The PLAIN handshake is one token from client to broker and one (normally
//! empty) token back, each wrapped in the same 4-byte length-prefixed framing
//! as application traffic. The client token is
//! `authzid NUL authcid NUL passwd` per RFC 4616 with an empty authorization
//! identity.

use super::{AuthStatus, Authenticator};
use crate::connection::Transport;
use crate::protocol::try_decode_frame;
use crate::{Error, Result};
use bytes::{BufMut, BytesMut};
use std::io;
use tracing::{debug, trace};

enum Phase {
    SendingToken,
    AwaitingToken,
}

/// SASL PLAIN authenticator.
///
/// Resumable: a partially written client token and partially read server
/// token survive across steps.
pub struct PlainAuthenticator {
    phase: Phase,
    outbound: BytesMut,
    inbound: BytesMut,
}

impl PlainAuthenticator {
    /// Build the handshake for the given credentials
    pub fn new(username: &str, password: &str) -> Self {
        let token_len = username.len() + password.len() + 2;
        let mut outbound = BytesMut::with_capacity(4 + token_len);
        outbound.put_i32(token_len as i32);
        outbound.put_u8(0); // empty authorization identity
        outbound.put_slice(username.as_bytes());
        outbound.put_u8(0);
        outbound.put_slice(password.as_bytes());

        Self {
            phase: Phase::SendingToken,
            outbound,
            inbound: BytesMut::with_capacity(64),
        }
    }
}

impl Authenticator for PlainAuthenticator {
    fn mechanism(&self) -> &'static str {
        "PLAIN"
    }

    fn step(&mut self, transport: &mut dyn Transport) -> Result<AuthStatus> {
        let mut made_progress = false;

        if matches!(self.phase, Phase::SendingToken) {
            while !self.outbound.is_empty() {
                match transport.send(&self.outbound) {
                    Ok(0) => break,
                    Ok(n) => {
                        trace!(bytes = n, "sent partial client token");
                        let _ = self.outbound.split_to(n);
                        made_progress = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        return Err(Error::Authentication(format!(
                            "i/o error sending PLAIN token: {e}"
                        )))
                    }
                }
            }
            if !self.outbound.is_empty() {
                return Ok(AuthStatus::InProgress { made_progress });
            }
            self.phase = Phase::AwaitingToken;
        }

        let mut chunk = [0u8; 512];
        loop {
            match transport.recv(&mut chunk) {
                Ok(0) => {
                    return Err(Error::Authentication(
                        "peer closed during PLAIN handshake".into(),
                    ))
                }
                Ok(n) => {
                    self.inbound.extend_from_slice(&chunk[..n]);
                    made_progress = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::Authentication(format!(
                        "i/o error reading PLAIN token: {e}"
                    )))
                }
            }

            if let Some(token) = try_decode_frame(&mut self.inbound)? {
                debug!(token_len = token.len(), "PLAIN handshake complete");
                return Ok(AuthStatus::Complete);
            }
        }

        Ok(AuthStatus::InProgress { made_progress })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectPoll;
    use std::collections::VecDeque;

    /// Scripted transport: send results and recv payloads are consumed in
    /// order; exhausted queues behave as a socket that would block.
    #[derive(Default)]
    struct ScriptedTransport {
        send_results: VecDeque<io::Result<usize>>,
        recv_payloads: VecDeque<io::Result<Vec<u8>>>,
        sent: Vec<u8>,
    }

    impl Transport for ScriptedTransport {
        fn poll_connect(&mut self) -> io::Result<ConnectPoll> {
            Ok(ConnectPoll::Connected)
        }

        fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.send_results.pop_front() {
                Some(Ok(n)) => {
                    let n = n.min(buf.len());
                    self.sent.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.recv_payloads.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }

        fn shutdown(&mut self) {}
    }

    fn empty_server_token() -> Vec<u8> {
        vec![0, 0, 0, 0]
    }

    #[test]
    fn test_token_layout() {
        let auth = PlainAuthenticator::new("user", "secret");
        // 4-byte length prefix, then NUL user NUL secret
        assert_eq!(auth.outbound[..4], [0, 0, 0, 11]);
        assert_eq!(&auth.outbound[4..], b"\0user\0secret");
    }

    #[test]
    fn test_handshake_completes_in_one_step() {
        let mut transport = ScriptedTransport::default();
        transport.send_results.push_back(Ok(usize::MAX));
        transport.recv_payloads.push_back(Ok(empty_server_token()));

        let mut auth = PlainAuthenticator::new("user", "secret");
        let status = auth.step(&mut transport).unwrap();
        assert_eq!(status, AuthStatus::Complete);
        assert_eq!(&transport.sent[4..], b"\0user\0secret");
    }

    #[test]
    fn test_partial_writes_resume_across_steps() {
        let mut transport = ScriptedTransport::default();
        transport.send_results.push_back(Ok(3));

        let mut auth = PlainAuthenticator::new("user", "secret");
        let status = auth.step(&mut transport).unwrap();
        assert_eq!(status, AuthStatus::InProgress { made_progress: true });

        // Nothing moves on a stalled socket
        let status = auth.step(&mut transport).unwrap();
        assert_eq!(status, AuthStatus::InProgress { made_progress: false });

        // Remainder drains, then the server token arrives split in two
        transport.send_results.push_back(Ok(usize::MAX));
        transport.recv_payloads.push_back(Ok(vec![0, 0]));
        let status = auth.step(&mut transport).unwrap();
        assert_eq!(status, AuthStatus::InProgress { made_progress: true });

        transport.recv_payloads.push_back(Ok(vec![0, 0]));
        let status = auth.step(&mut transport).unwrap();
        assert_eq!(status, AuthStatus::Complete);
        assert_eq!(&transport.sent[4..], b"\0user\0secret");
    }

    #[test]
    fn test_peer_close_fails_handshake() {
        let mut transport = ScriptedTransport::default();
        transport.send_results.push_back(Ok(usize::MAX));
        transport.recv_payloads.push_back(Ok(Vec::new()));

        let mut auth = PlainAuthenticator::new("user", "secret");
        let err = auth.step(&mut transport).unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn test_send_error_fails_handshake() {
        let mut transport = ScriptedTransport::default();
        transport
            .send_results
            .push_back(Err(io::Error::from(io::ErrorKind::BrokenPipe)));

        let mut auth = PlainAuthenticator::new("user", "secret");
        assert!(auth.step(&mut transport).is_err());
    }
}
