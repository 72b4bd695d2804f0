//! Non-blocking socket transport
//!
//! The connection drives all I/O through the [`Transport`] trait so tests can
//! substitute scripted transports and embedders can wrap the stream in TLS.
//! The default implementation is a `mio` TCP stream: `mio` issues the
//! non-blocking connect and the connection polls it to completion.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use mio::net::TcpStream;
use tracing::trace;

/// Outcome of polling an in-progress connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPoll {
    /// The socket is connected and writable
    Connected,
    /// The handshake has not completed yet; poll again later
    Pending,
}

/// A non-blocking byte transport to a single broker.
///
/// `send` and `recv` surface `WouldBlock` instead of blocking; `recv`
/// returning `Ok(0)` means the peer closed the connection.
pub trait Transport: Send {
    /// Poll an in-progress connect for completion
    fn poll_connect(&mut self) -> io::Result<ConnectPoll>;

    /// Write as many bytes as the socket accepts
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Read available bytes into `buf`
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Best-effort shutdown of both directions
    fn shutdown(&mut self);
}

/// Opens a [`Transport`] to a resolved socket address.
///
/// The default dialer opens plain TCP; a TLS integration supplies its own
/// dialer wrapping the stream.
pub trait Dialer: Send {
    /// Start a non-blocking connect to `addr`
    fn dial(&self, addr: SocketAddr) -> io::Result<Box<dyn Transport>>;
}

/// Plain TCP transport over a `mio` non-blocking stream
pub struct TcpTransport {
    stream: TcpStream,
    connected: bool,
}

impl TcpTransport {
    /// Begin a non-blocking connect to `addr`
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self {
            stream,
            connected: false,
        })
    }
}

impl Transport for TcpTransport {
    fn poll_connect(&mut self) -> io::Result<ConnectPoll> {
        if self.connected {
            return Ok(ConnectPoll::Connected);
        }

        // A failed connect is reported through SO_ERROR
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }

        match self.stream.peer_addr() {
            Ok(peer) => {
                trace!(%peer, "tcp connect completed");
                self.connected = true;
                Ok(ConnectPoll::Connected)
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.raw_os_error() == Some(libc::EINPROGRESS) =>
            {
                Ok(ConnectPoll::Pending)
            }
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Default dialer producing [`TcpTransport`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, addr: SocketAddr) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(TcpTransport::connect(addr)?))
    }
}
