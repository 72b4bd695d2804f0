//! Broker host specification parsing and DNS lookup
//!
//! Supports formats:
//! * `"host"` — default port
//! * `"host:port"`
//! * `"[2001:db8::1]:9092"` — bracketed IPv6 literal with port
//! * comma-separated lists of the above: `"broker1:9092, broker2"`

use crate::{Error, Result};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

/// Default broker port
pub const DEFAULT_PORT: u16 = 9092;

/// Socket address family selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// Either IPv4 or IPv6
    Unspecified,
    /// IPv4 only
    V4,
    /// IPv6 only
    V6,
}

impl AddressFamily {
    /// Whether a resolved address belongs to this family
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Unspecified => true,
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::Unspecified => write!(f, "unspec"),
            AddressFamily::V4 => write!(f, "inet"),
            AddressFamily::V6 => write!(f, "inet6"),
        }
    }
}

/// A (host, port, family) triple parsed from a host specification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerAddr {
    /// Hostname or IP literal, without brackets
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Address family implied by the literal syntax
    pub family: AddressFamily,
}

/// Parse a single `host[:port]` entry.
///
/// A bracketed host is IPv6; without a trailing `:port` it uses the default
/// port. An unbracketed entry containing more than one colon is ambiguous
/// between `host:port` and an IPv6 literal, so the whole string is taken as a
/// literal address on the default port.
pub fn parse_host_port(entry: &str, default_port: u16) -> Result<BrokerAddr> {
    let entry = entry.trim();
    if entry.is_empty() {
        return Err(Error::Config("empty host entry".into()));
    }

    if let Some(rest) = entry.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| Error::Config(format!("unterminated bracket in {entry:?}")))?;
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        let port = match tail.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| Error::Config(format!("invalid port in {entry:?}")))?,
            None if tail.is_empty() => default_port,
            None => {
                return Err(Error::Config(format!(
                    "unexpected trailing characters in {entry:?}"
                )))
            }
        };
        return Ok(BrokerAddr {
            host: host.to_string(),
            port,
            family: AddressFamily::V6,
        });
    }

    if entry.matches(':').count() >= 2 {
        return Ok(BrokerAddr {
            host: entry.to_string(),
            port: default_port,
            family: AddressFamily::V6,
        });
    }

    let (host, port) = match entry.split_once(':') {
        Some((host, port)) => (
            host,
            port.parse()
                .map_err(|_| Error::Config(format!("invalid port in {entry:?}")))?,
        ),
        None => (entry, default_port),
    };
    Ok(BrokerAddr {
        host: host.to_string(),
        port,
        family: classify_literal(host),
    })
}

/// Address family implied by the literal syntax of a host string
fn classify_literal(host: &str) -> AddressFamily {
    if host.parse::<Ipv4Addr>().is_ok() {
        AddressFamily::V4
    } else if host.parse::<Ipv6Addr>().is_ok() {
        AddressFamily::V6
    } else {
        AddressFamily::Unspecified
    }
}

/// Parse a comma-separated host specification into distinct broker addresses.
///
/// Entries are trimmed and deduplicated preserving first-seen order. With
/// `randomize`, the result is shuffled so a herd of clients does not hammer
/// the same bootstrap broker first. This function is pure apart from the
/// shuffle: no DNS lookups happen here.
pub fn collect_hosts(hosts: &str, default_port: u16, randomize: bool) -> Result<Vec<BrokerAddr>> {
    let entries: Vec<&str> = hosts.split(',').collect();
    collect_hosts_list(&entries, default_port, randomize)
}

/// Parse a pre-split list of `host[:port]` entries
pub fn collect_hosts_list<S: AsRef<str>>(
    hosts: &[S],
    default_port: u16,
    randomize: bool,
) -> Result<Vec<BrokerAddr>> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(hosts.len());
    for entry in hosts {
        let addr = parse_host_port(entry.as_ref(), default_port)?;
        if seen.insert(addr.clone()) {
            out.push(addr);
        }
    }
    if randomize {
        out.shuffle(&mut rand::thread_rng());
    }
    Ok(out)
}

/// DNS lookup seam.
///
/// Implementations resolve one (host, port, family) triple into zero or more
/// concrete socket addresses. An empty result is not an error: the connection
/// treats it as "this candidate is exhausted for now" and records a failure.
pub trait Resolve: Send {
    /// Resolve a hostname into socket addresses of the requested family
    fn resolve(
        &self,
        host: &str,
        port: u16,
        family: AddressFamily,
    ) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the platform's `getaddrinfo`.
///
/// Note: the underlying lookup blocks; connections call it at most once per
/// address-list exhaustion, not on every poll.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(
        &self,
        host: &str,
        port: u16,
        family: AddressFamily,
    ) -> io::Result<Vec<SocketAddr>> {
        let addrs = (host, port).to_socket_addrs()?;
        Ok(addrs.filter(|addr| family.matches(addr)).collect())
    }
}
