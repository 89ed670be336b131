//! Name resolution collaborator.
//!
//! The engine consumes resolution through the narrow [`Resolver`] trait: a
//! blocking lookup of `(host, port)` into candidate socket addresses. The
//! context runs each lookup on a short-lived worker thread and receives the
//! reply over a channel, waking the reactor so a blocked `step` picks it up.
//! The worker never touches engine state.

use std::net::{SocketAddr, ToSocketAddrs};

use crate::SessionRef;

/// How the `name` bytes of `create_session` are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameType {
  /// Literal IPv4 address, exactly 4 bytes.
  Ipv4,
  /// Literal IPv6 address, exactly 16 bytes.
  Ipv6,
  /// UTF-8 host name of arbitrary length, resolved asynchronously.
  Dns,
}

/// Blocking name lookup, executed off the engine thread.
///
/// Errors are raw resolver status codes (`-1` when the platform reported
/// none); they surface to the application as
/// [`Error::NameLookup`](crate::Error::NameLookup).
pub trait Resolver: Send + Sync {
  fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, i32>;
}

/// Default resolver backed by the platform's `getaddrinfo` via
/// [`ToSocketAddrs`].
#[derive(Debug, Default)]
pub struct StdResolver;

impl Resolver for StdResolver {
  fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, i32> {
    match (host, port).to_socket_addrs() {
      Ok(addrs) => Ok(addrs.collect()),
      Err(err) => Err(crate::error::os_code(&err)),
    }
  }
}

/// Completed lookup, delivered to the context over its reply channel.
pub(crate) struct ResolveReply {
  pub session: SessionRef,
  pub result: Result<Vec<SocketAddr>, i32>,
}

/// Address-family policy for multi-candidate results: the first IPv4
/// candidate wins, falling back to the first IPv6 candidate. Deterministic
/// by choice rather than an artifact of resolver ordering.
pub(crate) fn pick_addr(addrs: &[SocketAddr]) -> Option<SocketAddr> {
  addrs
    .iter()
    .find(|a| a.is_ipv4())
    .or_else(|| addrs.iter().find(|a| a.is_ipv6()))
    .copied()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::{Ipv4Addr, Ipv6Addr};

  #[test]
  fn prefers_ipv4_over_ipv6() {
    let v6 = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 80);
    let v4 = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 80);
    assert_eq!(pick_addr(&[v6, v4]), Some(v4));
    assert_eq!(pick_addr(&[v6]), Some(v6));
    assert_eq!(pick_addr(&[]), None);
  }

  #[test]
  fn std_resolver_handles_literal_hosts() {
    let addrs = StdResolver.lookup("127.0.0.1", 1234).unwrap();
    assert!(addrs.contains(&SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 1234)));
  }
}
