use std::net::SocketAddr;

use mio::{
  Interest,
  net::{TcpListener, TcpStream},
};

use crate::{recvq::RecvQueue, write_task::WriteTask};

/// What a session is: an outgoing stream, a listening stream endpoint, or a
/// datagram endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
  Stream,
  StreamServer,
  Datagram,
}

/// Lifecycle state of a live session.
///
/// The free state is not represented here: a free slot holds no session at
/// all (the arena's vacancy *is* the free state). Transitions are driven
/// exclusively from inside [`Context::step`](crate::Context::step) and from
/// synchronous API calls made outside a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  /// Ready to accept a read or write request.
  Idle,
  /// An asynchronous name lookup is outstanding.
  Resolving,
  /// A connect (or listen setup) request is outstanding.
  Connecting,
  /// A write is in flight; a second write returns `Busy`.
  Active,
  /// Terminal failure state. Backend resources are released; the only legal
  /// further operation is `destroy_session`.
  Defunct,
}

/// Backend transport handle, tagged by kind. A session is never
/// simultaneously a listener and a stream.
#[derive(Debug)]
pub(crate) enum Handle {
  Stream(TcpStream),
  Listener(TcpListener),
}

#[derive(Debug)]
pub(crate) struct Session {
  pub kind: SessionKind,
  pub state: SessionState,
  pub recvq: RecvQueue,
  /// Whether the reactor read is currently armed. Cleared when the receive
  /// queue saturates; set again by the draining read.
  pub read_armed: bool,
  /// Interest the handle is currently registered with, `None` when the
  /// handle is not registered at all.
  pub registered: Option<Interest>,
  pub handle: Option<Handle>,
  pub write_task: Option<WriteTask>,
  /// A connection accepted ahead of the application, kept so coalesced
  /// arrivals survive the edge-triggered reactor. Listeners only, at most
  /// one.
  pub pending_accept: Option<(TcpStream, SocketAddr)>,
  pub remote_port: u16,
  pub local_port: u16,
  pub tag: u64,
}

impl Session {
  pub fn new(
    kind: SessionKind,
    remote_port: u16,
    local_port: u16,
    tag: u64,
  ) -> Self {
    Self {
      kind,
      state: SessionState::Idle,
      recvq: RecvQueue::new(),
      read_armed: false,
      registered: None,
      handle: None,
      write_task: None,
      pending_accept: None,
      remote_port,
      local_port,
      tag,
    }
  }

  /// The reactor interest this session currently needs, `None` when the
  /// handle should not be registered.
  pub fn desired_interest(&self) -> Option<Interest> {
    if matches!(self.state, SessionState::Defunct | SessionState::Resolving) {
      return None;
    }
    match self.kind {
      SessionKind::StreamServer => Some(Interest::READABLE),
      SessionKind::Stream => {
        if self.state == SessionState::Connecting {
          return Some(Interest::WRITABLE);
        }
        let mut interest = None;
        if self.read_armed {
          interest = Some(Interest::READABLE);
        }
        if self.write_task.is_some() {
          interest = Some(match interest {
            Some(i) => i | Interest::WRITABLE,
            None => Interest::WRITABLE,
          });
        }
        interest
      }
      SessionKind::Datagram => None,
    }
  }

  /// Drop every resource attached to the slot ahead of the terminal event:
  /// a defunct session holds no buffers, no task, and no backend handle.
  /// The handle is returned so the caller can deregister it first.
  pub fn strip(&mut self) -> Option<Handle> {
    self.state = SessionState::Defunct;
    self.recvq.clear();
    self.write_task = None;
    self.pending_accept = None;
    self.read_armed = false;
    self.handle.take()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn connecting_stream_wants_writable_only() {
    let mut s = Session::new(SessionKind::Stream, 80, 0, 0);
    s.state = SessionState::Connecting;
    s.read_armed = true;
    assert_eq!(s.desired_interest(), Some(Interest::WRITABLE));
  }

  #[test]
  fn idle_interest_tracks_read_arming_and_write_task() {
    let mut s = Session::new(SessionKind::Stream, 80, 0, 0);
    assert_eq!(s.desired_interest(), None);
    s.read_armed = true;
    assert_eq!(s.desired_interest(), Some(Interest::READABLE));
    s.write_task = Some(crate::write_task::WriteTask::new(b"x"));
    assert_eq!(
      s.desired_interest(),
      Some(Interest::READABLE | Interest::WRITABLE)
    );
    s.read_armed = false;
    assert_eq!(s.desired_interest(), Some(Interest::WRITABLE));
  }

  #[test]
  fn defunct_wants_nothing() {
    let mut s = Session::new(SessionKind::StreamServer, 0, 0, 0);
    assert_eq!(s.desired_interest(), Some(Interest::READABLE));
    s.strip();
    assert_eq!(s.desired_interest(), None);
    assert!(s.handle.is_none());
  }
}
