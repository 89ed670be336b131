use crate::{Context, Error, SessionRef};

/// An engine event delivered to the application's [`EventSink`].
///
/// Every variant carries the owning session's reference and user tag, plus
/// only the payload relevant to that event kind. Events for a session are
/// delivered after the session's state and buffers have already been updated,
/// so the sink may immediately issue follow-up calls (`read`, `accept`,
/// `write`, `destroy_session`) against the context it is handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// The asynchronous part of `create_session` finished. `Ok(())` means the
  /// session is connected (stream) or listening (stream server) and now in
  /// the idle state; an error means the session is defunct and should be
  /// destroyed.
  CreateResult {
    session: SessionRef,
    tag: u64,
    result: Result<(), Error>,
  },
  /// An in-flight write completed. On success the session is idle again and
  /// accepts the next write; on failure it is defunct.
  SendResult {
    session: SessionRef,
    tag: u64,
    result: Result<(), Error>,
  },
  /// A connection is pending on a listener. Call
  /// [`Context::accept`](crate::Context::accept) to take it.
  Incoming { listener: SessionRef, tag: u64 },
  /// Received bytes were queued on the session. Drain them with
  /// [`Context::read`](crate::Context::read).
  Data { session: SessionRef, tag: u64 },
  /// The session terminated: `None` for an orderly close by the peer,
  /// `Some(Error::Backend(..))` for a transport failure. The session is
  /// defunct; the only legal follow-up is `destroy_session`.
  Terminate {
    session: SessionRef,
    tag: u64,
    error: Option<Error>,
  },
}

impl Event {
  /// The reference of the session this event belongs to.
  pub fn session(&self) -> SessionRef {
    match self {
      Self::CreateResult { session, .. }
      | Self::SendResult { session, .. }
      | Self::Data { session, .. }
      | Self::Terminate { session, .. } => *session,
      Self::Incoming { listener, .. } => *listener,
    }
  }

  /// The user tag stamped on the owning session at creation.
  pub fn tag(&self) -> u64 {
    match self {
      Self::CreateResult { tag, .. }
      | Self::SendResult { tag, .. }
      | Self::Incoming { tag, .. }
      | Self::Data { tag, .. }
      | Self::Terminate { tag, .. } => *tag,
    }
  }
}

/// Receiver for engine events.
///
/// The sink is owned by the [`Context`] and invoked only from inside
/// [`Context::step`]. It is handed a mutable borrow of the context so it can
/// react to the event in place. Calling `step` from inside the sink is a
/// contract violation and panics.
pub trait EventSink: Sized {
  fn on_event(&mut self, ctx: &mut Context<Self>, event: Event);
}
