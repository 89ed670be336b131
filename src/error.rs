use std::{fmt, io};

/// Error kinds reported by the session engine.
///
/// Synchronous API calls return these directly; failures that happen after a
/// session is already committed to an asynchronous operation are delivered
/// through the [`EventSink`](crate::EventSink) instead, attached to the event
/// for the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
  /// The caller passed an argument the engine cannot act on: a literal
  /// address with the wrong length, an out-of-range port, an operation that
  /// does not apply to the session's kind, or a stale session reference.
  /// No state was changed.
  InvalidArgument,
  /// The requested session or name kind is recognized but not implemented.
  Unimplemented,
  /// A conflicting operation is already in flight on this session. Wait for
  /// its completion event before retrying.
  Busy,
  /// The session pool is at capacity. Destroy a session or raise
  /// [`Config::max_sessions`](crate::Config) and retry.
  MaxSession,
  /// The transport or reactor backend failed. Carries the raw OS status
  /// code, or `-1` when the backend reported no code.
  Backend(i32),
  /// Name resolution failed. Carries the resolver status code, or `-1` when
  /// none was reported.
  NameLookup(i32),
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::InvalidArgument => f.write_str("invalid argument"),
      Self::Unimplemented => f.write_str("unimplemented"),
      Self::Busy => f.write_str("operation already in flight"),
      Self::MaxSession => f.write_str("session pool exhausted"),
      Self::Backend(code) => write!(f, "backend error (os code {code})"),
      Self::NameLookup(code) => write!(f, "name lookup failed (code {code})"),
    }
  }
}

impl std::error::Error for Error {}

/// Raw status code for an [`io::Error`], `-1` when the OS reported none.
pub(crate) fn os_code(err: &io::Error) -> i32 {
  err.raw_os_error().unwrap_or(-1)
}
