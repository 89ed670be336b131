//! The context: session pool + reactor + event sink, driven one
//! non-reentrant step at a time.

use std::{
  collections::VecDeque,
  io::{self, Read, Write},
  net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
  sync::Arc,
  thread,
  time::Duration,
};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, trace, warn};
use mio::{
  Events, Interest, Poll, Token, Waker,
  net::{TcpListener, TcpStream},
};

use crate::{
  Error, Event, EventSink, NameType, SessionKind, SessionRef, SessionState,
  error::os_code,
  pool::Pool,
  recvq::merge_chunks,
  resolve::{ResolveReply, Resolver, StdResolver, pick_addr},
  session::{Handle, Session},
  write_task::WriteTask,
};

/// Token reserved for the reactor waker; session tokens are slot indices.
const WAKER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;
const READ_CHUNK: usize = 16 * 1024;
/// Per-pass ceiling on bytes pulled off one stream, so a fast peer cannot
/// starve the other sessions in a step. Leftovers are picked up by a
/// deferred continuation on the next step.
const READ_PASS_LIMIT: usize = 256 * 1024;
/// Writes that could not fit in the platform's addressable buffer size are
/// rejected up front.
const MAX_WRITE_LEN: usize = isize::MAX as usize;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
  /// Hard ceiling on concurrently live sessions. The pool never grows past
  /// it; allocation beyond it fails with [`Error::MaxSession`].
  pub max_sessions: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self { max_sessions: 65536 }
  }
}

/// Work queued for the prepare phase of the next step: results that must
/// travel through the sink but have no readiness event of their own.
enum Deferred {
  /// Listen setup completed; deliver the create result.
  CreateOk(SessionRef),
  /// A stashed pre-accepted connection is waiting on this listener.
  Incoming(SessionRef),
  /// A read pass hit its byte ceiling with data left in the socket.
  ReadReady(SessionRef),
}

enum ConnectOutcome {
  Pending,
  Connected(u16),
  Failed(i32),
}

enum FlushOutcome {
  Pending,
  Done,
  Failed(i32),
}

/// Owner of the session pool, the reactor, and the application's event sink.
///
/// A context multiplexes many concurrent sessions over one non-blocking
/// reactor. It is strictly single-threaded and cooperative: nothing happens
/// until [`step`](Self::step) is called, and all session state mutation
/// happens either inside the active step or inside synchronous API calls
/// made outside one. A context is not a process-wide global; an application
/// may own several, one per thread.
pub struct Context<S: EventSink> {
  pool: Pool,
  poll: Poll,
  events: Events,
  waker: Arc<Waker>,
  resolver: Arc<dyn Resolver>,
  resolve_tx: Sender<ResolveReply>,
  resolve_rx: Receiver<ResolveReply>,
  deferred: VecDeque<Deferred>,
  in_step: bool,
  tearing_down: bool,
  emitted: u64,
  sink: Option<S>,
}

impl<S: EventSink> Context<S> {
  /// Create a context with the default configuration and resolver.
  pub fn new(sink: S) -> io::Result<Self> {
    Self::with_config(Config::default(), sink)
  }

  pub fn with_config(config: Config, sink: S) -> io::Result<Self> {
    Self::with_resolver(config, Arc::new(StdResolver), sink)
  }

  /// Create a context with a custom name-resolution backend.
  pub fn with_resolver(
    config: Config,
    resolver: Arc<dyn Resolver>,
    sink: S,
  ) -> io::Result<Self> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    let (resolve_tx, resolve_rx) = crossbeam_channel::unbounded();
    debug!("context created, session capacity {}", config.max_sessions);
    Ok(Self {
      pool: Pool::with_capacity(config.max_sessions.min(u32::MAX as usize)),
      poll,
      events: Events::with_capacity(EVENTS_CAPACITY),
      waker,
      resolver,
      resolve_tx,
      resolve_rx,
      deferred: VecDeque::new(),
      in_step: false,
      tearing_down: false,
      emitted: 0,
      sink: Some(sink),
    })
  }

  /// Drive one bounded pass of reactor event processing.
  ///
  /// With `wait` set the call blocks until at least one event is ready;
  /// without it the call returns immediately when nothing is. Events are
  /// delivered to the sink from inside this call, after the owning
  /// session's state and buffers have been updated.
  ///
  /// # Panics
  ///
  /// Panics when called from inside a sink callback: the step is not
  /// reentrant, and a recursive step request is a contract violation, not
  /// a recoverable error.
  pub fn step(&mut self, wait: bool) -> io::Result<()> {
    assert!(!self.in_step, "Context::step is not reentrant");
    if self.tearing_down {
      return Ok(());
    }
    self.in_step = true;
    let result = self.step_inner(wait);
    self.in_step = false;
    result
  }

  fn step_inner(&mut self, wait: bool) -> io::Result<()> {
    let mut delivered = false;
    delivered |= self.run_deferred();
    delivered |= self.drain_resolver();

    // Blocking is only allowed when the prepare phase produced nothing;
    // otherwise the application already has events to react to.
    let timeout =
      if wait && !delivered { None } else { Some(Duration::ZERO) };

    let mut events =
      std::mem::replace(&mut self.events, Events::with_capacity(0));
    let poll_result = self.poll.poll(&mut events, timeout);
    for event in events.iter() {
      let readable = event.is_readable() || event.is_read_closed();
      let writable =
        event.is_writable() || event.is_write_closed() || event.is_error();
      self.dispatch(event.token(), readable, writable);
    }
    self.events = events;

    match poll_result {
      Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(()),
      other => other,
    }
  }

  /// Create a session.
  ///
  /// `name` is interpreted per `name_type`: a 4-byte literal IPv4 address,
  /// a 16-byte literal IPv6 address, or a UTF-8 host name. Literal
  /// addresses proceed straight to connect/listen; host names go through
  /// asynchronous resolution first. `port` is the remote port (listen port
  /// for stream servers); both ports must be `<= 65535`.
  ///
  /// Validation and capacity failures are returned synchronously and leave
  /// no session behind. Once a session is committed, every later result,
  /// including failure, arrives through the sink.
  pub fn create_session(
    &mut self,
    kind: SessionKind,
    name_type: NameType,
    name: &[u8],
    port: u32,
    local_port: u32,
    tag: u64,
  ) -> Result<SessionRef, Error> {
    match kind {
      SessionKind::Stream | SessionKind::StreamServer => {}
      SessionKind::Datagram => return Err(Error::Unimplemented),
    }
    if port > u16::MAX as u32 || local_port > u16::MAX as u32 {
      return Err(Error::InvalidArgument);
    }
    enum Target {
      Literal(IpAddr),
      Host(String),
    }
    let target = match name_type {
      NameType::Ipv4 => {
        let octets: [u8; 4] =
          name.try_into().map_err(|_| Error::InvalidArgument)?;
        Target::Literal(IpAddr::V4(Ipv4Addr::from(octets)))
      }
      NameType::Ipv6 => {
        let octets: [u8; 16] =
          name.try_into().map_err(|_| Error::InvalidArgument)?;
        Target::Literal(IpAddr::V6(Ipv6Addr::from(octets)))
      }
      NameType::Dns => {
        let host =
          std::str::from_utf8(name).map_err(|_| Error::InvalidArgument)?;
        Target::Host(host.to_owned())
      }
    };

    let session =
      Session::new(kind, port as u16, local_port as u16, tag);
    let sref = self.pool.allocate(session)?;
    let started = match target {
      Target::Literal(ip) => {
        self.start_transport(sref, SocketAddr::new(ip, port as u16))
      }
      Target::Host(host) => self.start_lookup(sref, host, port as u16),
    };
    match started {
      Ok(()) => {
        trace!("session {sref:?} created ({kind:?})");
        Ok(sref)
      }
      Err(err) => {
        // The session never started; undo the allocation.
        self.pool.release(sref);
        Err(err)
      }
    }
  }

  /// Release a session and every resource attached to it. The slot is
  /// recycled and `sref` (and any copy of it) goes stale immediately.
  pub fn destroy_session(&mut self, sref: SessionRef) -> Result<(), Error> {
    let Some(mut session) = self.pool.release(sref) else {
      return Err(Error::InvalidArgument);
    };
    if session.registered.take().is_some() {
      if let Some(handle) = session.handle.as_mut() {
        let result = match handle {
          Handle::Stream(stream) => self.poll.registry().deregister(stream),
          Handle::Listener(listener) => {
            self.poll.registry().deregister(listener)
          }
        };
        if let Err(err) = result {
          trace!("deregister on destroy failed: {err}");
        }
      }
    }
    debug!("session {sref:?} destroyed");
    Ok(())
  }

  /// Take one pending connection off a listener.
  ///
  /// The new session enters the idle state with reading armed. Fails with
  /// [`Error::MaxSession`] when the pool is exhausted; the connection then
  /// stays pending and the call may be retried after a session is
  /// destroyed.
  pub fn accept(
    &mut self,
    listener: SessionRef,
    tag: u64,
  ) -> Result<SessionRef, Error> {
    {
      let l = self.pool.get(listener).ok_or(Error::InvalidArgument)?;
      if l.kind != SessionKind::StreamServer
        || l.state == SessionState::Defunct
      {
        return Err(Error::InvalidArgument);
      }
    }
    if self.pool.is_full() {
      return Err(Error::MaxSession);
    }
    let (stream, peer) = {
      let Some(l) = self.pool.get_mut(listener) else {
        return Err(Error::InvalidArgument);
      };
      match l.pending_accept.take() {
        Some(conn) => conn,
        None => {
          let Some(Handle::Listener(sock)) = l.handle.as_ref() else {
            return Err(Error::InvalidArgument);
          };
          sock.accept().map_err(|err| Error::Backend(os_code(&err)))?
        }
      }
    };

    let local = stream.local_addr().map(|a| a.port()).unwrap_or(0);
    let mut session = Session::new(SessionKind::Stream, peer.port(), local, tag);
    session.handle = Some(Handle::Stream(stream));
    session.read_armed = true;
    let sref = self.pool.allocate(session)?;
    if let Err(err) = self.update_registration(sref) {
      self.pool.release(sref);
      return Err(Error::Backend(os_code(&err)));
    }

    // Probe for one more coalesced arrival; the edge-triggered reactor
    // will not renotify for connections that were already pending.
    let mut more = false;
    if let Some(l) = self.pool.get_mut(listener) {
      if let Some(Handle::Listener(sock)) = l.handle.as_ref() {
        if let Ok(conn) = sock.accept() {
          l.pending_accept = Some(conn);
          more = true;
        }
      }
    }
    if more {
      self.deferred.push_back(Deferred::Incoming(listener));
    }
    trace!("session {sref:?} accepted from {listener:?}");
    Ok(sref)
  }

  /// Queue `data` for transmission on a stream session.
  ///
  /// The bytes are copied; the caller's buffer may be reused immediately.
  /// At most one write may be outstanding per session: a second write
  /// before the [`Event::SendResult`] fails with [`Error::Busy`]. A
  /// submission failure is returned synchronously and leaves the session
  /// idle; completion and asynchronous failure arrive through the sink.
  pub fn write(
    &mut self,
    sref: SessionRef,
    data: &[u8],
  ) -> Result<usize, Error> {
    {
      let s = self.pool.get_mut(sref).ok_or(Error::InvalidArgument)?;
      if s.kind != SessionKind::Stream {
        return Err(Error::InvalidArgument);
      }
      match s.state {
        SessionState::Idle => {}
        SessionState::Defunct => return Err(Error::InvalidArgument),
        _ => return Err(Error::Busy),
      }
      if data.len() > MAX_WRITE_LEN {
        return Err(Error::InvalidArgument);
      }
      s.write_task = Some(WriteTask::new(data));
      s.state = SessionState::Active;
    }
    if let Err(err) = self.update_registration(sref) {
      // The write never started.
      if let Some(s) = self.pool.get_mut(sref) {
        s.write_task = None;
        s.state = SessionState::Idle;
      }
      return Err(Error::Backend(os_code(&err)));
    }
    Ok(data.len())
  }

  /// Copy up to `out.len()` queued bytes into `out`.
  ///
  /// Never blocks: returns 0 when nothing is queued. A single call may
  /// return bytes spanning both queued buffers, in delivery order. When
  /// the read leaves the queue unsaturated while reading was disarmed, the
  /// reactor read is re-armed here; this is the sole backpressure release
  /// point.
  pub fn read(
    &mut self,
    sref: SessionRef,
    out: &mut [u8],
  ) -> Result<usize, Error> {
    let count;
    let mut rearm = false;
    {
      let s = self.pool.get_mut(sref).ok_or(Error::InvalidArgument)?;
      if s.kind != SessionKind::Stream || s.state == SessionState::Defunct {
        return Err(Error::InvalidArgument);
      }
      count = s.recvq.read(out);
      if !s.recvq.is_full() && !s.read_armed {
        s.read_armed = true;
        rearm = true;
      }
    }
    if rearm {
      if let Err(err) = self.update_registration(sref) {
        warn!("failed to re-arm read on {sref:?}: {err}");
        if let Some(s) = self.pool.get_mut(sref) {
          s.read_armed = false;
        }
      }
    }
    Ok(count)
  }

  /// Number of live sessions.
  pub fn live_sessions(&self) -> usize {
    self.pool.live()
  }

  pub fn session_state(&self, sref: SessionRef) -> Option<SessionState> {
    self.pool.get(sref).map(|s| s.state)
  }

  pub fn session_tag(&self, sref: SessionRef) -> Option<u64> {
    self.pool.get(sref).map(|s| s.tag)
  }

  /// Local port of a session, useful after binding a listener to port 0.
  pub fn local_port(&self, sref: SessionRef) -> Option<u16> {
    self.pool.get(sref).map(|s| s.local_port)
  }

  /// Remote peer port of a stream session, 0 for listeners.
  pub fn remote_port(&self, sref: SessionRef) -> Option<u16> {
    self.pool.get(sref).map(|s| s.remote_port)
  }

  // ---- internal machinery ----

  fn emit(&mut self, event: Event) {
    self.emitted += 1;
    trace!("emit {event:?}");
    let Some(mut sink) = self.sink.take() else {
      return;
    };
    sink.on_event(self, event);
    self.sink = Some(sink);
  }

  fn tag_of(&self, sref: SessionRef) -> u64 {
    self.pool.get(sref).map(|s| s.tag).unwrap_or(0)
  }

  /// Deliver results queued for the prepare phase. Entries whose session
  /// died in the meantime are dropped: a defunct session suppresses
  /// everything but its terminal event.
  fn run_deferred(&mut self) -> bool {
    let before = self.emitted;
    if self.deferred.is_empty() {
      return false;
    }
    let batch: Vec<Deferred> = self.deferred.drain(..).collect();
    for item in batch {
      match item {
        Deferred::CreateOk(sref) => {
          let tag = match self.pool.get(sref) {
            Some(s) if s.state != SessionState::Defunct => s.tag,
            _ => continue,
          };
          self.emit(Event::CreateResult { session: sref, tag, result: Ok(()) });
        }
        Deferred::Incoming(lref) => {
          let tag = match self.pool.get(lref) {
            Some(s) if s.state != SessionState::Defunct => s.tag,
            _ => continue,
          };
          self.emit(Event::Incoming { listener: lref, tag });
        }
        Deferred::ReadReady(sref) => self.stream_read(sref),
      }
    }
    self.emitted > before
  }

  /// Apply completed name lookups: pick an address and enter the
  /// connect/listen flow, exactly as for a literal address.
  fn drain_resolver(&mut self) -> bool {
    let before = self.emitted;
    while let Ok(reply) = self.resolve_rx.try_recv() {
      let sref = reply.session;
      let resolving = self
        .pool
        .get(sref)
        .map(|s| s.state == SessionState::Resolving)
        .unwrap_or(false);
      if !resolving {
        // Destroyed while the lookup was in flight.
        continue;
      }
      let tag = self.tag_of(sref);
      match reply.result {
        Err(code) => {
          debug!("lookup for {sref:?} failed with code {code}");
          self.make_defunct(sref);
          self.emit(Event::CreateResult {
            session: sref,
            tag,
            result: Err(Error::NameLookup(code)),
          });
        }
        Ok(addrs) => match pick_addr(&addrs) {
          None => {
            self.make_defunct(sref);
            self.emit(Event::CreateResult {
              session: sref,
              tag,
              result: Err(Error::NameLookup(-1)),
            });
          }
          Some(addr) => {
            if let Err(err) = self.start_transport(sref, addr) {
              self.make_defunct(sref);
              self.emit(Event::CreateResult {
                session: sref,
                tag,
                result: Err(err),
              });
            }
          }
        },
      }
    }
    self.emitted > before
  }

  fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
    if token == WAKER_TOKEN {
      return;
    }
    let Some(sref) = self.pool.ref_at(token.0 as u32) else {
      // Stale wakeup for a recycled slot.
      return;
    };
    let Some(s) = self.pool.get(sref) else {
      return;
    };
    let (kind, state, tag) = (s.kind, s.state, s.tag);
    match kind {
      SessionKind::StreamServer => {
        if readable && state != SessionState::Defunct {
          self.emit(Event::Incoming { listener: sref, tag });
        }
      }
      SessionKind::Stream => {
        if state == SessionState::Connecting {
          if writable || readable {
            self.finish_connect(sref);
          }
          return;
        }
        if writable {
          self.flush_write(sref);
        }
        if readable {
          self.stream_read(sref);
        }
      }
      SessionKind::Datagram => {}
    }
  }

  fn finish_connect(&mut self, sref: SessionRef) {
    let outcome = {
      let Some(s) = self.pool.get_mut(sref) else {
        return;
      };
      let Some(Handle::Stream(stream)) = s.handle.as_ref() else {
        return;
      };
      match stream.take_error() {
        Ok(Some(err)) => ConnectOutcome::Failed(os_code(&err)),
        Err(err) => ConnectOutcome::Failed(os_code(&err)),
        Ok(None) => match stream.peer_addr() {
          Ok(_) => ConnectOutcome::Connected(
            stream.local_addr().map(|a| a.port()).unwrap_or(0),
          ),
          Err(err)
            if err.kind() == io::ErrorKind::NotConnected
              || err.raw_os_error() == Some(libc::EINPROGRESS) =>
          {
            ConnectOutcome::Pending
          }
          Err(err) => ConnectOutcome::Failed(os_code(&err)),
        },
      }
    };
    let tag = self.tag_of(sref);
    match outcome {
      ConnectOutcome::Pending => {}
      ConnectOutcome::Connected(local) => {
        if let Some(s) = self.pool.get_mut(sref) {
          s.state = SessionState::Idle;
          s.local_port = local;
          s.recvq.clear();
          s.read_armed = true;
        }
        if let Err(err) = self.update_registration(sref) {
          self.make_defunct(sref);
          self.emit(Event::CreateResult {
            session: sref,
            tag,
            result: Err(Error::Backend(os_code(&err))),
          });
          return;
        }
        debug!("session {sref:?} connected");
        self.emit(Event::CreateResult { session: sref, tag, result: Ok(()) });
      }
      ConnectOutcome::Failed(code) => {
        debug!("session {sref:?} connect failed with code {code}");
        self.make_defunct(sref);
        self.emit(Event::CreateResult {
          session: sref,
          tag,
          result: Err(Error::Backend(code)),
        });
      }
    }
  }

  fn flush_write(&mut self, sref: SessionRef) {
    let outcome = 'outcome: {
      let Some(s) = self.pool.get_mut(sref) else {
        return;
      };
      if s.state != SessionState::Active {
        return;
      }
      let (Some(Handle::Stream(stream)), Some(task)) =
        (s.handle.as_mut(), s.write_task.as_mut())
      else {
        return;
      };
      loop {
        if task.is_done() {
          break 'outcome FlushOutcome::Done;
        }
        match stream.write(task.remaining()) {
          // The backend reported no code for a zero-length acceptance.
          Ok(0) => break 'outcome FlushOutcome::Failed(-1),
          Ok(n) => task.advance(n),
          Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            break 'outcome FlushOutcome::Pending;
          }
          Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
          Err(err) => break 'outcome FlushOutcome::Failed(os_code(&err)),
        }
      }
    };
    let tag = self.tag_of(sref);
    match outcome {
      FlushOutcome::Pending => {}
      FlushOutcome::Done => {
        if let Some(s) = self.pool.get_mut(sref) {
          s.write_task = None;
          s.state = SessionState::Idle;
        }
        let _ = self.update_registration(sref);
        self.emit(Event::SendResult { session: sref, tag, result: Ok(()) });
      }
      FlushOutcome::Failed(code) => {
        self.make_defunct(sref);
        self.emit(Event::SendResult {
          session: sref,
          tag,
          result: Err(Error::Backend(code)),
        });
      }
    }
  }

  /// Pull whatever the socket has buffered, merge it into one contiguous
  /// buffer, and enqueue it. Updates and events follow the queue's rules:
  /// a buffer landing in slot 1 disarms the reactor read.
  fn stream_read(&mut self, sref: SessionRef) {
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut total = 0usize;
    let mut closed = false;
    let mut failed: Option<i32> = None;
    let mut exhausted = false;
    {
      let Some(s) = self.pool.get_mut(sref) else {
        return;
      };
      if s.kind != SessionKind::Stream
        || !matches!(s.state, SessionState::Idle | SessionState::Active)
        || !s.read_armed
        || s.recvq.is_full()
      {
        return;
      }
      let Some(Handle::Stream(stream)) = s.handle.as_mut() else {
        return;
      };
      while total < READ_PASS_LIMIT {
        let mut buf = vec![0u8; READ_CHUNK];
        match stream.read(&mut buf) {
          Ok(0) => {
            closed = true;
            break;
          }
          Ok(n) => {
            buf.truncate(n);
            total += n;
            chunks.push(buf);
          }
          Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            exhausted = true;
            break;
          }
          Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
          Err(err) => {
            failed = Some(os_code(&err));
            break;
          }
        }
      }
    }

    let tag = self.tag_of(sref);
    if !chunks.is_empty() {
      let merged = merge_chunks(chunks);
      if let Some(s) = self.pool.get_mut(sref) {
        if s.recvq.push(merged) {
          s.read_armed = false;
        }
      }
      let _ = self.update_registration(sref);
      self.emit(Event::Data { session: sref, tag });
    }

    // The sink may have destroyed the session while reacting to the data.
    let live = self
      .pool
      .get(sref)
      .map(|s| s.state != SessionState::Defunct)
      .unwrap_or(false);
    if !live {
      return;
    }

    if let Some(code) = failed {
      debug!("session {sref:?} read failed with code {code}");
      self.make_defunct(sref);
      self.emit(Event::Terminate {
        session: sref,
        tag,
        error: Some(Error::Backend(code)),
      });
    } else if closed {
      debug!("session {sref:?} closed by peer");
      self.make_defunct(sref);
      self.emit(Event::Terminate { session: sref, tag, error: None });
    } else if !exhausted {
      // Hit the pass ceiling with bytes still buffered; continue next step.
      let armed = self
        .pool
        .get(sref)
        .map(|s| s.read_armed && !s.recvq.is_full())
        .unwrap_or(false);
      if armed {
        self.deferred.push_back(Deferred::ReadReady(sref));
      }
    }
  }

  fn start_lookup(
    &mut self,
    sref: SessionRef,
    host: String,
    port: u16,
  ) -> Result<(), Error> {
    if let Some(s) = self.pool.get_mut(sref) {
      s.state = SessionState::Resolving;
    }
    trace!("session {sref:?} resolving {host:?}");
    let resolver = Arc::clone(&self.resolver);
    let tx = self.resolve_tx.clone();
    let waker = Arc::clone(&self.waker);
    thread::Builder::new()
      .name("msock-resolve".into())
      .spawn(move || {
        let result = resolver.lookup(&host, port);
        let _ = tx.send(ResolveReply { session: sref, result });
        let _ = waker.wake();
      })
      .map_err(|err| Error::Backend(os_code(&err)))?;
    Ok(())
  }

  /// Enter the connect (stream) or listen (stream server) flow for a
  /// resolved address. A synchronous failure here is reported to the
  /// caller; the caller decides whether that is a sync error return
  /// (creation) or a defunct-plus-event (post-resolution).
  fn start_transport(
    &mut self,
    sref: SessionRef,
    addr: SocketAddr,
  ) -> Result<(), Error> {
    let kind = self
      .pool
      .get(sref)
      .map(|s| s.kind)
      .ok_or(Error::InvalidArgument)?;
    match kind {
      SessionKind::Stream => {
        let stream = TcpStream::connect(addr)
          .map_err(|err| Error::Backend(os_code(&err)))?;
        if let Some(s) = self.pool.get_mut(sref) {
          s.handle = Some(Handle::Stream(stream));
          s.state = SessionState::Connecting;
        }
        self
          .update_registration(sref)
          .map_err(|err| Error::Backend(os_code(&err)))?;
        Ok(())
      }
      SessionKind::StreamServer => {
        let listener = TcpListener::bind(addr)
          .map_err(|err| Error::Backend(os_code(&err)))?;
        let local = listener.local_addr().map(|a| a.port()).unwrap_or(0);
        if let Some(s) = self.pool.get_mut(sref) {
          s.handle = Some(Handle::Listener(listener));
          s.state = SessionState::Idle;
          s.local_port = local;
        }
        self
          .update_registration(sref)
          .map_err(|err| Error::Backend(os_code(&err)))?;
        // Listen setup has no readiness event of its own; its create
        // result travels through the sink on the next step.
        self.deferred.push_back(Deferred::CreateOk(sref));
        Ok(())
      }
      SessionKind::Datagram => Err(Error::Unimplemented),
    }
  }

  /// Terminal transition: release buffers, the in-flight task, and the
  /// backend handle. The slot itself stays allocated until the
  /// application destroys the session.
  fn make_defunct(&mut self, sref: SessionRef) {
    let registry = self.poll.registry();
    let Some(s) = self.pool.get_mut(sref) else {
      return;
    };
    let was_registered = s.registered.take().is_some();
    if let Some(mut handle) = s.strip() {
      if was_registered {
        let result = match &mut handle {
          Handle::Stream(stream) => registry.deregister(stream),
          Handle::Listener(listener) => registry.deregister(listener),
        };
        if let Err(err) = result {
          trace!("deregister on defunct failed: {err}");
        }
      }
    }
  }

  /// Reconcile the reactor registration with what the session needs right
  /// now. No-op when they already agree.
  fn update_registration(&mut self, sref: SessionRef) -> io::Result<()> {
    let registry = self.poll.registry();
    let Some(s) = self.pool.get_mut(sref) else {
      return Ok(());
    };
    let desired = s.desired_interest();
    if desired == s.registered {
      return Ok(());
    }
    let token = Token(sref.slot() as usize);
    let Some(handle) = s.handle.as_mut() else {
      s.registered = None;
      return Ok(());
    };
    match handle {
      Handle::Stream(stream) => {
        apply_interest(registry, stream, token, s.registered, desired)?
      }
      Handle::Listener(listener) => {
        apply_interest(registry, listener, token, s.registered, desired)?
      }
    }
    s.registered = desired;
    Ok(())
  }
}

fn apply_interest<Src: mio::event::Source>(
  registry: &mio::Registry,
  source: &mut Src,
  token: Token,
  current: Option<Interest>,
  desired: Option<Interest>,
) -> io::Result<()> {
  match (current, desired) {
    (None, Some(interest)) => registry.register(source, token, interest),
    (Some(_), Some(interest)) => registry.reregister(source, token, interest),
    (Some(_), None) => registry.deregister(source),
    (None, None) => Ok(()),
  }
}

impl<S: EventSink> Drop for Context<S> {
  /// Teardown discipline: every live session is released and its handle
  /// deregistered before the reactor goes away, and the sink is never
  /// invoked again.
  fn drop(&mut self) {
    self.tearing_down = true;
    let refs = self.pool.live_refs();
    if !refs.is_empty() {
      debug!("context dropped with {} live sessions", refs.len());
    }
    for sref in refs {
      if let Some(mut session) = self.pool.release(sref) {
        if session.registered.take().is_some() {
          if let Some(handle) = session.handle.as_mut() {
            let result = match handle {
              Handle::Stream(stream) => self.poll.registry().deregister(stream),
              Handle::Listener(listener) => {
                self.poll.registry().deregister(listener)
              }
            };
            if let Err(err) = result {
              trace!("deregister during teardown failed: {err}");
            }
          }
        }
      }
    }
  }
}
