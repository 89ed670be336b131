//! API-surface tests: argument validation, capacity, stale references,
//! lookup failures, and the stepping contract.

use std::{
  cell::RefCell,
  net::SocketAddr,
  rc::Rc,
  sync::Arc,
  thread,
  time::Duration,
};

use msock::{
  Config, Context, Error, Event, EventSink, NameType, Resolver, SessionKind,
  SessionState,
};

const LOCALHOST: [u8; 4] = [127, 0, 0, 1];

struct Recorder {
  events: Rc<RefCell<Vec<Event>>>,
}

impl EventSink for Recorder {
  fn on_event(&mut self, _ctx: &mut Context<Self>, event: Event) {
    self.events.borrow_mut().push(event);
  }
}

fn new_ctx(config: Config) -> (Context<Recorder>, Rc<RefCell<Vec<Event>>>) {
  let events = Rc::new(RefCell::new(Vec::new()));
  let sink = Recorder { events: Rc::clone(&events) };
  (Context::with_config(config, sink).unwrap(), events)
}

fn step_until(
  ctx: &mut Context<Recorder>,
  events: &Rc<RefCell<Vec<Event>>>,
  what: &str,
  pred: impl Fn(&[Event]) -> bool,
) {
  for _ in 0..2000 {
    ctx.step(false).unwrap();
    if pred(&events.borrow()) {
      return;
    }
    thread::sleep(Duration::from_millis(1));
  }
  panic!("timed out waiting for {what}; events: {:?}", events.borrow());
}

#[test]
fn datagram_sessions_are_not_supported() {
  let (mut ctx, _) = new_ctx(Config::default());
  let err = ctx
    .create_session(SessionKind::Datagram, NameType::Ipv4, &LOCALHOST, 53, 0, 0)
    .unwrap_err();
  assert_eq!(err, Error::Unimplemented);
  assert_eq!(ctx.live_sessions(), 0);
}

#[test]
fn malformed_names_and_ports_fail_synchronously() {
  let (mut ctx, _) = new_ctx(Config::default());

  // Literal address lengths are exact.
  for bad in [&[127u8, 0, 1][..], &[0u8; 5][..], &[][..]] {
    let err = ctx
      .create_session(SessionKind::Stream, NameType::Ipv4, bad, 80, 0, 0)
      .unwrap_err();
    assert_eq!(err, Error::InvalidArgument);
  }
  let err = ctx
    .create_session(SessionKind::Stream, NameType::Ipv6, &[0u8; 4], 80, 0, 0)
    .unwrap_err();
  assert_eq!(err, Error::InvalidArgument);

  // Host names must be UTF-8.
  let err = ctx
    .create_session(SessionKind::Stream, NameType::Dns, &[0xff, 0xfe], 80, 0, 0)
    .unwrap_err();
  assert_eq!(err, Error::InvalidArgument);

  // Ports ride in a wider integer but must fit a real port.
  for (port, local) in [(65536, 0), (u32::MAX, 0), (80, 70000)] {
    let err = ctx
      .create_session(
        SessionKind::Stream,
        NameType::Ipv4,
        &LOCALHOST,
        port,
        local,
        0,
      )
      .unwrap_err();
    assert_eq!(err, Error::InvalidArgument);
  }

  // Failed creations leave nothing behind.
  assert_eq!(ctx.live_sessions(), 0);
}

#[test]
fn session_capacity_is_enforced_and_slots_recycle() {
  let (mut ctx, _) = new_ctx(Config { max_sessions: 2 });
  let a = ctx
    .create_session(SessionKind::StreamServer, NameType::Ipv4, &LOCALHOST, 0, 0, 0)
    .unwrap();
  let _b = ctx
    .create_session(SessionKind::StreamServer, NameType::Ipv4, &LOCALHOST, 0, 0, 0)
    .unwrap();
  let err = ctx
    .create_session(SessionKind::StreamServer, NameType::Ipv4, &LOCALHOST, 0, 0, 0)
    .unwrap_err();
  assert_eq!(err, Error::MaxSession);

  // Destroying one makes room for exactly one more.
  ctx.destroy_session(a).unwrap();
  let c = ctx
    .create_session(SessionKind::StreamServer, NameType::Ipv4, &LOCALHOST, 0, 0, 0)
    .unwrap();
  assert_ne!(a, c);
  assert_eq!(ctx.live_sessions(), 2);
}

#[test]
fn stale_references_are_rejected() {
  let (mut ctx, _) = new_ctx(Config::default());
  let a = ctx
    .create_session(SessionKind::StreamServer, NameType::Ipv4, &LOCALHOST, 0, 0, 5)
    .unwrap();
  assert_eq!(ctx.session_tag(a), Some(5));
  ctx.destroy_session(a).unwrap();

  assert_eq!(ctx.session_state(a), None);
  assert_eq!(ctx.destroy_session(a).unwrap_err(), Error::InvalidArgument);
  assert_eq!(ctx.write(a, b"x").unwrap_err(), Error::InvalidArgument);
  let mut buf = [0u8; 4];
  assert_eq!(ctx.read(a, &mut buf).unwrap_err(), Error::InvalidArgument);

  // Even after the slot is reused the old reference stays dead.
  let b = ctx
    .create_session(SessionKind::StreamServer, NameType::Ipv4, &LOCALHOST, 0, 0, 6)
    .unwrap();
  assert_eq!(ctx.session_state(a), None);
  assert_eq!(ctx.session_tag(b), Some(6));
}

#[test]
fn listeners_reject_stream_operations() {
  let (mut ctx, _) = new_ctx(Config::default());
  let listener = ctx
    .create_session(SessionKind::StreamServer, NameType::Ipv4, &LOCALHOST, 0, 0, 0)
    .unwrap();
  assert_eq!(ctx.write(listener, b"x").unwrap_err(), Error::InvalidArgument);
  let mut buf = [0u8; 4];
  assert_eq!(ctx.read(listener, &mut buf).unwrap_err(), Error::InvalidArgument);

  // Accept, conversely, is for listeners only.
  let stream = ctx
    .create_session(SessionKind::Stream, NameType::Ipv4, &LOCALHOST, 9, 0, 0)
    .unwrap();
  assert_eq!(ctx.accept(stream, 0).unwrap_err(), Error::InvalidArgument);
}

struct FailingResolver(i32);

impl Resolver for FailingResolver {
  fn lookup(&self, _host: &str, _port: u16) -> Result<Vec<SocketAddr>, i32> {
    Err(self.0)
  }
}

struct EmptyResolver;

impl Resolver for EmptyResolver {
  fn lookup(&self, _host: &str, _port: u16) -> Result<Vec<SocketAddr>, i32> {
    Ok(Vec::new())
  }
}

#[test]
fn failed_lookup_surfaces_through_the_sink() {
  let events = Rc::new(RefCell::new(Vec::new()));
  let sink = Recorder { events: Rc::clone(&events) };
  let mut ctx = Context::with_resolver(
    Config::default(),
    Arc::new(FailingResolver(-3)),
    sink,
  )
  .unwrap();

  // The creation itself succeeds: the session is committed and the
  // failure must arrive asynchronously.
  let session = ctx
    .create_session(SessionKind::Stream, NameType::Dns, b"nowhere.test", 80, 0, 4)
    .unwrap();
  assert_eq!(ctx.live_sessions(), 1);

  step_until(&mut ctx, &events, "lookup failure", |events| {
    events.iter().any(|e| {
      matches!(
        e,
        Event::CreateResult { session: s, tag: 4, result: Err(Error::NameLookup(-3)) }
          if *s == session
      )
    })
  });
  assert_eq!(ctx.session_state(session), Some(SessionState::Defunct));
  ctx.destroy_session(session).unwrap();
}

#[test]
fn lookup_with_no_candidates_fails() {
  let events = Rc::new(RefCell::new(Vec::new()));
  let sink = Recorder { events: Rc::clone(&events) };
  let mut ctx =
    Context::with_resolver(Config::default(), Arc::new(EmptyResolver), sink)
      .unwrap();

  let session = ctx
    .create_session(SessionKind::Stream, NameType::Dns, b"empty.test", 80, 0, 0)
    .unwrap();
  step_until(&mut ctx, &events, "empty lookup failure", |events| {
    events.iter().any(|e| {
      matches!(
        e,
        Event::CreateResult { session: s, result: Err(Error::NameLookup(_)), .. }
          if *s == session
      )
    })
  });
}

#[test]
fn dropping_a_context_with_live_sessions_is_clean() {
  let (mut ctx, _) = new_ctx(Config::default());
  for _ in 0..4 {
    ctx
      .create_session(SessionKind::StreamServer, NameType::Ipv4, &LOCALHOST, 0, 0, 0)
      .unwrap();
  }
  assert_eq!(ctx.live_sessions(), 4);
  drop(ctx);
}

struct Reentrant;

impl EventSink for Reentrant {
  fn on_event(&mut self, ctx: &mut Context<Self>, _event: Event) {
    // Contract violation on purpose.
    let _ = ctx.step(false);
  }
}

#[test]
#[should_panic(expected = "not reentrant")]
fn step_panics_when_reentered_from_a_sink() {
  let mut ctx = Context::new(Reentrant).unwrap();
  ctx
    .create_session(SessionKind::StreamServer, NameType::Ipv4, &LOCALHOST, 0, 0, 0)
    .unwrap();
  // The listener's create result fires on the first step and the sink
  // recurses into it.
  ctx.step(false).unwrap();
}
