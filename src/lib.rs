//! # msock - Minimal Event-Driven Socket Sessions
//!
//! msock multiplexes many concurrent socket sessions over a single
//! non-blocking reactor, behind a small session API: create, accept, read,
//! write, destroy. The application drives everything by repeatedly calling
//! [`Context::step`] and reacts to events delivered through its
//! [`EventSink`].
//!
//! ## Model
//! - **Fixed-capacity session pool** with O(1) allocation and recycling;
//!   session handles stay valid-checkable even after the slot is reused.
//! - **Two-buffer receive queue** per session with built-in backpressure:
//!   once both buffers are occupied the reactor stops reading until the
//!   application drains the queue.
//! - **Single outstanding write** per session; the bytes are copied at
//!   submission so the caller's buffer is free immediately.
//! - **Cooperative stepping**: no internal threads touch session state;
//!   events fire only from inside `step`, on the calling thread.
//!
//! ## Quick Start
//!
//! ```no_run
//! use msock::{Context, Event, EventSink, NameType, SessionKind};
//!
//! struct Echo;
//!
//! impl EventSink for Echo {
//!   fn on_event(&mut self, ctx: &mut Context<Self>, event: Event) {
//!     match event {
//!       Event::Incoming { listener, .. } => {
//!         let _ = ctx.accept(listener, 0);
//!       }
//!       Event::Data { session, .. } => {
//!         let mut buf = [0u8; 4096];
//!         if let Ok(n) = ctx.read(session, &mut buf) {
//!           if n > 0 {
//!             let _ = ctx.write(session, &buf[..n]);
//!           }
//!         }
//!       }
//!       Event::Terminate { session, .. } => {
//!         let _ = ctx.destroy_session(session);
//!       }
//!       _ => {}
//!     }
//!   }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!   let mut ctx = Context::new(Echo)?;
//!   ctx
//!     .create_session(
//!       SessionKind::StreamServer,
//!       NameType::Ipv4,
//!       &[0, 0, 0, 0],
//!       7000,
//!       0,
//!       0,
//!     )
//!     .map_err(std::io::Error::other)?;
//!   loop {
//!     ctx.step(true)?;
//!   }
//! }
//! ```
//!
//! ## Threading
//!
//! A [`Context`] is single-threaded. Name lookups run on short-lived worker
//! threads internally, but their results are only applied from inside
//! `step`; the sink is never called from another thread. Run several
//! contexts, one per thread, to scale out.
//!
//! ## Error Handling
//!
//! Synchronous failures (bad arguments, pool exhaustion, submission
//! failures) come back as [`Error`] from the call itself. Anything that
//! fails after a session is committed arrives through the sink, carried by
//! the event that reports the affected operation.

mod context;
mod error;
mod event;
mod pool;
mod recvq;
mod resolve;
mod session;
mod write_task;

pub use context::{Config, Context};
pub use error::Error;
pub use event::{Event, EventSink};
pub use pool::SessionRef;
pub use resolve::{NameType, Resolver, StdResolver};
pub use session::{SessionKind, SessionState};
