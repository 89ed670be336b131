//! Fixed-capacity session arena with an intrusive free list.
//!
//! Slots are created on demand up to the configured capacity and recycled
//! forever after. Each slot carries a generation counter that is bumped on
//! release, so references held past a session's destruction are detected
//! instead of silently aliasing the slot's next occupant.

use crate::{Error, session::Session};

/// Opaque, copyable reference to a live session.
///
/// A `SessionRef` is a weak back-reference: every engine call validates it
/// against the slot's occupancy and generation, and a reference that outlives
/// its session fails with [`Error::InvalidArgument`] even after the slot has
/// been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionRef {
  slot: u32,
  generation: u32,
}

impl SessionRef {
  pub(crate) fn slot(&self) -> u32 {
    self.slot
  }
}

enum Slot {
  /// On the free list; `next_free` is only meaningful in this state.
  Vacant { next_free: Option<u32> },
  Occupied(Session),
}

struct Entry {
  generation: u32,
  slot: Slot,
}

pub(crate) struct Pool {
  entries: Vec<Entry>,
  free_head: Option<u32>,
  capacity: usize,
  live: usize,
}

impl Pool {
  pub fn with_capacity(capacity: usize) -> Self {
    Self { entries: Vec::new(), free_head: None, capacity, live: 0 }
  }

  pub fn live(&self) -> usize {
    self.live
  }

  pub fn is_full(&self) -> bool {
    self.live >= self.capacity
  }

  /// Place `session` into a free slot. O(1): pops the free-list head, or
  /// claims a fresh slot while below capacity. Fails with
  /// [`Error::MaxSession`] once every slot is occupied.
  pub fn allocate(&mut self, session: Session) -> Result<SessionRef, Error> {
    let slot = match self.free_head {
      Some(slot) => {
        let entry = &mut self.entries[slot as usize];
        match entry.slot {
          Slot::Vacant { next_free } => self.free_head = next_free,
          Slot::Occupied(_) => unreachable!("occupied slot on the free list"),
        }
        entry.slot = Slot::Occupied(session);
        slot
      }
      None => {
        if self.entries.len() >= self.capacity {
          return Err(Error::MaxSession);
        }
        let slot = self.entries.len() as u32;
        self
          .entries
          .push(Entry { generation: 0, slot: Slot::Occupied(session) });
        slot
      }
    };
    self.live += 1;
    Ok(SessionRef { slot, generation: self.entries[slot as usize].generation })
  }

  /// Vacate the slot and hand the session back for teardown. The slot's
  /// generation is bumped so `sref` and any copies of it go stale
  /// immediately. Returns `None` for stale or already-free references.
  pub fn release(&mut self, sref: SessionRef) -> Option<Session> {
    let entry = self.entries.get_mut(sref.slot as usize)?;
    if entry.generation != sref.generation
      || !matches!(entry.slot, Slot::Occupied(_))
    {
      return None;
    }
    let old =
      std::mem::replace(&mut entry.slot, Slot::Vacant { next_free: self.free_head });
    entry.generation = entry.generation.wrapping_add(1);
    self.free_head = Some(sref.slot);
    self.live -= 1;
    match old {
      Slot::Occupied(session) => Some(session),
      Slot::Vacant { .. } => unreachable!(),
    }
  }

  pub fn get(&self, sref: SessionRef) -> Option<&Session> {
    let entry = self.entries.get(sref.slot as usize)?;
    if entry.generation != sref.generation {
      return None;
    }
    match &entry.slot {
      Slot::Occupied(session) => Some(session),
      Slot::Vacant { .. } => None,
    }
  }

  pub fn get_mut(&mut self, sref: SessionRef) -> Option<&mut Session> {
    let entry = self.entries.get_mut(sref.slot as usize)?;
    if entry.generation != sref.generation {
      return None;
    }
    match &mut entry.slot {
      Slot::Occupied(session) => Some(session),
      Slot::Vacant { .. } => None,
    }
  }

  /// Current reference for an occupied slot, e.g. when mapping a reactor
  /// token back to a session. `None` for vacant slots (stale wakeups).
  pub fn ref_at(&self, slot: u32) -> Option<SessionRef> {
    let entry = self.entries.get(slot as usize)?;
    match entry.slot {
      Slot::Occupied(_) => {
        Some(SessionRef { slot, generation: entry.generation })
      }
      Slot::Vacant { .. } => None,
    }
  }

  /// References of every live session, for context teardown.
  pub fn live_refs(&self) -> Vec<SessionRef> {
    (0..self.entries.len() as u32).filter_map(|slot| self.ref_at(slot)).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::session::{Session, SessionKind};

  fn dummy() -> Session {
    Session::new(SessionKind::Stream, 0, 0, 0)
  }

  #[test]
  fn refs_are_unique_while_live() {
    let mut pool = Pool::with_capacity(16);
    let mut refs = std::collections::HashSet::new();
    for _ in 0..16 {
      assert!(refs.insert(pool.allocate(dummy()).unwrap()));
    }
    assert_eq!(pool.live(), 16);
  }

  #[test]
  fn max_session_exactly_at_capacity() {
    let mut pool = Pool::with_capacity(2);
    let a = pool.allocate(dummy()).unwrap();
    let _b = pool.allocate(dummy()).unwrap();
    assert_eq!(pool.allocate(dummy()).unwrap_err(), Error::MaxSession);
    assert!(pool.release(a).is_some());
    // A freed slot makes room again.
    assert!(pool.allocate(dummy()).is_ok());
    assert_eq!(pool.allocate(dummy()).unwrap_err(), Error::MaxSession);
  }

  #[test]
  fn release_bumps_generation() {
    let mut pool = Pool::with_capacity(4);
    let a = pool.allocate(dummy()).unwrap();
    assert!(pool.release(a).is_some());
    let b = pool.allocate(dummy()).unwrap();
    assert_eq!(a.slot(), b.slot(), "slot should be reused");
    assert_ne!(a, b, "reused slot must carry a new generation");
  }

  #[test]
  fn stale_refs_are_rejected() {
    let mut pool = Pool::with_capacity(4);
    let a = pool.allocate(dummy()).unwrap();
    pool.release(a);
    let b = pool.allocate(dummy()).unwrap();

    assert!(pool.get(a).is_none());
    assert!(pool.get_mut(a).is_none());
    assert!(pool.release(a).is_none(), "double release must fail");
    assert!(pool.get(b).is_some());
  }

  #[test]
  fn ref_at_skips_vacant_slots() {
    let mut pool = Pool::with_capacity(4);
    let a = pool.allocate(dummy()).unwrap();
    let b = pool.allocate(dummy()).unwrap();
    assert_eq!(pool.ref_at(a.slot()), Some(a));
    pool.release(a);
    assert_eq!(pool.ref_at(a.slot()), None);
    assert_eq!(pool.live_refs(), vec![b]);
  }
}
