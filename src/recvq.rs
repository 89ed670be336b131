//! Two-slot receive-buffer queue.
//!
//! Slot 0 is always the buffer currently being drained by reads; slot 1
//! holds at most one extra buffer. Arrivals are copy-merged into a single
//! contiguous buffer before enqueueing, so the queue depth never exceeds two
//! regardless of how fragmented the underlying delivery was. Once slot 1 is
//! occupied the engine disarms the reactor read until a read drains it.

/// Concatenate the chunks of one readiness pass into a single buffer.
///
/// Single-chunk passes hand the buffer through without copying.
pub(crate) fn merge_chunks(mut chunks: Vec<Vec<u8>>) -> Vec<u8> {
  if chunks.len() == 1 {
    return chunks.pop().unwrap_or_default();
  }
  let total = chunks.iter().map(Vec::len).sum();
  let mut merged = Vec::with_capacity(total);
  for chunk in chunks {
    merged.extend_from_slice(&chunk);
  }
  merged
}

#[derive(Debug, Default)]
pub(crate) struct RecvQueue {
  slots: [Option<Vec<u8>>; 2],
  /// Read cursor into slot 0. Always `<=` slot 0's length.
  readhead: usize,
}

impl RecvQueue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Drop all queued data and reset the cursor.
  pub fn clear(&mut self) {
    self.slots = [None, None];
    self.readhead = 0;
  }

  pub fn is_empty(&self) -> bool {
    self.slots[0].is_none()
  }

  /// Both slots occupied: the consumer must disarm further arrivals.
  pub fn is_full(&self) -> bool {
    self.slots[1].is_some()
  }

  /// Enqueue one merged buffer. Returns `true` when the buffer landed in
  /// slot 1, i.e. the caller must disarm the reactor read.
  ///
  /// A push against a full queue merges into slot 1 rather than dropping;
  /// with the disarm rule honored that path is never taken.
  pub fn push(&mut self, buf: Vec<u8>) -> bool {
    debug_assert!(!self.is_full(), "push against a full receive queue");
    if self.slots[0].is_none() {
      self.slots[0] = Some(buf);
      self.readhead = 0;
      false
    } else if self.slots[1].is_none() {
      self.slots[1] = Some(buf);
      true
    } else {
      match &mut self.slots[1] {
        Some(second) => second.extend_from_slice(&buf),
        None => unreachable!(),
      }
      true
    }
  }

  /// Copy up to `out.len()` queued bytes into `out`, in arrival order.
  ///
  /// Returns 0 immediately when nothing is queued. A single call may span
  /// both slots: draining slot 0 promotes slot 1 and copying continues from
  /// the promoted buffer.
  pub fn read(&mut self, out: &mut [u8]) -> usize {
    let Some(front) = self.slots[0].as_ref() else {
      return 0;
    };
    let current = front.len() - self.readhead;
    if out.len() < current {
      out.copy_from_slice(&front[self.readhead..self.readhead + out.len()]);
      self.readhead += out.len();
      return out.len();
    }
    out[..current].copy_from_slice(&front[self.readhead..]);
    self.slots[0] = self.slots[1].take();
    self.readhead = 0;
    let Some(front) = self.slots[0].as_ref() else {
      return current;
    };
    let want = out.len() - current;
    if want < front.len() {
      out[current..current + want].copy_from_slice(&front[..want]);
      self.readhead = want;
      out.len()
    } else {
      let extra = front.len();
      out[current..current + extra].copy_from_slice(front);
      self.slots[0] = None;
      current + extra
    }
  }

  #[cfg(test)]
  pub fn depth(&self) -> usize {
    self.slots.iter().filter(|s| s.is_some()).count()
  }
}
