/// An in-flight write: a private copy of the caller's bytes plus a flush
/// cursor.
///
/// The task is created by [`Context::write`](crate::Context::write) and
/// dropped unconditionally when the write completes or fails, never otherwise.
/// Because the bytes are copied up front, the caller's buffer may be reused
/// or freed as soon as `write` returns.
#[derive(Debug)]
pub(crate) struct WriteTask {
  buf: Vec<u8>,
  written: usize,
}

impl WriteTask {
  pub fn new(data: &[u8]) -> Self {
    Self { buf: data.to_vec(), written: 0 }
  }

  pub fn remaining(&self) -> &[u8] {
    &self.buf[self.written..]
  }

  pub fn advance(&mut self, n: usize) {
    self.written += n;
    debug_assert!(self.written <= self.buf.len());
  }

  pub fn is_done(&self) -> bool {
    self.written == self.buf.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn advances_to_completion() {
    let mut task = WriteTask::new(b"abc123");
    assert_eq!(task.remaining(), b"abc123");
    task.advance(4);
    assert_eq!(task.remaining(), b"23");
    assert!(!task.is_done());
    task.advance(2);
    assert!(task.is_done());
    assert!(task.remaining().is_empty());
  }

  #[test]
  fn owns_a_copy_of_the_caller_bytes() {
    let mut src = b"hello".to_vec();
    let task = WriteTask::new(&src);
    src.clear();
    assert_eq!(task.remaining(), b"hello");
  }
}
