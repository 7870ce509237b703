use crate::addr::Addr;
use crate::engine::{INVALID_FILE, INVALID_SOCKET, RawFile, RawSocket};
use crate::error::Error;

/// What a context is asking the OS to do. The readiness direction is
/// derived from the kind: recv-like operations arm for readability,
/// send-like operations for writability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
  Send,
  SendTo,
  Recv,
  RecvFrom,
  Accept,
  Connect,
  SendFile,
}

impl OpKind {
  pub(crate) fn is_read(self) -> bool {
    matches!(self, OpKind::Recv | OpKind::RecvFrom | OpKind::Accept)
  }
}

/// Completion callback invoked exactly once per submitted context, with
/// the context's final state and the overall outcome.
pub type IoCallback = Box<dyn FnOnce(&mut IoContext, Result<(), Error>) + Send>;

/// Per-operation state record. One context accompanies one submitted
/// operation from initiation to its single completion; the engine owns it
/// in between and the context (buffer included) is released when
/// [`IoContext::complete`] returns.
pub struct IoContext {
  pub kind: OpKind,
  /// The socket the operation runs on.
  pub fd: RawSocket,
  /// The accepted connection's handle, filled by `Accept`.
  pub peer: RawSocket,
  /// Target address (`SendTo`, `Connect`) or resulting source address
  /// (`RecvFrom`, `Accept`).
  pub addr: Option<Addr>,
  /// Data buffer, owned by the context while the operation is in flight.
  pub buf: Vec<u8>,
  /// Bytes the caller asked to move (for `SendFile`, the file length).
  pub requested: usize,
  /// Bytes actually moved. May be less than `requested`; partial
  /// transfers are successful completions.
  pub transferred: usize,
  /// Source file for `SendFile`.
  pub file: RawFile,
  /// Streaming progress for `SendFile`.
  pub file_offset: i64,
  callback: Option<IoCallback>,
}

impl IoContext {
  pub fn new(kind: OpKind, fd: RawSocket, callback: IoCallback) -> Self {
    Self {
      kind,
      fd,
      peer: INVALID_SOCKET,
      addr: None,
      buf: Vec::new(),
      requested: 0,
      transferred: 0,
      file: INVALID_FILE,
      file_offset: 0,
      callback: Some(callback),
    }
  }

  /// Delivers the single completion and releases the context.
  pub fn complete(mut self, result: Result<(), Error>) {
    if let Some(callback) = self.callback.take() {
      callback(&mut self, result);
    }
  }

  /// Moves the buffer out, leaving an empty one behind. Used by event
  /// constructors to hand ownership back to the caller.
  pub fn take_buf(&mut self) -> Vec<u8> {
    std::mem::take(&mut self.buf)
  }
}

impl std::fmt::Debug for IoContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IoContext")
      .field("kind", &self.kind)
      .field("fd", &self.fd)
      .field("requested", &self.requested)
      .field("transferred", &self.transferred)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn complete_runs_the_callback_once_with_final_state() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    let mut ctx = IoContext::new(
      OpKind::Send,
      INVALID_SOCKET,
      Box::new(move |ctx, result| {
        assert!(result.is_ok());
        assert_eq!(ctx.transferred, 3);
        hits2.fetch_add(1, Ordering::SeqCst);
      }),
    );
    ctx.transferred = 3;
    ctx.complete(Ok(()));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn read_direction_matches_operation_kind() {
    for kind in [OpKind::Recv, OpKind::RecvFrom, OpKind::Accept] {
      assert!(kind.is_read());
    }
    for kind in
      [OpKind::Send, OpKind::SendTo, OpKind::Connect, OpKind::SendFile]
    {
      assert!(!kind.is_read());
    }
  }
}
