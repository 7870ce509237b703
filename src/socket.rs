//! The user-facing socket: task-returning operation adapters over a
//! [`CompletionEngine`], plus the self-re-arming receive/accept loops.

use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, Ordering};

use crate::addr::Addr;
use crate::context::{IoContext, OpKind};
use crate::engine::{IoService, RawFile, RawSocket};
use crate::error::{Error, Result};
use crate::event::{ConnectedEvent, RecvEvent, SendEvent};
use crate::sync::Mutex;
use crate::task::{CancelToken, Task, TaskCompletion};

/// Handle slot value once the socket is closed. On Unix this is the
/// plain invalid fd; on Windows `INVALID_SOCKET` has the same bit
/// pattern.
const CLOSED: isize = -1;

/// An asynchronous socket bound to an [`IoService`].
///
/// Cloning shares the same OS handle. The handle slot is atomic and is
/// the single source of truth for the close race: `close` swaps in the
/// sentinel, so exactly one caller performs the OS close and every
/// operation that loses the race fails with [`Error::Closed`].
#[derive(Debug, Clone)]
pub struct Socket {
  inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
  service: IoService,
  handle: AtomicIsize,
}

impl Drop for Inner {
  fn drop(&mut self) {
    let raw = *self.handle.get_mut();
    if raw != CLOSED {
      let _ = self.service.engine().close(raw as RawSocket);
    }
  }
}

impl Socket {
  pub(crate) fn from_parts(service: IoService, handle: RawSocket) -> Self {
    Self {
      inner: Arc::new(Inner {
        service,
        handle: AtomicIsize::new(handle as isize),
      }),
    }
  }

  pub fn service(&self) -> &IoService {
    &self.inner.service
  }

  /// The raw OS handle, or `None` once closed.
  pub fn native_handle(&self) -> Option<RawSocket> {
    match self.inner.handle.load(Ordering::Acquire) {
      CLOSED => None,
      raw => Some(raw as RawSocket),
    }
  }

  fn handle(&self) -> Result<RawSocket> {
    self.native_handle().ok_or(Error::Closed)
  }

  /// Closes the socket. Idempotent; pending operations complete with
  /// [`Error::Closed`] through their normal callbacks.
  pub fn close(&self) -> Result<()> {
    let raw = self.inner.handle.swap(CLOSED, Ordering::AcqRel);
    if raw == CLOSED {
      return Ok(());
    }
    log::trace!("closing socket handle {raw}");
    self.inner.service.engine().close(raw as RawSocket)
  }

  pub fn bind(&self, addr: Addr) -> Result<()> {
    self.inner.service.engine().bind(self.handle()?, &addr)
  }

  pub fn listen(&self, backlog: i32) -> Result<()> {
    self.inner.service.engine().listen(self.handle()?, backlog)
  }

  pub fn local_addr(&self) -> Result<Addr> {
    self.inner.service.engine().local_addr(self.handle()?)
  }

  pub fn remote_addr(&self) -> Result<Addr> {
    self.inner.service.engine().remote_addr(self.handle()?)
  }

  pub fn set_keepalive(&self, enable: bool) -> Result<()> {
    self.inner.service.engine().set_keepalive(self.handle()?, enable)
  }

  /// Sends the first `len` bytes of `buf`. The completion returns the
  /// buffer and the (possibly shorter) count actually written.
  pub fn send(&self, buf: Vec<u8>, len: usize) -> Task<SendEvent> {
    let completion = TaskCompletion::new();
    let task = completion.task();
    let Some(mut context) = self.prepared(OpKind::Send, &completion) else {
      return task;
    };
    context.requested = len.min(buf.len());
    context.buf = buf;
    if let Err(err) = self.inner.service.engine().send(context) {
      let _ = completion.set_error(err);
    }
    task
  }

  /// Sends a datagram to `addr`.
  pub fn send_to(&self, addr: Addr, buf: Vec<u8>, len: usize) -> Task<SendEvent> {
    let completion = TaskCompletion::new();
    let task = completion.task();
    let Some(mut context) = self.prepared(OpKind::SendTo, &completion) else {
      return task;
    };
    context.addr = Some(addr);
    context.requested = len.min(buf.len());
    context.buf = buf;
    if let Err(err) = self.inner.service.engine().send_to(context) {
      let _ = completion.set_error(err);
    }
    task
  }

  /// Receives up to `buf.len()` bytes. A zero-size completion means the
  /// peer shut down its sending side.
  pub fn recv(&self, buf: Vec<u8>) -> Task<RecvEvent> {
    let completion = TaskCompletion::new();
    let task = completion.task();
    let Some(mut context) = self.recv_context(OpKind::Recv, &completion) else {
      return task;
    };
    context.requested = buf.len();
    context.buf = buf;
    if let Err(err) = self.inner.service.engine().recv(context) {
      let _ = completion.set_error(err);
    }
    task
  }

  /// Receives one datagram; the completion carries the sender's address.
  pub fn recv_from(&self, buf: Vec<u8>) -> Task<RecvEvent> {
    let completion = TaskCompletion::new();
    let task = completion.task();
    let Some(mut context) = self.recv_context(OpKind::RecvFrom, &completion)
    else {
      return task;
    };
    context.requested = buf.len();
    context.buf = buf;
    if let Err(err) = self.inner.service.engine().recv_from(context) {
      let _ = completion.set_error(err);
    }
    task
  }

  /// Accepts one inbound connection on a listening socket.
  pub fn accept(&self) -> Task<ConnectedEvent> {
    let completion = TaskCompletion::new();
    let task = completion.task();
    let fd = match self.handle() {
      Ok(fd) => fd,
      Err(err) => {
        let _ = completion.set_error(err);
        return task;
      }
    };
    let service = self.inner.service.clone();
    let done = completion.clone();
    let context = IoContext::new(
      OpKind::Accept,
      fd,
      Box::new(move |context, result| {
        let result = result.map(|()| {
          let connection = Socket::from_parts(service.clone(), context.peer);
          ConnectedEvent::new(
            connection,
            context.addr.unwrap_or(Addr::UNSPECIFIED),
          )
        });
        deliver(&done, result);
      }),
    );
    if let Err(err) = self.inner.service.engine().accept(context) {
      let _ = completion.set_error(err);
    }
    task
  }

  /// Connects to `addr`. Resolves once the connection is established;
  /// the peer is then available through [`Socket::remote_addr`].
  pub fn connect(&self, addr: Addr) -> Task<()> {
    let completion = TaskCompletion::new();
    let task = completion.task();
    let fd = match self.handle() {
      Ok(fd) => fd,
      Err(err) => {
        let _ = completion.set_error(err);
        return task;
      }
    };
    let done = completion.clone();
    let mut context = IoContext::new(
      OpKind::Connect,
      fd,
      Box::new(move |_context, result| deliver(&done, result)),
    );
    context.addr = Some(addr);
    if let Err(err) = self.inner.service.engine().connect(context) {
      let _ = completion.set_error(err);
    }
    task
  }

  /// Streams an open file over the socket without staging it through a
  /// caller buffer. Completes once, after the whole file was written.
  pub fn send_file(&self, file: RawFile) -> Task<()> {
    let completion = TaskCompletion::new();
    let task = completion.task();
    let fd = match self.handle() {
      Ok(fd) => fd,
      Err(err) => {
        let _ = completion.set_error(err);
        return task;
      }
    };
    let done = completion.clone();
    let mut context = IoContext::new(
      OpKind::SendFile,
      fd,
      Box::new(move |_context, result| deliver(&done, result)),
    );
    context.file = file;
    if let Err(err) = self.inner.service.engine().send_file(context) {
      let _ = completion.set_error(err);
    }
    task
  }

  /// Keeps a receive armed until `token` is cancelled or an error stops
  /// the loop. `on_item` borrows each event; the single buffer is
  /// reclaimed and reused for the next arm after `on_item` returns.
  ///
  /// Each re-arm happens inside the previous completion, so the loop
  /// runs in constant stack depth on the engine's dispatch thread.
  /// Cancellation is cooperative: an in-flight receive still delivers
  /// its event, the loop just stops re-arming afterwards.
  pub fn recv_until<F, E>(
    &self,
    buf: Vec<u8>,
    token: CancelToken,
    on_item: F,
    on_error: E,
  ) where
    F: Fn(&RecvEvent) + Send + Sync + 'static,
    E: FnOnce(Error) + Send + 'static,
  {
    let state = Arc::new(RecvLoop {
      socket: self.clone(),
      token,
      on_item,
      on_error: Mutex::new(Some(Box::new(on_error))),
    });
    RecvLoop::arm(&state, buf);
  }

  /// Keeps an accept armed until `token` is cancelled or an error stops
  /// the loop. Each connection is delivered to `on_item` by value.
  pub fn accept_until<F, E>(&self, token: CancelToken, on_item: F, on_error: E)
  where
    F: Fn(ConnectedEvent) + Send + Sync + 'static,
    E: FnOnce(Error) + Send + 'static,
  {
    let state = Arc::new(AcceptLoop {
      socket: self.clone(),
      token,
      on_item,
      on_error: Mutex::new(Some(Box::new(on_error))),
    });
    AcceptLoop::arm(&state);
  }

  /// Builds a send-direction context whose completion resolves into a
  /// [`SendEvent`]. `None` means the socket is closed and the task is
  /// already resolved with the error.
  fn prepared(
    &self,
    kind: OpKind,
    completion: &TaskCompletion<SendEvent>,
  ) -> Option<IoContext> {
    let fd = match self.handle() {
      Ok(fd) => fd,
      Err(err) => {
        let _ = completion.set_error(err);
        return None;
      }
    };
    let done = completion.clone();
    Some(IoContext::new(
      kind,
      fd,
      Box::new(move |context, result| {
        let result = result
          .map(|()| SendEvent::new(context.transferred, context.take_buf()));
        deliver(&done, result);
      }),
    ))
  }

  fn recv_context(
    &self,
    kind: OpKind,
    completion: &TaskCompletion<RecvEvent>,
  ) -> Option<IoContext> {
    let fd = match self.handle() {
      Ok(fd) => fd,
      Err(err) => {
        let _ = completion.set_error(err);
        return None;
      }
    };
    let done = completion.clone();
    Some(IoContext::new(
      kind,
      fd,
      Box::new(move |context, result| {
        let result = result.map(|()| {
          RecvEvent::new(context.transferred, context.take_buf(), context.addr)
        });
        deliver(&done, result);
      }),
    ))
  }
}

/// Resolves a completion, surfacing (rather than panicking on) the
/// should-be-impossible duplicate delivery.
fn deliver<T: Clone + Send + 'static>(
  completion: &TaskCompletion<T>,
  result: Result<T>,
) {
  if completion.resolve(result).is_err() {
    log::error!("duplicate completion dropped");
  }
}

type ErrorHandler = Mutex<Option<Box<dyn FnOnce(Error) + Send>>>;

struct RecvLoop<F> {
  socket: Socket,
  token: CancelToken,
  on_item: F,
  on_error: ErrorHandler,
}

impl<F> RecvLoop<F>
where
  F: Fn(&RecvEvent) + Send + Sync + 'static,
{
  fn arm(state: &Arc<Self>, buf: Vec<u8>) {
    if state.token.is_cancelled() {
      return;
    }
    let this = Arc::clone(state);
    state.socket.recv(buf).when_done(move |result| match result {
      Ok(mut event) => {
        (this.on_item)(&event);
        if !this.token.is_cancelled() {
          let buf = event.reclaim_buffer();
          Self::arm(&this, buf);
        }
      }
      Err(err) => this.fail(err),
    });
  }

  fn fail(&self, err: Error) {
    if let Some(on_error) = self.on_error.lock().take() {
      on_error(err);
    }
  }
}

struct AcceptLoop<F> {
  socket: Socket,
  token: CancelToken,
  on_item: F,
  on_error: ErrorHandler,
}

impl<F> AcceptLoop<F>
where
  F: Fn(ConnectedEvent) + Send + Sync + 'static,
{
  fn arm(state: &Arc<Self>) {
    if state.token.is_cancelled() {
      return;
    }
    let this = Arc::clone(state);
    state.socket.accept().when_done(move |result| match result {
      Ok(event) => {
        (this.on_item)(event);
        if !this.token.is_cancelled() {
          Self::arm(&this);
        }
      }
      Err(err) => this.fail(err),
    });
  }

  fn fail(&self, err: Error) {
    if let Some(on_error) = self.on_error.lock().take() {
      on_error(err);
    }
  }
}
