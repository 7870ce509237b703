//! Readiness-driven completion engine for Unix.
//!
//! Submissions arm a one-shot epoll registration; the actual
//! `recv`/`send`/`accept` syscall runs on the dispatch thread once the
//! kernel reports readiness. `EAGAIN` re-arms, anything else completes
//! the operation. Completions that bypass epoll (inline `connect`
//! success, `close` of a socket with pending work, teardown) are
//! injected through a channel and delivered by the same dispatch thread,
//! so a callback never runs on a submitter's stack.

mod poller;

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::addr::{Addr, AddrFamily};
use crate::context::{IoContext, OpKind};
use crate::engine::{CompletionEngine, Protocol, RawSocket, SocketType};
use crate::error::{Error, Result};
use crate::store::ContextStore;
use crate::sync::Mutex;

use poller::{Interest, NOTIFY_KEY, Poller};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Per-fd pending state: at most one read-direction and one
/// write-direction operation at a time.
#[derive(Default)]
struct FdSlots {
  read: Option<u64>,
  write: Option<u64>,
  registered: bool,
}

struct Inner {
  poller: Poller,
  store: ContextStore,
  /// Guards the fd table. Also serializes the readiness syscall against
  /// `close`, so an fd is never closed (and possibly reused) while the
  /// dispatch thread is mid-attempt on it.
  pending: Mutex<HashMap<RawFd, FdSlots>>,
  injected: Receiver<(u64, Result<()>)>,
  live: AtomicBool,
}

pub struct Reactor {
  inner: Arc<Inner>,
  inject_tx: Sender<(u64, Result<()>)>,
  worker: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
  pub fn new() -> Result<Self> {
    let poller = Poller::new().map_err(Error::resource)?;
    let (inject_tx, injected) = crossbeam_channel::unbounded();
    let inner = Arc::new(Inner {
      poller,
      store: ContextStore::new(),
      pending: Mutex::new(HashMap::new()),
      injected,
      live: AtomicBool::new(true),
    });
    let worker = std::thread::Builder::new()
      .name("sio-reactor".into())
      .spawn({
        let inner = Arc::clone(&inner);
        move || inner.dispatch_loop()
      })
      .map_err(Error::resource)?;
    Ok(Self { inner, inject_tx, worker: Mutex::new(Some(worker)) })
  }

  /// Registers interest for the context's direction. `Ok(id)` means the
  /// callback is now owned by the dispatch thread; on error nothing was
  /// registered and the callback never runs.
  fn arm(&self, context: IoContext) -> Result<u64> {
    let fd = context.fd;
    let kind = context.kind;
    let is_read = kind.is_read();

    let mut pending = self.inner.pending.lock();
    let slots = pending.entry(fd).or_default();
    let occupied = if is_read { slots.read } else { slots.write };
    if occupied.is_some() {
      return Err(Error::ConcurrentOperation);
    }

    let id = self.inner.store.insert(context);
    if is_read {
      slots.read = Some(id);
    } else {
      slots.write = Some(id);
    }
    let interest = Interest {
      readable: slots.read.is_some(),
      writable: slots.write.is_some(),
    };
    let registration = if slots.registered {
      self.inner.poller.modify(fd, fd as u64, interest)
    } else {
      self.inner.poller.add(fd, fd as u64, interest).inspect(|_| {
        slots.registered = true;
      })
    };

    if let Err(err) = registration {
      if is_read {
        slots.read = None;
      } else {
        slots.write = None;
      }
      let abandoned =
        slots.read.is_none() && slots.write.is_none() && !slots.registered;
      if abandoned {
        pending.remove(&fd);
      }
      drop(pending);
      let _ = self.inner.store.take(id);
      log::debug!("arming {kind:?} on fd {fd} failed: {err}");
      // EBADF here means the handle lost a race with close()
      return Err(if err.raw_os_error() == Some(libc::EBADF) {
        Error::Closed
      } else {
        Error::transfer(err)
      });
    }
    log::trace!("armed {kind:?} on fd {fd} as op {id:#x}");
    Ok(id)
  }

  /// Queues an already-finished context so its callback still runs on
  /// the dispatch thread.
  fn inject(&self, context: IoContext, result: Result<()>) -> Result<()> {
    let id = self.inner.store.insert(context);
    // receiver lives in Inner, which this handle keeps alive
    let _ = self.inject_tx.send((id, result));
    self.inner.poller.notify().map_err(Error::transfer)?;
    Ok(())
  }
}

impl Drop for Reactor {
  fn drop(&mut self) {
    self.inner.live.store(false, Ordering::Release);
    let _ = self.inner.poller.notify();
    if let Some(worker) = self.worker.lock().take() {
      let _ = worker.join();
    }
  }
}

impl CompletionEngine for Reactor {
  fn create_socket(
    &self,
    family: AddrFamily,
    ty: SocketType,
    protocol: Protocol,
  ) -> Result<RawSocket> {
    let fd = syscall!(socket(
      family.native(),
      ty.native() | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
      protocol.native(),
    ))
    .map_err(Error::resource)?;
    let enable: libc::c_int = 1;
    if let Err(err) = syscall!(setsockopt(
      fd,
      libc::SOL_SOCKET,
      libc::SO_REUSEADDR,
      &enable as *const _ as *const libc::c_void,
      std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    )) {
      let _ = syscall!(close(fd));
      return Err(Error::resource(err));
    }
    Ok(fd)
  }

  fn bind(&self, handle: RawSocket, addr: &Addr) -> Result<()> {
    let (storage, len) = addr.to_storage();
    syscall!(bind(handle, &storage as *const _ as *const libc::sockaddr, len))
      .map_err(Error::bind)?;
    Ok(())
  }

  fn listen(&self, handle: RawSocket, backlog: i32) -> Result<()> {
    syscall!(listen(handle, backlog)).map_err(Error::listen)?;
    Ok(())
  }

  fn send(&self, context: IoContext) -> Result<()> {
    self.arm(context).map(drop)
  }

  fn send_to(&self, context: IoContext) -> Result<()> {
    self.arm(context).map(drop)
  }

  fn recv(&self, context: IoContext) -> Result<()> {
    self.arm(context).map(drop)
  }

  fn recv_from(&self, context: IoContext) -> Result<()> {
    self.arm(context).map(drop)
  }

  fn accept(&self, context: IoContext) -> Result<()> {
    self.arm(context).map(drop)
  }

  fn connect(&self, context: IoContext) -> Result<()> {
    let Some(addr) = context.addr else {
      return Err(Error::connect(io::Error::new(
        io::ErrorKind::InvalidInput,
        "connect requires a target address",
      )));
    };
    let (storage, len) = addr.to_storage();
    match syscall!(connect(
      context.fd,
      &storage as *const _ as *const libc::sockaddr,
      len,
    )) {
      // connected immediately (loopback, unix-domain): still delivered
      // asynchronously from the dispatch thread
      Ok(_) => self.inject(context, Ok(())),
      Err(err)
        if matches!(
          err.raw_os_error(),
          Some(libc::EINPROGRESS | libc::EAGAIN)
        ) =>
      {
        self.arm(context).map(drop)
      }
      // the handle lost a race with close()
      Err(err) if err.raw_os_error() == Some(libc::EBADF) => {
        Err(Error::Closed)
      }
      Err(err) => Err(Error::connect(err)),
    }
  }

  fn send_file(&self, mut context: IoContext) -> Result<()> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    syscall!(fstat(context.file, &mut stat)).map_err(Error::transfer)?;
    context.requested = stat.st_size as usize;
    context.file_offset = 0;
    if context.requested == 0 {
      return self.inject(context, Ok(()));
    }
    self.arm(context).map(drop)
  }

  fn close(&self, handle: RawSocket) -> Result<()> {
    let (orphaned, closed): (Vec<u64>, io::Result<i32>) = {
      let mut pending = self.inner.pending.lock();
      let orphaned = match pending.remove(&handle) {
        Some(slots) => {
          if slots.registered {
            if let Err(err) = self.inner.poller.delete(handle) {
              log::warn!("deregistering fd {handle} failed: {err}");
            }
          }
          slots.read.into_iter().chain(slots.write).collect()
        }
        None => Vec::new(),
      };
      // closed under the table lock so the dispatch thread is never
      // mid-syscall on this fd
      (orphaned, syscall!(close(handle)))
    };
    if !orphaned.is_empty() {
      log::debug!(
        "fd {handle} closed with {} operation(s) pending",
        orphaned.len()
      );
      for id in orphaned {
        let _ = self.inject_tx.send((id, Err(Error::Closed)));
      }
      self.inner.poller.notify().map_err(Error::transfer)?;
    }
    closed.map_err(Error::transfer)?;
    Ok(())
  }

  fn local_addr(&self, handle: RawSocket) -> Result<Addr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
      handle,
      &mut storage as *mut _ as *mut libc::sockaddr,
      &mut len,
    ))
    .map_err(Error::transfer)?;
    Addr::from_storage(&storage).map_err(Error::transfer)
  }

  fn remote_addr(&self, handle: RawSocket) -> Result<Addr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
      handle,
      &mut storage as *mut _ as *mut libc::sockaddr,
      &mut len,
    ))
    .map_err(Error::transfer)?;
    Addr::from_storage(&storage).map_err(Error::transfer)
  }

  fn set_keepalive(&self, handle: RawSocket, enable: bool) -> Result<()> {
    let value: libc::c_int = enable.into();
    syscall!(setsockopt(
      handle,
      libc::SOL_SOCKET,
      libc::SO_KEEPALIVE,
      &value as *const _ as *const libc::c_void,
      std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map_err(Error::transfer)?;
    Ok(())
  }

  fn pending_operations(&self) -> usize {
    self.inner.store.len()
  }
}

impl Inner {
  fn dispatch_loop(&self) {
    let mut events =
      vec![unsafe { std::mem::zeroed::<libc::epoll_event>() }; 256];
    while self.live.load(Ordering::Acquire) {
      let count = match self.poller.wait(&mut events, None) {
        Ok(count) => count,
        Err(err) => {
          log::error!("poller wait failed, dispatch stopping: {err}");
          break;
        }
      };
      self.drain_injected();
      for event in &events[..count] {
        if event.u64 == NOTIFY_KEY {
          self.poller.drain_notifications();
          continue;
        }
        let fd = event.u64 as RawFd;
        let flags = event.events;
        let broken =
          flags & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0;
        // error/hangup wakes both directions; the syscall attempt
        // surfaces the concrete error
        if broken || flags & libc::EPOLLIN as u32 != 0 {
          self.service_slot(fd, true);
        }
        if broken || flags & libc::EPOLLOUT as u32 != 0 {
          self.service_slot(fd, false);
        }
      }
    }
    self.drain_injected();
    // engine teardown: every leftover operation still gets its callback
    for context in self.store.drain() {
      context.complete(Err(Error::Closed));
    }
  }

  fn drain_injected(&self) {
    while let Ok((id, result)) = self.injected.try_recv() {
      // take() makes delivery at-most-once even if an id raced here
      if let Some(context) = self.store.take(id) {
        context.complete(result);
      }
    }
  }

  /// Runs the ready syscall for one direction of `fd`, then re-arms or
  /// finalizes. The callback itself runs after the table lock is
  /// released, since continuations may submit follow-up operations.
  fn service_slot(&self, fd: RawFd, read_side: bool) {
    let mut finished: Option<(u64, Result<()>)> = None;
    {
      let mut pending = self.pending.lock();
      let Some(slots) = pending.get_mut(&fd) else {
        // raced with close; the injected path owns delivery
        return;
      };
      let armed = if read_side { slots.read } else { slots.write };
      if let Some(id) = armed {
        match self.store.with_mut(id, |context| attempt(context)) {
          // context already taken elsewhere; free the slot
          None => {
            if read_side {
              slots.read = None;
            } else {
              slots.write = None;
            }
          }
          // spurious or short readiness: stay armed
          Some(Attempt::WouldBlock) => {}
          Some(Attempt::Done(result)) => {
            if read_side {
              slots.read = None;
            } else {
              slots.write = None;
            }
            finished = Some((id, result));
          }
        }
      }
      // the one-shot registration is spent; re-arm what remains
      let interest = Interest {
        readable: slots.read.is_some(),
        writable: slots.write.is_some(),
      };
      if interest.is_empty() {
        if slots.registered {
          if let Err(err) = self.poller.delete(fd) {
            log::warn!("deregistering idle fd {fd} failed: {err}");
          }
        }
        pending.remove(&fd);
      } else if let Err(err) = self.poller.modify(fd, fd as u64, interest) {
        log::warn!("re-arming fd {fd} failed: {err}");
      }
    }
    if let Some((id, result)) = finished {
      if let Some(context) = self.store.take(id) {
        context.complete(result);
      }
    }
  }
}

enum Attempt {
  WouldBlock,
  Done(Result<()>),
}

/// One non-blocking attempt at the context's operation, now that the
/// kernel reported readiness.
fn attempt(context: &mut IoContext) -> Attempt {
  let outcome = match context.kind {
    OpKind::Recv => attempt_recv(context),
    OpKind::RecvFrom => attempt_recv_from(context),
    OpKind::Send => attempt_send(context),
    OpKind::SendTo => attempt_send_to(context),
    OpKind::Accept => attempt_accept(context),
    OpKind::Connect => attempt_connect(context),
    OpKind::SendFile => attempt_send_file(context),
  };
  match outcome {
    Ok(()) => Attempt::Done(Ok(())),
    Err(err) if err.kind() == io::ErrorKind::WouldBlock => Attempt::WouldBlock,
    Err(err) if context.kind == OpKind::Connect => {
      Attempt::Done(Err(Error::connect(err)))
    }
    Err(err) => Attempt::Done(Err(Error::transfer(err))),
  }
}

fn attempt_recv(context: &mut IoContext) -> io::Result<()> {
  let received = syscall!(recv(
    context.fd,
    context.buf.as_mut_ptr() as *mut libc::c_void,
    context.requested.min(context.buf.len()),
    0,
  ))?;
  // zero is a successful completion: the peer shut down its send side
  context.transferred = received as usize;
  Ok(())
}

fn attempt_recv_from(context: &mut IoContext) -> io::Result<()> {
  let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
  let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
  let received = syscall!(recvfrom(
    context.fd,
    context.buf.as_mut_ptr() as *mut libc::c_void,
    context.requested.min(context.buf.len()),
    0,
    &mut storage as *mut _ as *mut libc::sockaddr,
    &mut len,
  ))?;
  context.transferred = received as usize;
  context.addr = Addr::from_storage(&storage).ok();
  Ok(())
}

fn attempt_send(context: &mut IoContext) -> io::Result<()> {
  let sent = syscall!(send(
    context.fd,
    context.buf.as_ptr() as *const libc::c_void,
    context.requested.min(context.buf.len()),
    SEND_FLAGS,
  ))?;
  // short writes are successful completions, never retried internally
  context.transferred = sent as usize;
  Ok(())
}

fn attempt_send_to(context: &mut IoContext) -> io::Result<()> {
  let addr = context.addr.ok_or_else(|| {
    io::Error::new(io::ErrorKind::InvalidInput, "send_to requires an address")
  })?;
  let (storage, len) = addr.to_storage();
  let sent = syscall!(sendto(
    context.fd,
    context.buf.as_ptr() as *const libc::c_void,
    context.requested.min(context.buf.len()),
    SEND_FLAGS,
    &storage as *const _ as *const libc::sockaddr,
    len,
  ))?;
  context.transferred = sent as usize;
  Ok(())
}

fn attempt_accept(context: &mut IoContext) -> io::Result<()> {
  let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
  let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
  let peer = accept_nonblocking(context.fd, &mut storage, &mut len)?;
  context.peer = peer;
  context.addr = Addr::from_storage(&storage).ok();
  Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn accept_nonblocking(
  fd: RawFd,
  storage: &mut libc::sockaddr_storage,
  len: &mut libc::socklen_t,
) -> io::Result<RawFd> {
  syscall!(accept4(
    fd,
    storage as *mut _ as *mut libc::sockaddr,
    len,
    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
  ))
}

#[cfg(not(any(
  target_os = "linux",
  target_os = "android",
  target_os = "freebsd"
)))]
fn accept_nonblocking(
  fd: RawFd,
  storage: &mut libc::sockaddr_storage,
  len: &mut libc::socklen_t,
) -> io::Result<RawFd> {
  let peer =
    syscall!(accept(fd, storage as *mut _ as *mut libc::sockaddr, len))?;
  let configure = || -> io::Result<()> {
    let flags = syscall!(fcntl(peer, libc::F_GETFL))?;
    syscall!(fcntl(peer, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    syscall!(fcntl(peer, libc::F_SETFD, libc::FD_CLOEXEC))?;
    Ok(())
  };
  if let Err(err) = configure() {
    let _ = syscall!(close(peer));
    return Err(err);
  }
  Ok(peer)
}

fn attempt_connect(context: &mut IoContext) -> io::Result<()> {
  // writability after EINPROGRESS; the verdict lives in SO_ERROR
  let mut so_error: libc::c_int = 0;
  let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
  syscall!(getsockopt(
    context.fd,
    libc::SOL_SOCKET,
    libc::SO_ERROR,
    &mut so_error as *mut _ as *mut libc::c_void,
    &mut len,
  ))?;
  if so_error == 0 {
    Ok(())
  } else {
    Err(io::Error::from_raw_os_error(so_error))
  }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn attempt_send_file(context: &mut IoContext) -> io::Result<()> {
  let remaining = context.requested as i64 - context.file_offset;
  let mut offset: libc::off_t = context.file_offset;
  let sent = syscall!(sendfile(
    context.fd,
    context.file,
    &mut offset,
    remaining.max(0) as usize,
  ))?;
  context.file_offset = offset;
  context.transferred = offset as usize;
  if sent == 0 || context.file_offset >= context.requested as i64 {
    // done (or the file shrank under us); deliver what was streamed
    Ok(())
  } else {
    // more to stream: report not-ready so the registration re-arms
    Err(io::ErrorKind::WouldBlock.into())
  }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn attempt_send_file(context: &mut IoContext) -> io::Result<()> {
  // no portable zero-copy path: stage through a small buffer
  let mut chunk = [0u8; 16 * 1024];
  let remaining =
    (context.requested as i64 - context.file_offset).max(0) as usize;
  let read = syscall!(pread(
    context.file,
    chunk.as_mut_ptr() as *mut libc::c_void,
    chunk.len().min(remaining),
    context.file_offset,
  ))? as usize;
  if read == 0 {
    return Ok(());
  }
  let sent = syscall!(send(
    context.fd,
    chunk.as_ptr() as *const libc::c_void,
    read,
    SEND_FLAGS,
  ))? as usize;
  context.file_offset += sent as i64;
  context.transferred = context.file_offset as usize;
  if context.file_offset >= context.requested as i64 {
    Ok(())
  } else {
    Err(io::ErrorKind::WouldBlock.into())
  }
}
