//! Completion engines: the platform-specific half of the crate.
//!
//! A [`CompletionEngine`] turns submitted [`IoContext`]s into exactly one
//! completion callback each, delivered from the engine's own dispatch
//! thread(s). Unix gets a readiness [`reactor`]; Windows gets an I/O
//! completion port. [`IoService`] is the shared handle the socket layer
//! holds, so alternative engines (fakes in tests included) plug in
//! without touching the socket code.

#[cfg(windows)]
pub mod iocp;
#[cfg(unix)]
pub mod reactor;

use std::sync::Arc;

use crate::addr::{Addr, AddrFamily};
use crate::context::IoContext;
use crate::error::Result;

#[cfg(unix)]
pub type RawSocket = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawSocket = usize;

#[cfg(unix)]
pub type RawFile = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawFile = isize;

#[cfg(unix)]
pub(crate) const INVALID_SOCKET: RawSocket = -1;
#[cfg(windows)]
pub(crate) const INVALID_SOCKET: RawSocket = usize::MAX;

#[cfg(unix)]
pub(crate) const INVALID_FILE: RawFile = -1;
#[cfg(windows)]
pub(crate) const INVALID_FILE: RawFile = -1;

/// Second argument to `socket(2)` / `WSASocketW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
  Stream,
  Datagram,
  Raw,
}

/// Third argument to `socket(2)` / `WSASocketW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
  Ip,
  Tcp,
  Udp,
}

impl AddrFamily {
  #[cfg(unix)]
  pub(crate) fn native(self) -> i32 {
    match self {
      AddrFamily::V4 => libc::AF_INET,
      AddrFamily::V6 => libc::AF_INET6,
    }
  }

  #[cfg(windows)]
  pub(crate) fn native(self) -> i32 {
    use windows_sys::Win32::Networking::WinSock;
    match self {
      AddrFamily::V4 => WinSock::AF_INET as i32,
      AddrFamily::V6 => WinSock::AF_INET6 as i32,
    }
  }
}

impl SocketType {
  #[cfg(unix)]
  pub(crate) fn native(self) -> i32 {
    match self {
      SocketType::Stream => libc::SOCK_STREAM,
      SocketType::Datagram => libc::SOCK_DGRAM,
      SocketType::Raw => libc::SOCK_RAW,
    }
  }

  #[cfg(windows)]
  pub(crate) fn native(self) -> i32 {
    use windows_sys::Win32::Networking::WinSock;
    match self {
      SocketType::Stream => WinSock::SOCK_STREAM,
      SocketType::Datagram => WinSock::SOCK_DGRAM,
      SocketType::Raw => WinSock::SOCK_RAW,
    }
  }
}

impl Protocol {
  #[cfg(unix)]
  pub(crate) fn native(self) -> i32 {
    match self {
      Protocol::Ip => 0,
      Protocol::Tcp => libc::IPPROTO_TCP,
      Protocol::Udp => libc::IPPROTO_UDP,
    }
  }

  #[cfg(windows)]
  pub(crate) fn native(self) -> i32 {
    use windows_sys::Win32::Networking::WinSock;
    match self {
      Protocol::Ip => 0,
      Protocol::Tcp => WinSock::IPPROTO_TCP,
      Protocol::Udp => WinSock::IPPROTO_UDP,
    }
  }
}

/// The capability surface a completion engine provides.
///
/// Submission methods (`send` through `send_file`) take the operation's
/// context by value. `Ok(())` means the operation was accepted and its
/// callback will run exactly once, on an engine thread, never on the
/// submitter's stack. `Err(_)` means nothing was submitted and the
/// callback will never run; the caller reports the error synchronously.
pub trait CompletionEngine: Send + Sync {
  /// Creates a non-blocking socket ready for submission to this engine.
  fn create_socket(
    &self,
    family: AddrFamily,
    ty: SocketType,
    protocol: Protocol,
  ) -> Result<RawSocket>;

  fn bind(&self, handle: RawSocket, addr: &Addr) -> Result<()>;

  fn listen(&self, handle: RawSocket, backlog: i32) -> Result<()>;

  fn send(&self, context: IoContext) -> Result<()>;

  fn send_to(&self, context: IoContext) -> Result<()>;

  fn recv(&self, context: IoContext) -> Result<()>;

  fn recv_from(&self, context: IoContext) -> Result<()>;

  fn accept(&self, context: IoContext) -> Result<()>;

  fn connect(&self, context: IoContext) -> Result<()>;

  fn send_file(&self, context: IoContext) -> Result<()>;

  /// Closes the OS handle. Operations still pending on it complete
  /// (with [`Error::Closed`](crate::Error::Closed)) through the normal
  /// callback path.
  fn close(&self, handle: RawSocket) -> Result<()>;

  fn local_addr(&self, handle: RawSocket) -> Result<Addr>;

  fn remote_addr(&self, handle: RawSocket) -> Result<Addr>;

  fn set_keepalive(&self, handle: RawSocket, enable: bool) -> Result<()>;

  /// Number of operations currently in flight, for observability and
  /// tests.
  fn pending_operations(&self) -> usize;
}

/// Shared, cheaply clonable handle to a completion engine.
///
/// All sockets opened from the same service share one engine; two
/// services compare equal when they share the engine instance.
#[derive(Clone)]
pub struct IoService {
  engine: Arc<dyn CompletionEngine>,
}

impl IoService {
  /// Starts the platform engine: the epoll reactor on Unix, the I/O
  /// completion port on Windows.
  pub fn new() -> Result<Self> {
    #[cfg(unix)]
    let engine = reactor::Reactor::new()?;
    #[cfg(windows)]
    let engine = iocp::Iocp::new()?;
    Ok(Self { engine: Arc::new(engine) })
  }

  /// Wraps a caller-provided engine. This is the injection seam used by
  /// tests with instrumented fakes.
  pub fn with_engine(engine: Arc<dyn CompletionEngine>) -> Self {
    Self { engine }
  }

  pub fn engine(&self) -> &dyn CompletionEngine {
    &*self.engine
  }

  pub fn pending_operations(&self) -> usize {
    self.engine.pending_operations()
  }
}

impl PartialEq for IoService {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.engine, &other.engine)
  }
}

impl std::fmt::Debug for IoService {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IoService")
      .field("pending_operations", &self.pending_operations())
      .finish_non_exhaustive()
  }
}
