//! # sio
//!
//! Continuation-based asynchronous socket I/O on top of the OS's native
//! completion mechanism:
//!
//! | platform | engine |
//! |----------|--------|
//! | Linux / Unix | epoll readiness reactor (one-shot registrations) |
//! | Windows | I/O completion port |
//!
//! Every operation returns a [`Task`] immediately; the result arrives as
//! an event (bytes moved, buffer handed back, peer address, accepted
//! connection) through continuations registered with
//! [`Task::when_done`]. Completions run on the engine's dispatch
//! thread, never on the submitter's stack. Partial transfers are
//! successful completions: the event reports how much actually moved.
//!
//! ## Quick start
//!
//! ```no_run
//! use sio::{Addr, IoService, open_tcp_socket};
//!
//! fn main() -> sio::Result<()> {
//!   let service = IoService::new()?;
//!
//!   let listener = open_tcp_socket(&service)?;
//!   listener.bind(Addr::parse("127.0.0.1", 0)?)?;
//!   listener.listen(128)?;
//!   let addr = listener.local_addr()?;
//!
//!   let client = open_tcp_socket(&service)?;
//!   let server = listener.accept();
//!   client.connect(addr).wait()?;
//!   let server = server.wait()?;
//!
//!   client.send(b"hello".to_vec(), 5).wait()?;
//!   let event = server.connection().recv(vec![0u8; 64]).wait()?;
//!   assert_eq!(event.bytes(), b"hello");
//!   Ok(())
//! }
//! ```
//!
//! For streaming consumption there are self-re-arming loops,
//! [`Socket::recv_until`] and [`Socket::accept_until`], stopped
//! cooperatively through a [`CancelToken`].
//!
//! The engine behind an [`IoService`] is a trait object, so tests (and
//! embedders) can supply their own [`CompletionEngine`].
//!
//! This crate logs through the `log` facade and installs no logger.

#[cfg(unix)]
#[macro_use]
mod macros;

pub mod addr;
pub mod context;
pub mod engine;
mod error;
pub mod event;
pub mod socket;
mod store;
mod sync;
pub mod task;

pub use addr::{Addr, AddrFamily};
pub use context::{IoCallback, IoContext, OpKind};
pub use engine::{
  CompletionEngine, IoService, Protocol, RawFile, RawSocket, SocketType,
};
pub use error::{Error, Result};
pub use event::{ConnectedEvent, RecvEvent, SendEvent};
pub use socket::Socket;
pub use task::{CancelToken, Task, TaskCompletion};

/// Opens a non-blocking socket of the given family, type and protocol,
/// registered with `service`'s engine.
pub fn open_socket(
  service: &IoService,
  family: AddrFamily,
  ty: SocketType,
  protocol: Protocol,
) -> Result<Socket> {
  let handle = service.engine().create_socket(family, ty, protocol)?;
  Ok(Socket::from_parts(service.clone(), handle))
}

/// Opens an IPv4 TCP socket.
pub fn open_tcp_socket(service: &IoService) -> Result<Socket> {
  open_socket(service, AddrFamily::V4, SocketType::Stream, Protocol::Tcp)
}

/// Opens an IPv4 UDP socket.
pub fn open_udp_socket(service: &IoService) -> Result<Socket> {
  open_socket(service, AddrFamily::V4, SocketType::Datagram, Protocol::Udp)
}
