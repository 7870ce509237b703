//! I/O completion port engine for Windows.
//!
//! Operations are submitted as overlapped WSA calls; a small worker pool
//! blocks on `GetQueuedCompletionStatus` and delivers completions. Each
//! submission carries a heap `OverlappedRecord` whose first field is the
//! `OVERLAPPED` the OS writes through; the record also holds the
//! correlation id and any scratch memory (peer address storage, AcceptEx
//! address buffer) that must outlive the call. `closesocket` makes the
//! OS fail every pending operation with `ERROR_OPERATION_ABORTED`, which
//! the workers translate to [`Error::Closed`].

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use windows_sys::Win32::Foundation::{
  CloseHandle, ERROR_OPERATION_ABORTED, GetLastError, HANDLE,
  INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Networking::WinSock::{
  self as ws, LPFN_ACCEPTEX, LPFN_CONNECTEX, SOCKADDR, SOCKADDR_IN,
  SOCKADDR_IN6, SOCKADDR_STORAGE, SOCKET, WSABUF,
};
use windows_sys::Win32::System::IO::{
  CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
  PostQueuedCompletionStatus,
};

use crate::addr::{Addr, AddrFamily};
use crate::context::{IoContext, OpKind};
use crate::engine::{CompletionEngine, Protocol, RawSocket, SocketType};
use crate::error::{Error, Result};
use crate::store::ContextStore;
use crate::sync::Mutex;

const WORKERS: usize = 2;
/// Completion key reserved for shutdown wakeups.
const SHUTDOWN_KEY: usize = usize::MAX;
/// AcceptEx wants room for two addresses plus 16 bytes of slack each.
const ACCEPT_ADDR_SPACE: usize =
  2 * (std::mem::size_of::<SOCKADDR_STORAGE>() + 16);

/// Overlapped submission record. The `OVERLAPPED` must stay the first
/// field so the pointer handed back by the port is also a record
/// pointer.
#[repr(C)]
struct OverlappedRecord {
  overlapped: OVERLAPPED,
  id: u64,
  wsabuf: WSABUF,
  from: SOCKADDR_STORAGE,
  from_len: i32,
  accept_buf: [u8; ACCEPT_ADDR_SPACE],
}

impl OverlappedRecord {
  fn new(id: u64) -> Box<Self> {
    let mut record: Box<Self> = unsafe { Box::new(std::mem::zeroed()) };
    record.id = id;
    record.from_len = std::mem::size_of::<SOCKADDR_STORAGE>() as i32;
    record
  }
}

#[derive(Default)]
struct DirSlots {
  read: Option<u64>,
  write: Option<u64>,
}

struct Inner {
  /// The completion port handle, stored raw so the struct stays Send.
  port: usize,
  store: ContextStore,
  pending: Mutex<HashMap<SOCKET, DirSlots>>,
  live: AtomicBool,
}

pub struct Iocp {
  inner: Arc<Inner>,
  acceptex: LPFN_ACCEPTEX,
  connectex: LPFN_CONNECTEX,
  workers: Mutex<Vec<JoinHandle<()>>>,
}

// SAFETY: the port handle is only used through thread-safe OS calls and
// the extension pointers are immutable after construction.
unsafe impl Send for Iocp {}
unsafe impl Sync for Iocp {}

impl Iocp {
  pub fn new() -> Result<Self> {
    let mut wsa_data: ws::WSADATA = unsafe { std::mem::zeroed() };
    let startup = unsafe { ws::WSAStartup(0x0202, &mut wsa_data) };
    if startup != 0 {
      return Err(Error::resource(io::Error::from_raw_os_error(startup)));
    }

    let port = unsafe {
      CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 0)
    };
    if port.is_null() {
      let err = last_error();
      unsafe { ws::WSACleanup() };
      return Err(Error::resource(err));
    }

    let (acceptex, connectex) = match load_extensions() {
      Ok(pair) => pair,
      Err(err) => {
        unsafe {
          CloseHandle(port);
          ws::WSACleanup();
        }
        return Err(Error::resource(err));
      }
    };

    let inner = Arc::new(Inner {
      port: port as usize,
      store: ContextStore::new(),
      pending: Mutex::new(HashMap::new()),
      live: AtomicBool::new(true),
    });
    let mut workers = Vec::with_capacity(WORKERS);
    for n in 0..WORKERS {
      let inner = Arc::clone(&inner);
      let worker = std::thread::Builder::new()
        .name(format!("sio-iocp-{n}"))
        .spawn(move || inner.dispatch_loop())
        .map_err(Error::resource)?;
      workers.push(worker);
    }
    Ok(Self { inner, acceptex, connectex, workers: Mutex::new(workers) })
  }

  /// Registers the context and enforces the one-op-per-direction rule.
  fn claim(&self, context: IoContext) -> Result<(u64, SOCKET, OpKind)> {
    let socket = context.fd as SOCKET;
    let kind = context.kind;
    let mut pending = self.inner.pending.lock();
    let slots = pending.entry(socket).or_default();
    let slot = if kind.is_read() { &mut slots.read } else { &mut slots.write };
    if slot.is_some() {
      return Err(Error::ConcurrentOperation);
    }
    let id = self.inner.store.insert(context);
    *slot = Some(id);
    Ok((id, socket, kind))
  }

  /// Rolls a failed submission back; the callback never runs.
  fn abandon(&self, id: u64, socket: SOCKET, kind: OpKind) {
    self.inner.release_slot(socket, kind, id);
    let _ = self.inner.store.take(id);
  }
}

impl Drop for Iocp {
  fn drop(&mut self) {
    self.inner.live.store(false, Ordering::Release);
    for _ in 0..WORKERS {
      unsafe {
        PostQueuedCompletionStatus(
          self.inner.port as HANDLE,
          0,
          SHUTDOWN_KEY,
          std::ptr::null(),
        );
      }
    }
    for worker in self.workers.lock().drain(..) {
      let _ = worker.join();
    }
    // every socket referencing this engine is gone, so each pending
    // operation has already posted its abort packet; reclaim the records
    // the workers did not consume before shutting down
    loop {
      let mut transferred: u32 = 0;
      let mut key: usize = 0;
      let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
      unsafe {
        GetQueuedCompletionStatus(
          self.inner.port as HANDLE,
          &mut transferred,
          &mut key,
          &mut overlapped,
          0,
        );
      }
      if !overlapped.is_null() {
        drop(unsafe { Box::from_raw(overlapped as *mut OverlappedRecord) });
        continue;
      }
      if key == SHUTDOWN_KEY {
        // a worker that left on the liveness flag did not eat its packet
        continue;
      }
      break;
    }
    // leftovers still get their callbacks
    for context in self.inner.store.drain() {
      context.complete(Err(Error::Closed));
    }
    unsafe {
      CloseHandle(self.inner.port as HANDLE);
      ws::WSACleanup();
    }
  }
}

impl Inner {
  fn release_slot(&self, socket: SOCKET, kind: OpKind, id: u64) {
    let mut pending = self.pending.lock();
    if let Some(slots) = pending.get_mut(&socket) {
      let slot = if kind.is_read() { &mut slots.read } else { &mut slots.write };
      if *slot == Some(id) {
        *slot = None;
      }
      if slots.read.is_none() && slots.write.is_none() {
        pending.remove(&socket);
      }
    }
  }

  fn dispatch_loop(&self) {
    loop {
      let mut transferred: u32 = 0;
      let mut key: usize = 0;
      let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
      let ok = unsafe {
        GetQueuedCompletionStatus(
          self.port as HANDLE,
          &mut transferred,
          &mut key,
          &mut overlapped,
          u32::MAX,
        )
      };
      if key == SHUTDOWN_KEY {
        break;
      }
      if overlapped.is_null() {
        if !self.live.load(Ordering::Acquire) {
          break;
        }
        continue;
      }
      // reclaim the record regardless of outcome
      let record =
        unsafe { Box::from_raw(overlapped as *mut OverlappedRecord) };
      let failure = if ok == 0 { Some(last_error()) } else { None };
      let Some(mut context) = self.store.take(record.id) else {
        continue;
      };
      self.release_slot(context.fd as SOCKET, context.kind, record.id);
      match failure {
        Some(err) => {
          // a failed accept leaves the pre-created socket unused
          if context.kind == OpKind::Accept
            && context.peer as SOCKET != ws::INVALID_SOCKET
          {
            unsafe { ws::closesocket(context.peer as SOCKET) };
          }
          let err = if err.raw_os_error()
            == Some(ERROR_OPERATION_ABORTED as i32)
          {
            Error::Closed
          } else if context.kind == OpKind::Connect {
            Error::connect(err)
          } else {
            Error::transfer(err)
          };
          context.complete(Err(err));
        }
        None => {
          context.transferred = transferred as usize;
          let settled = settle(&mut context, &record);
          context.complete(settled);
        }
      }
    }
  }
}

/// Post-processes a successful completion per operation kind.
fn settle(context: &mut IoContext, record: &OverlappedRecord) -> Result<()> {
  match context.kind {
    OpKind::RecvFrom => {
      context.addr = addr_from_storage(&record.from).ok();
      Ok(())
    }
    OpKind::Accept => {
      // inherit listener state so getpeername works on the new socket
      let listener = context.fd as SOCKET;
      let accepted = context.peer as SOCKET;
      set_update_context(accepted, ws::SO_UPDATE_ACCEPT_CONTEXT, listener)
        .map_err(Error::transfer)?;
      context.addr = peer_addr(accepted).ok();
      Ok(())
    }
    OpKind::Connect => {
      let socket = context.fd as SOCKET;
      set_update_context(socket, ws::SO_UPDATE_CONNECT_CONTEXT, 0)
        .map_err(Error::connect)?;
      Ok(())
    }
    OpKind::SendFile => {
      context.file_offset = context.transferred as i64;
      Ok(())
    }
    OpKind::Send | OpKind::SendTo | OpKind::Recv => Ok(()),
  }
}

impl CompletionEngine for Iocp {
  fn create_socket(
    &self,
    family: AddrFamily,
    ty: SocketType,
    protocol: Protocol,
  ) -> Result<RawSocket> {
    let socket = unsafe {
      ws::WSASocketW(
        family.native(),
        ty.native(),
        protocol.native(),
        std::ptr::null(),
        0,
        ws::WSA_FLAG_OVERLAPPED,
      )
    };
    if socket == ws::INVALID_SOCKET {
      return Err(Error::resource(wsa_error()));
    }
    let associated = unsafe {
      CreateIoCompletionPort(
        socket as HANDLE,
        self.inner.port as HANDLE,
        0,
        0,
      )
    };
    if associated.is_null() {
      let err = last_error();
      unsafe { ws::closesocket(socket) };
      return Err(Error::resource(err));
    }
    Ok(socket as RawSocket)
  }

  fn bind(&self, handle: RawSocket, addr: &Addr) -> Result<()> {
    let (storage, len) = addr_to_storage(*addr);
    let rc = unsafe {
      ws::bind(handle as SOCKET, &storage as *const _ as *const SOCKADDR, len)
    };
    if rc == ws::SOCKET_ERROR {
      return Err(Error::bind(wsa_error()));
    }
    Ok(())
  }

  fn listen(&self, handle: RawSocket, backlog: i32) -> Result<()> {
    let rc = unsafe { ws::listen(handle as SOCKET, backlog) };
    if rc == ws::SOCKET_ERROR {
      return Err(Error::listen(wsa_error()));
    }
    Ok(())
  }

  fn send(&self, context: IoContext) -> Result<()> {
    let (id, socket, kind) = self.claim(context)?;
    let mut record = OverlappedRecord::new(id);
    let Some(rc) = self.inner.store.with_mut(id, |context| {
      record.wsabuf = WSABUF {
        len: context.requested.min(context.buf.len()) as u32,
        buf: context.buf.as_mut_ptr(),
      };
      unsafe {
        ws::WSASend(
          socket,
          &record.wsabuf,
          1,
          std::ptr::null_mut(),
          0,
          &mut record.overlapped,
          None,
        )
      }
    }) else {
      self.abandon(id, socket, kind);
      return Err(Error::Closed);
    };
    self.finish_submit(rc, record, id, socket, kind)
  }

  fn send_to(&self, context: IoContext) -> Result<()> {
    let Some(addr) = context.addr else {
      return Err(Error::transfer(io::Error::new(
        io::ErrorKind::InvalidInput,
        "send_to requires an address",
      )));
    };
    let (id, socket, kind) = self.claim(context)?;
    let mut record = OverlappedRecord::new(id);
    let (storage, storage_len) = addr_to_storage(addr);
    record.from = storage;
    record.from_len = storage_len;
    let Some(rc) = self.inner.store.with_mut(id, |context| {
      record.wsabuf = WSABUF {
        len: context.requested.min(context.buf.len()) as u32,
        buf: context.buf.as_mut_ptr(),
      };
      unsafe {
        ws::WSASendTo(
          socket,
          &record.wsabuf,
          1,
          std::ptr::null_mut(),
          0,
          &record.from as *const _ as *const SOCKADDR,
          record.from_len,
          &mut record.overlapped,
          None,
        )
      }
    }) else {
      self.abandon(id, socket, kind);
      return Err(Error::Closed);
    };
    self.finish_submit(rc, record, id, socket, kind)
  }

  fn recv(&self, context: IoContext) -> Result<()> {
    let (id, socket, kind) = self.claim(context)?;
    let mut record = OverlappedRecord::new(id);
    let mut flags: u32 = 0;
    let Some(rc) = self.inner.store.with_mut(id, |context| {
      record.wsabuf = WSABUF {
        len: context.requested.min(context.buf.len()) as u32,
        buf: context.buf.as_mut_ptr(),
      };
      unsafe {
        ws::WSARecv(
          socket,
          &mut record.wsabuf,
          1,
          std::ptr::null_mut(),
          &mut flags,
          &mut record.overlapped,
          None,
        )
      }
    }) else {
      self.abandon(id, socket, kind);
      return Err(Error::Closed);
    };
    self.finish_submit(rc, record, id, socket, kind)
  }

  fn recv_from(&self, context: IoContext) -> Result<()> {
    let (id, socket, kind) = self.claim(context)?;
    let mut record = OverlappedRecord::new(id);
    let mut flags: u32 = 0;
    let Some(rc) = self.inner.store.with_mut(id, |context| {
      record.wsabuf = WSABUF {
        len: context.requested.min(context.buf.len()) as u32,
        buf: context.buf.as_mut_ptr(),
      };
      unsafe {
        ws::WSARecvFrom(
          socket,
          &mut record.wsabuf,
          1,
          std::ptr::null_mut(),
          &mut flags,
          &mut record.from as *mut _ as *mut SOCKADDR,
          &mut record.from_len,
          &mut record.overlapped,
          None,
        )
      }
    }) else {
      self.abandon(id, socket, kind);
      return Err(Error::Closed);
    };
    self.finish_submit(rc, record, id, socket, kind)
  }

  fn accept(&self, mut context: IoContext) -> Result<()> {
    let Some(acceptex) = self.acceptex else {
      return Err(Error::transfer(io::Error::new(
        io::ErrorKind::Unsupported,
        "AcceptEx unavailable",
      )));
    };
    // the accepted socket must exist before the overlapped call and
    // match the listener's family, or AcceptEx rejects it
    let family =
      socket_family(context.fd as SOCKET).map_err(Error::transfer)?;
    let accepted =
      self.create_socket(family, SocketType::Stream, Protocol::Tcp)?;
    context.peer = accepted;
    let (id, socket, kind) = match self.claim(context) {
      Ok(claimed) => claimed,
      Err(err) => {
        unsafe { ws::closesocket(accepted as SOCKET) };
        return Err(err);
      }
    };
    let mut record = OverlappedRecord::new(id);
    let mut received: u32 = 0;
    let addr_space = (std::mem::size_of::<SOCKADDR_STORAGE>() + 16) as u32;
    let ok = unsafe {
      acceptex(
        socket,
        accepted as SOCKET,
        record.accept_buf.as_mut_ptr() as *mut _,
        0,
        addr_space,
        addr_space,
        &mut received,
        &mut record.overlapped,
      )
    };
    let submit = if ok != 0 { 0 } else { ws::SOCKET_ERROR };
    match self.finish_submit(submit, record, id, socket, kind) {
      Ok(()) => Ok(()),
      Err(err) => {
        unsafe { ws::closesocket(accepted as SOCKET) };
        Err(err)
      }
    }
  }

  fn connect(&self, context: IoContext) -> Result<()> {
    let Some(connectex) = self.connectex else {
      return Err(Error::connect(io::Error::new(
        io::ErrorKind::Unsupported,
        "ConnectEx unavailable",
      )));
    };
    let Some(addr) = context.addr else {
      return Err(Error::connect(io::Error::new(
        io::ErrorKind::InvalidInput,
        "connect requires a target address",
      )));
    };
    // ConnectEx needs a bound socket; bind the wildcard of the target's
    // family (an extra bind on an already-bound socket fails harmlessly)
    let local = match addr.family() {
      AddrFamily::V4 => Addr::UNSPECIFIED,
      AddrFamily::V6 => Addr::UNSPECIFIED_V6,
    };
    let (local_storage, local_len) = addr_to_storage(local);
    unsafe {
      ws::bind(
        context.fd as SOCKET,
        &local_storage as *const _ as *const SOCKADDR,
        local_len,
      );
    }
    let (id, socket, kind) = self.claim(context)?;
    let mut record = OverlappedRecord::new(id);
    let (storage, len) = addr_to_storage(addr);
    record.from = storage;
    record.from_len = len;
    let ok = unsafe {
      connectex(
        socket,
        &record.from as *const _ as *const SOCKADDR,
        record.from_len,
        std::ptr::null(),
        0,
        std::ptr::null_mut(),
        &mut record.overlapped,
      )
    };
    let submit = if ok != 0 { 0 } else { ws::SOCKET_ERROR };
    self.finish_submit(submit, record, id, socket, kind)
  }

  fn send_file(&self, context: IoContext) -> Result<()> {
    let (id, socket, kind) = self.claim(context)?;
    let mut record = OverlappedRecord::new(id);
    let Some(file) = self.inner.store.with_mut(id, |context| context.file)
    else {
      self.abandon(id, socket, kind);
      return Err(Error::Closed);
    };
    let ok = unsafe {
      ws::TransmitFile(
        socket,
        file as HANDLE,
        0,
        0,
        &mut record.overlapped,
        std::ptr::null(),
        0,
      )
    };
    let submit = if ok != 0 { 0 } else { ws::SOCKET_ERROR };
    self.finish_submit(submit, record, id, socket, kind)
  }

  fn close(&self, handle: RawSocket) -> Result<()> {
    // pending overlapped ops complete with ERROR_OPERATION_ABORTED and
    // are translated to Closed by the workers
    let rc = unsafe { ws::closesocket(handle as SOCKET) };
    if rc == ws::SOCKET_ERROR {
      return Err(Error::transfer(wsa_error()));
    }
    Ok(())
  }

  fn local_addr(&self, handle: RawSocket) -> Result<Addr> {
    let mut storage: SOCKADDR_STORAGE = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<SOCKADDR_STORAGE>() as i32;
    let rc = unsafe {
      ws::getsockname(
        handle as SOCKET,
        &mut storage as *mut _ as *mut SOCKADDR,
        &mut len,
      )
    };
    if rc == ws::SOCKET_ERROR {
      return Err(Error::transfer(wsa_error()));
    }
    addr_from_storage(&storage).map_err(Error::transfer)
  }

  fn remote_addr(&self, handle: RawSocket) -> Result<Addr> {
    peer_addr(handle as SOCKET).map_err(Error::transfer)
  }

  fn set_keepalive(&self, handle: RawSocket, enable: bool) -> Result<()> {
    let value: u32 = enable.into();
    let rc = unsafe {
      ws::setsockopt(
        handle as SOCKET,
        ws::SOL_SOCKET,
        ws::SO_KEEPALIVE,
        &value as *const _ as *const u8,
        std::mem::size_of::<u32>() as i32,
      )
    };
    if rc == ws::SOCKET_ERROR {
      return Err(Error::transfer(wsa_error()));
    }
    Ok(())
  }

  fn pending_operations(&self) -> usize {
    self.inner.store.len()
  }
}

impl Iocp {
  /// Shared tail of every overlapped submission: immediate success and
  /// `WSA_IO_PENDING` both mean the port will post the completion, so
  /// the record is leaked to the OS; any other error is an initiation
  /// failure and everything is rolled back.
  fn finish_submit(
    &self,
    rc: i32,
    record: Box<OverlappedRecord>,
    id: u64,
    socket: SOCKET,
    kind: OpKind,
  ) -> Result<()> {
    let pending =
      rc == ws::SOCKET_ERROR && unsafe { ws::WSAGetLastError() } == ws::WSA_IO_PENDING;
    if rc != ws::SOCKET_ERROR || pending {
      // ownership passes to the OS until the port hands it back
      let _ = Box::into_raw(record);
      return Ok(());
    }
    let err = wsa_error();
    self.abandon(id, socket, kind);
    if kind == OpKind::Connect {
      Err(Error::connect(err))
    } else {
      Err(Error::transfer(err))
    }
  }
}

fn last_error() -> io::Error {
  io::Error::from_raw_os_error(unsafe { GetLastError() } as i32)
}

fn wsa_error() -> io::Error {
  io::Error::from_raw_os_error(unsafe { ws::WSAGetLastError() })
}

fn set_update_context(
  socket: SOCKET,
  option: i32,
  value: SOCKET,
) -> io::Result<()> {
  let rc = unsafe {
    ws::setsockopt(
      socket,
      ws::SOL_SOCKET,
      option,
      &value as *const _ as *const u8,
      std::mem::size_of::<SOCKET>() as i32,
    )
  };
  if rc == ws::SOCKET_ERROR {
    return Err(wsa_error());
  }
  Ok(())
}

fn socket_family(socket: SOCKET) -> io::Result<AddrFamily> {
  let mut storage: SOCKADDR_STORAGE = unsafe { std::mem::zeroed() };
  let mut len = std::mem::size_of::<SOCKADDR_STORAGE>() as i32;
  let rc = unsafe {
    ws::getsockname(socket, &mut storage as *mut _ as *mut SOCKADDR, &mut len)
  };
  if rc == ws::SOCKET_ERROR {
    return Err(wsa_error());
  }
  match storage.ss_family {
    ws::AF_INET => Ok(AddrFamily::V4),
    ws::AF_INET6 => Ok(AddrFamily::V6),
    other => Err(io::Error::new(
      io::ErrorKind::InvalidInput,
      format!("unsupported address family: {other}"),
    )),
  }
}

fn peer_addr(socket: SOCKET) -> io::Result<Addr> {
  let mut storage: SOCKADDR_STORAGE = unsafe { std::mem::zeroed() };
  let mut len = std::mem::size_of::<SOCKADDR_STORAGE>() as i32;
  let rc = unsafe {
    ws::getpeername(socket, &mut storage as *mut _ as *mut SOCKADDR, &mut len)
  };
  if rc == ws::SOCKET_ERROR {
    return Err(wsa_error());
  }
  addr_from_storage(&storage)
}

/// Loads the AcceptEx/ConnectEx extension pointers through a throwaway
/// socket.
fn load_extensions() -> io::Result<(LPFN_ACCEPTEX, LPFN_CONNECTEX)> {
  let probe = unsafe {
    ws::WSASocketW(
      ws::AF_INET as i32,
      ws::SOCK_STREAM,
      ws::IPPROTO_TCP,
      std::ptr::null(),
      0,
      ws::WSA_FLAG_OVERLAPPED,
    )
  };
  if probe == ws::INVALID_SOCKET {
    return Err(wsa_error());
  }
  let load = |guid: windows_sys::core::GUID| -> io::Result<usize> {
    let mut pointer: usize = 0;
    let mut returned: u32 = 0;
    let rc = unsafe {
      ws::WSAIoctl(
        probe,
        ws::SIO_GET_EXTENSION_FUNCTION_POINTER,
        &guid as *const _ as *const _,
        std::mem::size_of_val(&guid) as u32,
        &mut pointer as *mut _ as *mut _,
        std::mem::size_of::<usize>() as u32,
        &mut returned,
        std::ptr::null_mut(),
        None,
      )
    };
    if rc == ws::SOCKET_ERROR {
      return Err(wsa_error());
    }
    Ok(pointer)
  };
  let result = (|| {
    let acceptex = load(ws::WSAID_ACCEPTEX)?;
    let connectex = load(ws::WSAID_CONNECTEX)?;
    Ok((
      unsafe { std::mem::transmute::<usize, LPFN_ACCEPTEX>(acceptex) },
      unsafe { std::mem::transmute::<usize, LPFN_CONNECTEX>(connectex) },
    ))
  })();
  unsafe { ws::closesocket(probe) };
  result
}

fn addr_to_storage(addr: Addr) -> (SOCKADDR_STORAGE, i32) {
  let mut storage: SOCKADDR_STORAGE = unsafe { std::mem::zeroed() };
  match addr.socket_addr() {
    std::net::SocketAddr::V4(v4) => {
      let sin = SOCKADDR_IN {
        sin_family: ws::AF_INET,
        sin_port: v4.port().to_be(),
        sin_addr: ws::IN_ADDR {
          S_un: ws::IN_ADDR_0 {
            S_addr: u32::from_ne_bytes(v4.ip().octets()),
          },
        },
        sin_zero: [0; 8],
      };
      unsafe {
        std::ptr::write(&mut storage as *mut _ as *mut SOCKADDR_IN, sin);
      }
      (storage, std::mem::size_of::<SOCKADDR_IN>() as i32)
    }
    std::net::SocketAddr::V6(v6) => {
      let sin6 = SOCKADDR_IN6 {
        sin6_family: ws::AF_INET6,
        sin6_port: v6.port().to_be(),
        sin6_flowinfo: v6.flowinfo(),
        sin6_addr: ws::IN6_ADDR {
          u: ws::IN6_ADDR_0 { Byte: v6.ip().octets() },
        },
        Anonymous: ws::SOCKADDR_IN6_0 { sin6_scope_id: v6.scope_id() },
      };
      unsafe {
        std::ptr::write(&mut storage as *mut _ as *mut SOCKADDR_IN6, sin6);
      }
      (storage, std::mem::size_of::<SOCKADDR_IN6>() as i32)
    }
  }
}

fn addr_from_storage(storage: &SOCKADDR_STORAGE) -> io::Result<Addr> {
  match storage.ss_family {
    ws::AF_INET => {
      let sin = unsafe { &*(storage as *const _ as *const SOCKADDR_IN) };
      let ip = Ipv4Addr::from(unsafe { sin.sin_addr.S_un.S_addr }.to_ne_bytes());
      Ok(Addr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
    }
    ws::AF_INET6 => {
      let sin6 = unsafe { &*(storage as *const _ as *const SOCKADDR_IN6) };
      let ip = Ipv6Addr::from(unsafe { sin6.sin6_addr.u.Byte });
      Ok(Addr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
    }
    other => Err(io::Error::new(
      io::ErrorKind::InvalidInput,
      format!("unsupported address family: {other}"),
    )),
  }
}
