//! Immutable completion snapshots delivered to task continuations.

use crate::addr::Addr;
use crate::socket::Socket;

/// Outcome of a completed send, send-to or send-file.
#[derive(Debug, Clone)]
pub struct SendEvent {
  size: usize,
  buffer: Vec<u8>,
}

impl SendEvent {
  pub(crate) fn new(size: usize, buffer: Vec<u8>) -> Self {
    Self { size, buffer }
  }

  /// Bytes actually written. May be less than requested.
  pub fn size(&self) -> usize {
    self.size
  }

  /// The caller's buffer, handed back after the transfer.
  pub fn buffer(&self) -> &[u8] {
    &self.buffer
  }

  pub fn into_buffer(self) -> Vec<u8> {
    self.buffer
  }
}

/// Outcome of a completed recv or recv-from.
#[derive(Debug, Clone)]
pub struct RecvEvent {
  size: usize,
  buffer: Vec<u8>,
  addr: Option<Addr>,
}

impl RecvEvent {
  pub(crate) fn new(size: usize, buffer: Vec<u8>, addr: Option<Addr>) -> Self {
    Self { size, buffer, addr }
  }

  /// Bytes received. Zero is a successful completion and means the peer
  /// shut down its sending side.
  pub fn size(&self) -> usize {
    self.size
  }

  /// The received payload: the first `size` bytes of the buffer.
  pub fn bytes(&self) -> &[u8] {
    &self.buffer[..self.size.min(self.buffer.len())]
  }

  /// Sender address; present for recv-from, absent for plain recv.
  pub fn addr(&self) -> Option<Addr> {
    self.addr
  }

  pub fn into_buffer(self) -> Vec<u8> {
    self.buffer
  }

  /// Reclaims the buffer for reuse by an until-loop re-arm.
  pub(crate) fn reclaim_buffer(&mut self) -> Vec<u8> {
    std::mem::take(&mut self.buffer)
  }
}

/// Outcome of a completed accept: the new connection plus the peer's
/// address.
#[derive(Debug, Clone)]
pub struct ConnectedEvent {
  connection: Socket,
  addr: Addr,
}

impl ConnectedEvent {
  pub(crate) fn new(connection: Socket, addr: Addr) -> Self {
    Self { connection, addr }
  }

  pub fn connection(&self) -> &Socket {
    &self.connection
  }

  pub fn addr(&self) -> Addr {
    self.addr
  }

  pub fn into_connection(self) -> Socket {
    self.connection
  }
}
