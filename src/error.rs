use std::io;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for every operation in the crate.
///
/// Task continuations are fanned out to every registered callback, so the
/// error must be `Clone`; OS errors are therefore held behind an `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
  /// Allocating an OS socket or engine resource failed.
  #[error("resource allocation failed: {0}")]
  Resource(Arc<io::Error>),

  /// Binding a local address failed.
  #[error("bind failed: {0}")]
  Bind(Arc<io::Error>),

  /// Entering listening state failed.
  #[error("listen failed: {0}")]
  Listen(Arc<io::Error>),

  /// Establishing an outbound connection failed.
  #[error("connect failed: {0}")]
  Connect(Arc<io::Error>),

  /// The socket was closed before or while the operation ran.
  #[error("socket closed")]
  Closed,

  /// A submitted transfer failed at dispatch time.
  #[error("transfer failed: {0}")]
  Transfer(Arc<io::Error>),

  /// An operation of the same readiness direction is already pending on
  /// this handle.
  #[error("an operation of this kind is already pending on the handle")]
  ConcurrentOperation,

  /// A task completion was resolved a second time.
  #[error("task already resolved")]
  AlreadyResolved,

  /// An address literal did not parse as an IP address.
  #[error("invalid address literal: {0:?}")]
  InvalidAddress(String),
}

impl Error {
  pub(crate) fn resource(err: io::Error) -> Self {
    Self::Resource(Arc::new(err))
  }

  pub(crate) fn bind(err: io::Error) -> Self {
    Self::Bind(Arc::new(err))
  }

  pub(crate) fn listen(err: io::Error) -> Self {
    Self::Listen(Arc::new(err))
  }

  pub(crate) fn connect(err: io::Error) -> Self {
    Self::Connect(Arc::new(err))
  }

  pub(crate) fn transfer(err: io::Error) -> Self {
    Self::Transfer(Arc::new(err))
  }

  /// The raw OS error code, when this error wraps one.
  pub fn raw_os_error(&self) -> Option<i32> {
    match self {
      Self::Resource(err)
      | Self::Bind(err)
      | Self::Listen(err)
      | Self::Connect(err)
      | Self::Transfer(err) => err.raw_os_error(),
      _ => None,
    }
  }
}
