//! Thin epoll wrapper with one-shot registrations plus a pipe-based
//! wakeup channel for the dispatch thread.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Reserved key for the wakeup pipe. Never collides with an fd key.
pub(crate) const NOTIFY_KEY: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest {
  pub readable: bool,
  pub writable: bool,
}

impl Interest {
  pub fn is_empty(self) -> bool {
    !self.readable && !self.writable
  }

  fn events(self) -> u32 {
    // EPOLLONESHOT: a fired registration stays disarmed until the
    // dispatch loop re-arms it with the remaining interest.
    let mut events = libc::EPOLLONESHOT as u32;
    if self.readable {
      events |= libc::EPOLLIN as u32;
    }
    if self.writable {
      events |= libc::EPOLLOUT as u32;
    }
    events
  }
}

pub(crate) struct Poller {
  epoll: OwnedFd,
  notify_read: OwnedFd,
  notify_write: OwnedFd,
}

impl Poller {
  pub fn new() -> io::Result<Self> {
    let epoll = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
    let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

    let mut pipe_fds = [0 as RawFd; 2];
    syscall!(pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;
    let notify_read = unsafe { OwnedFd::from_raw_fd(pipe_fds[0]) };
    let notify_write = unsafe { OwnedFd::from_raw_fd(pipe_fds[1]) };

    // The wakeup pipe is the only level-triggered, persistent entry.
    let mut event = libc::epoll_event {
      events: libc::EPOLLIN as u32,
      u64: NOTIFY_KEY,
    };
    syscall!(epoll_ctl(
      epoll.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      notify_read.as_raw_fd(),
      &mut event,
    ))?;

    Ok(Self { epoll, notify_read, notify_write })
  }

  pub fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
    let mut event = libc::epoll_event { events: interest.events(), u64: key };
    syscall!(epoll_ctl(
      self.epoll.as_raw_fd(),
      libc::EPOLL_CTL_ADD,
      fd,
      &mut event,
    ))?;
    Ok(())
  }

  pub fn modify(
    &self,
    fd: RawFd,
    key: u64,
    interest: Interest,
  ) -> io::Result<()> {
    let mut event = libc::epoll_event { events: interest.events(), u64: key };
    syscall!(epoll_ctl(
      self.epoll.as_raw_fd(),
      libc::EPOLL_CTL_MOD,
      fd,
      &mut event,
    ))?;
    Ok(())
  }

  pub fn delete(&self, fd: RawFd) -> io::Result<()> {
    let result = syscall!(epoll_ctl(
      self.epoll.as_raw_fd(),
      libc::EPOLL_CTL_DEL,
      fd,
      std::ptr::null_mut(),
    ));
    match result {
      Ok(_) => Ok(()),
      // A closed fd already left the interest list.
      Err(err)
        if matches!(err.raw_os_error(), Some(libc::ENOENT | libc::EBADF)) =>
      {
        Ok(())
      }
      Err(err) => Err(err),
    }
  }

  /// Blocks until at least one event or the timeout. EINTR retries.
  pub fn wait(
    &self,
    events: &mut [libc::epoll_event],
    timeout: Option<Duration>,
  ) -> io::Result<usize> {
    let timeout_ms = match timeout {
      Some(duration) => duration.as_millis().min(i32::MAX as u128) as i32,
      None => -1,
    };
    loop {
      match syscall!(epoll_wait(
        self.epoll.as_raw_fd(),
        events.as_mut_ptr(),
        events.len() as libc::c_int,
        timeout_ms,
      )) {
        Ok(count) => return Ok(count as usize),
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) => return Err(err),
      }
    }
  }

  /// Wakes the dispatch thread. A full pipe already guarantees a wakeup,
  /// so `WouldBlock` is success.
  pub fn notify(&self) -> io::Result<()> {
    let byte = 1u8;
    match syscall!(write(
      self.notify_write.as_raw_fd(),
      &byte as *const u8 as *const libc::c_void,
      1,
    )) {
      Ok(_) => Ok(()),
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
      Err(err) => Err(err),
    }
  }

  /// Empties the wakeup pipe after a NOTIFY_KEY event.
  pub fn drain_notifications(&self) {
    let mut scratch = [0u8; 64];
    loop {
      match syscall!(read(
        self.notify_read.as_raw_fd(),
        scratch.as_mut_ptr() as *mut libc::c_void,
        scratch.len(),
      )) {
        Ok(0) => break,
        Ok(_) => continue,
        Err(_) => break,
      }
    }
  }
}
