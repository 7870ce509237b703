use std::sync::MutexGuard;

/// `std::sync::Mutex` without poisoning. A panic while a completion
/// callback holds a lock must not wedge every later operation, so a
/// poisoned lock is simply re-entered.
#[derive(Debug, Default)]
pub(crate) struct Mutex<T>(std::sync::Mutex<T>);

impl<T> Mutex<T> {
  pub const fn new(value: T) -> Self {
    Self(std::sync::Mutex::new(value))
  }

  pub fn lock(&self) -> MutexGuard<'_, T> {
    self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}
