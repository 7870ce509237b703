//! Single-assignment tasks with ordered continuations.
//!
//! A [`Task`] is the consumer half of a one-shot result slot; a
//! [`TaskCompletion`] is the producer half. Continuations registered
//! before resolution run on the resolving thread in registration order.
//! Continuations registered after resolution run inline on the
//! registering thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::Error;
use crate::sync::Mutex;

type Continuation<T> = Box<dyn FnOnce(Result<T, Error>) + Send>;

enum State<T> {
  Pending(Vec<Continuation<T>>),
  Done(Result<T, Error>),
}

struct Shared<T> {
  state: Mutex<State<T>>,
}

/// Consumer handle for a single asynchronous result.
pub struct Task<T> {
  shared: Arc<Shared<T>>,
}

impl<T> Clone for Task<T> {
  fn clone(&self) -> Self {
    Self { shared: Arc::clone(&self.shared) }
  }
}

impl<T: Clone + Send + 'static> Task<T> {
  /// A task that is already resolved with `result`.
  pub fn from_result(result: Result<T, Error>) -> Self {
    Self {
      shared: Arc::new(Shared { state: Mutex::new(State::Done(result)) }),
    }
  }

  /// Registers a continuation. At most one resolution ever reaches it.
  pub fn when_done<F>(&self, f: F)
  where
    F: FnOnce(Result<T, Error>) + Send + 'static,
  {
    let mut state = self.shared.state.lock();
    match &mut *state {
      State::Pending(list) => list.push(Box::new(f)),
      State::Done(result) => {
        let result = result.clone();
        drop(state);
        f(result);
      }
    }
  }

  /// Chains a transformation, yielding a task for its output.
  pub fn then<U, F>(&self, f: F) -> Task<U>
  where
    U: Clone + Send + 'static,
    F: FnOnce(Result<T, Error>) -> Result<U, Error> + Send + 'static,
  {
    let completion = TaskCompletion::new();
    let next = completion.task();
    self.when_done(move |result| {
      let _ = completion.resolve(f(result));
    });
    next
  }

  /// Blocks the calling thread until the task resolves.
  ///
  /// Bridges the callback world to synchronous code (tests, `main`).
  pub fn wait(&self) -> Result<T, Error> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    self.when_done(move |result| {
      let _ = tx.send(result);
    });
    rx.recv().unwrap_or(Err(Error::Closed))
  }

  /// Like [`Task::wait`] but gives up after `timeout`.
  pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, Error>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    self.when_done(move |result| {
      let _ = tx.send(result);
    });
    rx.recv_timeout(timeout).ok()
  }

  /// The result, if the task has already resolved.
  pub fn try_result(&self) -> Option<Result<T, Error>> {
    match &*self.shared.state.lock() {
      State::Done(result) => Some(result.clone()),
      State::Pending(_) => None,
    }
  }
}

/// Producer handle: resolves the paired [`Task`] exactly once.
pub struct TaskCompletion<T> {
  shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskCompletion<T> {
  fn clone(&self) -> Self {
    Self { shared: Arc::clone(&self.shared) }
  }
}

impl<T: Clone + Send + 'static> Default for TaskCompletion<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Clone + Send + 'static> TaskCompletion<T> {
  pub fn new() -> Self {
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(State::Pending(Vec::new())),
      }),
    }
  }

  /// The consumer half. May be called any number of times.
  pub fn task(&self) -> Task<T> {
    Task { shared: Arc::clone(&self.shared) }
  }

  pub fn set_value(&self, value: T) -> Result<(), Error> {
    self.resolve(Ok(value))
  }

  pub fn set_error(&self, error: Error) -> Result<(), Error> {
    self.resolve(Err(error))
  }

  /// Resolves the task, running pending continuations in registration
  /// order on this thread. A second resolution fails with
  /// [`Error::AlreadyResolved`] and runs nothing.
  pub fn resolve(&self, result: Result<T, Error>) -> Result<(), Error> {
    let continuations = {
      let mut state = self.shared.state.lock();
      match &mut *state {
        State::Done(_) => return Err(Error::AlreadyResolved),
        State::Pending(list) => {
          let list = std::mem::take(list);
          *state = State::Done(result.clone());
          list
        }
      }
    };
    for continuation in continuations {
      continuation(result.clone());
    }
    Ok(())
  }
}

/// Cooperative cancellation flag shared between an until-loop and its
/// caller. Cancelling stops re-arming; it never aborts an operation that
/// is already in flight.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
  flag: Arc<AtomicBool>,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// Requests cancellation. Idempotent.
  pub fn cancel(&self) {
    self.flag.store(true, Ordering::Release);
  }

  pub fn is_cancelled(&self) -> bool {
    self.flag.load(Ordering::Acquire)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::thread;

  #[test]
  fn resolves_once_and_rejects_the_second_attempt() {
    let completion = TaskCompletion::new();
    assert!(completion.set_value(7u32).is_ok());
    assert!(matches!(
      completion.set_value(8),
      Err(Error::AlreadyResolved)
    ));
    assert!(matches!(
      completion.set_error(Error::Closed),
      Err(Error::AlreadyResolved)
    ));
    assert_eq!(completion.task().wait().unwrap(), 7);
  }

  #[test]
  fn continuations_run_in_registration_order() {
    let completion = TaskCompletion::new();
    let task = completion.task();
    let order = Arc::new(Mutex::new(Vec::new()));
    for n in 0..4 {
      let order = Arc::clone(&order);
      task.when_done(move |_| order.lock().push(n));
    }
    completion.set_value(()).unwrap();
    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
  }

  #[test]
  fn late_continuation_still_sees_the_result() {
    let task: Task<u32> = Task::from_result(Ok(41));
    let seen = Arc::new(AtomicUsize::new(0));
    let seen2 = Arc::clone(&seen);
    task.when_done(move |result| {
      seen2.store(result.unwrap() as usize + 1, Ordering::SeqCst);
    });
    assert_eq!(seen.load(Ordering::SeqCst), 42);
  }

  #[test]
  fn each_continuation_fires_exactly_once() {
    let completion = TaskCompletion::new();
    let task = completion.task();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    task.when_done(move |_| {
      hits2.fetch_add(1, Ordering::SeqCst);
    });
    completion.set_value(1u8).unwrap();
    let _ = completion.set_value(2);
    let _ = completion.set_value(3);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn then_chains_values_and_errors() {
    let completion = TaskCompletion::new();
    let doubled = completion.task().then(|result| result.map(|n: u32| n * 2));
    completion.set_value(21).unwrap();
    assert_eq!(doubled.wait().unwrap(), 42);

    let completion = TaskCompletion::<u32>::new();
    let chained = completion.task().then(|result| result.map(|n| n + 1));
    completion.set_error(Error::Closed).unwrap();
    assert!(matches!(chained.wait(), Err(Error::Closed)));
  }

  #[test]
  fn wait_blocks_until_resolved_from_another_thread() {
    let completion = TaskCompletion::new();
    let task = completion.task();
    let handle = thread::spawn(move || {
      thread::sleep(Duration::from_millis(20));
      completion.set_value("done").unwrap();
    });
    assert_eq!(task.wait().unwrap(), "done");
    handle.join().unwrap();
  }

  #[test]
  fn wait_timeout_expires_on_a_pending_task() {
    let completion = TaskCompletion::<u32>::new();
    let task = completion.task();
    assert!(task.wait_timeout(Duration::from_millis(10)).is_none());
    assert!(task.try_result().is_none());
  }

  #[test]
  fn cancel_token_is_idempotent_and_visible_across_threads() {
    let token = CancelToken::new();
    assert!(!token.is_cancelled());
    let remote = token.clone();
    thread::spawn(move || {
      remote.cancel();
      remote.cancel();
    })
    .join()
    .unwrap();
    assert!(token.is_cancelled());
  }
}
