//! Single-assignment, observable, cancellable results.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tokio::task::AbortHandle;

use super::executor::panic_message;
use super::foreground::Foreground;
use crate::error::WorkFailed;

/// Where a callback runs once the promise resolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dispatch {
  /// Posted to the foreground context
  #[default]
  Foreground,
  /// Run on whichever thread resolved the promise (usually a pool worker)
  Inline,
}

type ReadyFn<T> = Arc<dyn Fn(T) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(WorkFailed) + Send + Sync>;

enum Outcome<T> {
  Pending,
  Ready(T),
  Failed(WorkFailed),
  Cancelled,
}

struct State<T> {
  outcome: Outcome<T>,
  ready: Vec<(ReadyFn<T>, Dispatch)>,
  errors: Vec<(ErrorFn, Dispatch)>,
  task: Option<AbortHandle>,
  // Thread running the first round of inline callbacks
  delivering: Option<ThreadId>,
}

impl<T> State<T> {
  /// Whether a blocked reader on the current thread must keep waiting.
  fn unsettled(&self) -> bool {
    matches!(self.outcome, Outcome::Pending)
      || self
        .delivering
        .is_some_and(|id| id != thread::current().id())
  }
}

struct Shared<T> {
  state: Mutex<State<T>>,
  settled: Condvar,
  foreground: Arc<dyn Foreground>,
}

/// Handle to an asynchronous result.
///
/// Clones share the same state. Callbacks registered before resolution fire in
/// registration order; callbacks registered afterwards fire immediately. Only one of
/// the ready and error callback sets ever fires for a given outcome.
pub struct Promise<T> {
  shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<T: Clone + Send + 'static> Promise<T> {
  pub(crate) fn pending(foreground: Arc<dyn Foreground>) -> Self {
    Self::with_outcome(foreground, Outcome::Pending)
  }

  pub(crate) fn ready(foreground: Arc<dyn Foreground>, value: T) -> Self {
    Self::with_outcome(foreground, Outcome::Ready(value))
  }

  fn with_outcome(foreground: Arc<dyn Foreground>, outcome: Outcome<T>) -> Self {
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(State {
          outcome,
          ready: Vec::new(),
          errors: Vec::new(),
          task: None,
          delivering: None,
        }),
        settled: Condvar::new(),
        foreground,
      }),
    }
  }

  fn state(&self) -> MutexGuard<'_, State<T>> {
    // Callbacks never run under this lock, so a poisoned guard still holds valid state
    self
      .shared
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Attach the pool task computing this promise so `cancel` can interrupt it.
  pub(crate) fn set_task(&self, task: AbortHandle) {
    let mut state = self.state();
    match state.outcome {
      Outcome::Pending => state.task = Some(task),
      Outcome::Cancelled => task.abort(),
      _ => {}
    }
  }

  /// First resolution. Ignored (returns false) once settled or cancelled.
  pub(crate) fn complete(&self, result: Result<T, WorkFailed>) -> bool {
    let mut state = self.state();
    if !matches!(state.outcome, Outcome::Pending) {
      return false;
    }
    state.task = None;
    state.delivering = Some(thread::current().id());

    match result {
      Ok(value) => {
        state.outcome = Outcome::Ready(value.clone());
        let callbacks = state.ready.clone();
        drop(state);
        for (callback, dispatch) in callbacks {
          self.deliver(callback, value.clone(), dispatch);
        }
      }
      Err(error) => {
        state.outcome = Outcome::Failed(error.clone());
        let callbacks = state.errors.clone();
        drop(state);
        for (callback, dispatch) in callbacks {
          self.deliver(callback, error.clone(), dispatch);
        }
      }
    }
    // Blocked readers wake after inline callbacks ran, so they observe their effects
    self.state().delivering = None;
    self.shared.settled.notify_all();
    true
  }

  /// Register a callback for the value.
  pub fn on_ready<F>(&self, dispatch: Dispatch, callback: F) -> &Self
  where
    F: Fn(T) + Send + Sync + 'static,
  {
    let callback: ReadyFn<T> = Arc::new(callback);
    let replay = {
      let mut state = self.state();
      if matches!(state.outcome, Outcome::Cancelled) {
        return self;
      }
      state.ready.push((callback.clone(), dispatch));
      match &state.outcome {
        Outcome::Ready(value) => Some(value.clone()),
        _ => None,
      }
    };

    if let Some(value) = replay {
      self.deliver(callback, value, dispatch);
    }
    self
  }

  /// Register a callback for a failure of the work.
  pub fn on_error<F>(&self, dispatch: Dispatch, callback: F) -> &Self
  where
    F: Fn(WorkFailed) + Send + Sync + 'static,
  {
    let callback: ErrorFn = Arc::new(callback);
    let replay = {
      let mut state = self.state();
      if matches!(state.outcome, Outcome::Cancelled) {
        return self;
      }
      state.errors.push((callback.clone(), dispatch));
      match &state.outcome {
        Outcome::Failed(error) => Some(error.clone()),
        _ => None,
      }
    };

    if let Some(error) = replay {
      self.deliver(callback, error, dispatch);
    }
    self
  }

  fn deliver<U: Send + 'static>(
    &self,
    callback: Arc<dyn Fn(U) + Send + Sync>,
    value: U,
    dispatch: Dispatch,
  ) {
    match dispatch {
      Dispatch::Inline => {
        if self.is_cancelled() {
          return;
        }
        // A panicking callback must not skip the rest or strand blocked readers
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(value))) {
          tracing::error!("inline callback panicked: {}", panic_message(&payload));
        }
      }
      Dispatch::Foreground => {
        let promise = self.clone();
        self.shared.foreground.post(Box::new(move || {
          // Cancellation may land between posting and running
          if !promise.is_cancelled() {
            callback(value);
          }
        }));
      }
    }
  }

  /// Stop all further delivery and interrupt the work if it has not started.
  pub fn cancel(&self) {
    let task = {
      let mut state = self.state();
      state.outcome = Outcome::Cancelled;
      state.ready.clear();
      state.errors.clear();
      state.task.take()
    };
    self.shared.settled.notify_all();

    if let Some(task) = task {
      task.abort();
    }
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self.state().outcome, Outcome::Cancelled)
  }

  /// Settled one way or another (ready, failed or cancelled).
  pub fn is_done(&self) -> bool {
    !matches!(self.state().outcome, Outcome::Pending)
  }

  /// Block the calling thread until the promise settles.
  pub fn wait_for_completion(&self) {
    let state = self.state();
    let _settled = self
      .shared
      .settled
      .wait_while(state, |s| s.unsettled())
      .unwrap_or_else(|poisoned| poisoned.into_inner());
  }

  /// Like `wait_for_completion` with an upper bound. Returns whether it settled.
  pub fn wait_timeout(&self, timeout: Duration) -> bool {
    let state = self.state();
    let (state, _) = self
      .shared
      .settled
      .wait_timeout_while(state, timeout, |s| s.unsettled())
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    !state.unsettled()
  }

  /// Block until settled and return the value.
  ///
  /// `None` on failure or cancellation; the failure itself is only handed to error
  /// callbacks (or `failure()`).
  pub fn get(&self) -> Option<T> {
    self.wait_for_completion();
    self.peek()
  }

  /// The current value without blocking.
  pub fn peek(&self) -> Option<T> {
    match &self.state().outcome {
      Outcome::Ready(value) => Some(value.clone()),
      _ => None,
    }
  }

  /// The captured failure, if the work failed.
  pub fn failure(&self) -> Option<WorkFailed> {
    match &self.state().outcome {
      Outcome::Failed(error) => Some(error.clone()),
      _ => None,
    }
  }

  /// Re-target the callbacks registered on `self` onto the outcome of `other`.
  ///
  /// `self` keeps its identity; its stored outcome is swapped for the fresh one and
  /// every registered callback fires again with it.
  pub fn renew(&self, other: &Promise<T>) {
    let on_value = self.clone();
    let on_failure = self.clone();
    other
      .on_ready(Dispatch::Inline, move |value| on_value.replay_ready(value))
      .on_error(Dispatch::Inline, move |error| on_failure.replay_error(error));
  }

  fn replay_ready(&self, value: T) {
    let callbacks = {
      let mut state = self.state();
      if matches!(state.outcome, Outcome::Cancelled) {
        return;
      }
      state.outcome = Outcome::Ready(value.clone());
      if let Some(task) = state.task.take() {
        task.abort();
      }
      state.ready.clone()
    };
    self.shared.settled.notify_all();

    for (callback, dispatch) in callbacks {
      self.deliver(callback, value.clone(), dispatch);
    }
  }

  fn replay_error(&self, error: WorkFailed) {
    let callbacks = {
      let mut state = self.state();
      if matches!(state.outcome, Outcome::Cancelled) {
        return;
      }
      state.outcome = Outcome::Failed(error.clone());
      if let Some(task) = state.task.take() {
        task.abort();
      }
      state.errors.clone()
    };
    self.shared.settled.notify_all();

    for (callback, dispatch) in callbacks {
      self.deliver(callback, error.clone(), dispatch);
    }
  }
}

impl<T> fmt::Debug for Promise<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = match self.shared.state.try_lock() {
      Ok(state) => match state.outcome {
        Outcome::Pending => "pending",
        Outcome::Ready(_) => "ready",
        Outcome::Failed(_) => "failed",
        Outcome::Cancelled => "cancelled",
      },
      Err(_) => "locked",
    };
    f.debug_struct("Promise").field("state", &state).finish_non_exhaustive()
  }
}

/// Collect the values of several promises, in order, then call `block` once.
///
/// Failed promises are skipped. A cancelled promise never settles for its callbacks,
/// so `block` is not called in that case.
pub fn when_ready<T, F>(promises: Vec<Promise<T>>, dispatch: Dispatch, block: F)
where
  T: Clone + Send + 'static,
  F: FnOnce(Vec<T>) + Send + 'static,
{
  let gather = Arc::new(Mutex::new(Gather {
    queue: promises.into(),
    results: Vec::new(),
    block: Some(Box::new(block)),
  }));
  gather_next(gather, dispatch);
}

struct Gather<T> {
  queue: VecDeque<Promise<T>>,
  results: Vec<T>,
  block: Option<Box<dyn FnOnce(Vec<T>) + Send>>,
}

fn gather_next<T: Clone + Send + 'static>(gather: Arc<Mutex<Gather<T>>>, dispatch: Dispatch) {
  let next = {
    let mut g = gather.lock().unwrap_or_else(|p| p.into_inner());
    match g.queue.pop_front() {
      Some(promise) => Some(promise),
      None => {
        let results = std::mem::take(&mut g.results);
        let block = g.block.take();
        drop(g);
        if let Some(block) = block {
          block(results);
        }
        None
      }
    }
  };

  let Some(promise) = next else {
    return;
  };

  // A renewed promise may fire again; only its first outcome counts here
  let fired = Arc::new(AtomicBool::new(false));
  let (on_value, fired_value) = (gather.clone(), fired.clone());
  let on_failure = gather;

  promise
    .on_ready(dispatch, move |value| {
      if fired_value.swap(true, Ordering::SeqCst) {
        return;
      }
      on_value
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .results
        .push(value);
      gather_next(on_value.clone(), dispatch);
    })
    .on_error(dispatch, move |_| {
      if fired.swap(true, Ordering::SeqCst) {
        return;
      }
      gather_next(on_failure.clone(), dispatch);
    });
}
