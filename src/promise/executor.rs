//! Bounded worker pool that turns closures into promises.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use color_eyre::eyre::eyre;
use tokio::runtime::{Builder, Handle, Runtime};

use super::base::Promise;
use super::foreground::Foreground;
use super::observable::ObservablePromise;
use crate::config::ExecutorConfig;
use crate::error::WorkFailed;
use crate::resource::ResourceRef;

/// Runs provider work on a fixed-size pool and hands back promises.
///
/// Cheap to clone; every clone drives the same pool.
#[derive(Clone)]
pub struct Executor {
  inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
  runtime: Option<Runtime>,
  handle: Handle,
  foreground: Arc<dyn Foreground>,
}

impl Drop for ExecutorInner {
  fn drop(&mut self) {
    // The last handle may be dropped from inside a pool task
    if let Some(runtime) = self.runtime.take() {
      runtime.shutdown_background();
    }
  }
}

impl Executor {
  /// Start a pool with `config.workers` concurrent tasks.
  pub fn new(config: &ExecutorConfig, foreground: Arc<dyn Foreground>) -> std::io::Result<Self> {
    let runtime = Builder::new_multi_thread()
      .worker_threads(1)
      .max_blocking_threads(config.workers.max(1))
      .thread_name(config.thread_name.clone())
      .enable_all()
      .build()?;

    tracing::debug!(workers = config.workers, "executor started");

    Ok(Self {
      inner: Arc::new(ExecutorInner {
        handle: runtime.handle().clone(),
        runtime: Some(runtime),
        foreground,
      }),
    })
  }

  pub fn foreground(&self) -> Arc<dyn Foreground> {
    Arc::clone(&self.inner.foreground)
  }

  /// Schedule `work` and return its pending promise.
  ///
  /// Errors and panics inside `work` become the promise's failure.
  pub fn promise<T, F>(&self, work: F) -> Promise<T>
  where
    T: Clone + Send + 'static,
    F: FnOnce() -> color_eyre::Result<T> + Send + 'static,
  {
    let promise = Promise::pending(self.foreground());
    let completer = promise.clone();

    let task = self.inner.handle.spawn_blocking(move || {
      let result = match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(result) => result,
        Err(payload) => Err(eyre!("work panicked: {}", panic_message(&payload))),
      };

      if let Err(report) = &result {
        tracing::error!(error = ?report, "work failed");
      }
      completer.complete(result.map_err(WorkFailed::new));
    });
    promise.set_task(task.abort_handle());

    promise
  }

  /// An already-resolved promise, for values that are at hand (cache hits).
  pub fn resolved<T: Clone + Send + 'static>(&self, value: T) -> Promise<T> {
    Promise::ready(self.foreground(), value)
  }

  /// Schedule `work` bound to `resource`.
  pub fn observe<T, F>(&self, resource: ResourceRef, work: F) -> ObservablePromise<T>
  where
    T: Clone + Send + 'static,
    F: FnOnce() -> color_eyre::Result<T> + Send + 'static,
  {
    ObservablePromise::new(self.promise(work), resource)
  }

  pub fn observe_resolved<T: Clone + Send + 'static>(
    &self,
    resource: ResourceRef,
    value: T,
  ) -> ObservablePromise<T> {
    ObservablePromise::new(self.resolved(value), resource)
  }

  /// Fire-and-forget job on the pool. Panics are logged.
  pub fn execute<F>(&self, job: F)
  where
    F: FnOnce() + Send + 'static,
  {
    self.inner.handle.spawn_blocking(move || {
      if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        tracing::error!("background job panicked: {}", panic_message(&payload));
      }
    });
  }
}

pub(super) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
