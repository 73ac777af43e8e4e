//! Asynchronous results with callbacks, cancellation and renewal.
//!
//! - [`Promise`] - single-assignment result with ready/error callbacks
//! - [`ObservablePromise`] - a promise bound to a resource, able to auto-refresh
//! - [`Executor`] - bounded pool that produces promises from closures
//! - [`Foreground`] - where `Dispatch::Foreground` callbacks are posted

mod base;
mod executor;
mod foreground;
mod observable;

pub use base::{when_ready, Dispatch, Promise};
pub use executor::Executor;
pub use foreground::{Foreground, ForegroundQueue, ForegroundReceiver, Job};
pub use observable::ObservablePromise;
