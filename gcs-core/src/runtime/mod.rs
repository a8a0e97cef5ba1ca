//! Event loop abstraction
//!
//! The client only needs somewhere to run continuations plus a way to be
//! pumped and stopped. `EventLoop` is the Tokio-backed implementation.

pub mod executor;
pub mod shutdown;

use std::future::Future;
use std::pin::Pin;

pub use executor::{EventLoop, EventLoopConfig};
pub use shutdown::StopSignal;

/// Continuation queued on a reactor
pub type BoxTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Minimal loop contract: queue work, pump until stopped, stop
pub trait Reactor: Send + Sync {
    /// Queue a task to run on the loop thread
    fn spawn_task(&self, task: BoxTask);

    /// Pump until `stop` is called
    fn run(&self);

    /// End the current (or next) `run`
    fn stop(&self);
}
