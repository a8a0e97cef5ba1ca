//! Single-threaded event loop
//!
//! A current-thread Tokio runtime that only makes progress while `run` or
//! `block_on` is pumping it. Every client callback executes on that thread.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

use super::shutdown::StopSignal;
use super::{BoxTask, Reactor};
use crate::error::{GcsError, Result};

/// Configuration for the event loop
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Name given to the pumping thread's runtime
    pub thread_name: String,
    /// How long `shutdown` waits for blocking work to finish
    pub shutdown_timeout: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            thread_name: "gcs-loop".into(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Loop that drives I/O readiness, timers and client callbacks
pub struct EventLoop {
    runtime: Runtime,
    stop: StopSignal,
    config: EventLoopConfig,
}

impl EventLoop {
    /// Create a new event loop with the given configuration
    pub fn new(config: EventLoopConfig) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()
            .map_err(|e| GcsError::Runtime {
                message: format!("Failed to create event loop: {}", e),
            })?;

        Ok(Self {
            runtime,
            stop: StopSignal::new(),
            config,
        })
    }

    /// Queue a task; it runs the next time the loop is pumped
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Pump the loop until `future` completes
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Pump the loop until `stop` is called.
    ///
    /// A stop requested while the loop was idle makes the next `run`
    /// return as soon as it starts.
    pub fn run(&self) {
        debug!("Event loop {} running", self.config.thread_name);
        self.runtime.block_on(self.stop.stopped());
        debug!("Event loop {} stopped", self.config.thread_name);
    }

    /// Ask a running (or the next) `run` call to return
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Cloneable handle callbacks capture to stop the loop
    pub fn stopper(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Handle for spawning from outside the loop thread
    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    /// Tear the loop down. Clients attached to it must be dropped first.
    pub fn shutdown(self) {
        self.runtime.shutdown_timeout(self.config.shutdown_timeout);
    }
}

impl Reactor for EventLoop {
    fn spawn_task(&self, task: BoxTask) {
        self.runtime.spawn(task);
    }

    fn run(&self) {
        EventLoop::run(self)
    }

    fn stop(&self) {
        EventLoop::stop(self)
    }
}
