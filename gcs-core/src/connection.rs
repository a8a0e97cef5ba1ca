//! Connection to the backing store
//!
//! Owns the backend handle and a dispatcher task. Operations are queued in
//! call order and executed against the backend one at a time; results flow
//! back through `Completion`s. Background tasks spawned on behalf of
//! subscriptions are tracked and aborted when the connection is released.
//! A `Liveness` token shared with every completion and subscription keeps
//! callbacks from running once the release has happened.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::dispatch::Completion;
use crate::error::{GcsError, Result};
use crate::metrics::standard;
use crate::runtime::BoxTask;

type Job = Box<dyn FnOnce(Arc<dyn Backend>) -> BoxTask + Send>;

/// Health of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting operations
    Connected,
    /// Released; new operations fail immediately
    Closed,
}

/// Shared view of whether a connection has been released
#[derive(Debug, Clone, Default)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// `false` once the owning connection is released
    pub fn is_alive(&self) -> bool {
        !self.0.load(Ordering::Acquire)
    }

    /// Mark as released, returning whether it already was
    pub(crate) fn release(&self) -> bool {
        self.0.swap(true, Ordering::AcqRel)
    }
}

/// Shared handle to the backing store used by every table of one client
pub struct Connection {
    backend: Arc<dyn Backend>,
    handle: Handle,
    queue: mpsc::UnboundedSender<Job>,
    liveness: Liveness,
    command_timeout: Option<Duration>,
    dispatcher: JoinHandle<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Attach a backend to the event loop behind `handle`
    pub fn new(backend: Arc<dyn Backend>, handle: Handle, command_timeout: Option<Duration>) -> Self {
        let (queue, jobs) = mpsc::unbounded_channel();
        let dispatcher = handle.spawn(run_dispatcher(backend.clone(), jobs));
        info!("GCS connection attached to {}", backend.endpoint());

        Self {
            backend,
            handle,
            queue,
            liveness: Liveness::new(),
            command_timeout,
            dispatcher,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.liveness.is_alive() {
            ConnectionState::Connected
        } else {
            ConnectionState::Closed
        }
    }

    /// Token that reports this connection's release
    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn endpoint(&self) -> String {
        self.backend.endpoint()
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout
    }

    /// Queue an operation.
    ///
    /// Fails synchronously only when the connection is already closed.
    pub fn issue<T, F, Fut>(&self, command: &'static str, op: F) -> Result<Completion<T>>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn Backend>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if !self.is_connected() {
            return Err(GcsError::Disconnected);
        }

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |backend: Arc<dyn Backend>| -> BoxTask {
            Box::pin(async move {
                let result = op(backend).await;
                // The caller may have dropped its completion
                let _ = tx.send(result);
            })
        });
        self.queue.send(job).map_err(|_| GcsError::Disconnected)?;

        standard::COMMANDS_ISSUED.inc();
        debug!("Issued {}", command);
        Ok(Completion::new(command, rx, self.command_timeout).bound_to(self.liveness()))
    }

    /// Spawn a background task that lives no longer than this connection
    pub fn spawn_tracked<F>(&self, future: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if !self.is_connected() {
            return Err(GcsError::Disconnected);
        }
        tasks.retain(|task| !task.is_finished());
        tasks.push(self.handle.spawn(future));
        Ok(())
    }

    /// Release the connection. Idempotent.
    ///
    /// Pending operations resolve to `Disconnected` and tracked tasks stop.
    /// Callbacks bound to this connection stop firing, including for
    /// replies and notifications that arrived before the release.
    pub fn close(&self) {
        let was_closed = {
            let mut tasks = self.tasks.lock();
            let was_closed = self.liveness.release();
            for task in tasks.drain(..) {
                task.abort();
            }
            was_closed
        };
        if !was_closed {
            self.dispatcher.abort();
            info!("GCS connection to {} closed", self.backend.endpoint());
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_dispatcher(backend: Arc<dyn Backend>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let started = Instant::now();
        job(backend.clone()).await;
        standard::COMMAND_DURATION.observe(started.elapsed().as_secs_f64());
    }
}
