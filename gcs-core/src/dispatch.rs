//! Completion delivery
//!
//! Every issued operation hands back a single-shot `Completion`; every
//! subscription hands back an acknowledgement plus a notification stream.
//! Both can be awaited directly or bridged to callbacks run on a reactor.
//! Callbacks are gated on the issuing connection's `Liveness`, checked
//! right before each one runs.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;

use crate::connection::Liveness;
use crate::error::{GcsError, Result};
use crate::runtime::Reactor;

/// Pending result of one issued operation.
///
/// Resolves to `Err(GcsError::Disconnected)` if the connection was torn
/// down before the operation finished.
pub struct Completion<T> {
    command: &'static str,
    receiver: oneshot::Receiver<Result<T>>,
    timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
    liveness: Option<Liveness>,
}

impl<T> Completion<T> {
    pub(crate) fn new(
        command: &'static str,
        receiver: oneshot::Receiver<Result<T>>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            command,
            receiver,
            timeout,
            deadline: None,
            liveness: None,
        }
    }

    /// Tie callback delivery to a connection's lifetime
    pub(crate) fn bound_to(mut self, liveness: Liveness) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Completion that is already resolved
    #[cfg(test)]
    pub(crate) fn ready(command: &'static str, result: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(command, rx, None)
    }

    /// Name of the command this completion belongs to
    pub fn command(&self) -> &'static str {
        self.command
    }

    /// Whether the connection this completion was issued on is released
    pub fn is_released(&self) -> bool {
        released(&self.liveness)
    }
}

fn released(liveness: &Option<Liveness>) -> bool {
    liveness.as_ref().is_some_and(|l| !l.is_alive())
}

impl<T: Send + 'static> Completion<T> {
    /// Run `callback` on the reactor once the operation finishes.
    ///
    /// If the connection is released before the callback gets to run it is
    /// never invoked, even when the reply itself had already arrived.
    /// Transport failures are delivered as errors.
    pub fn on_complete<F>(self, reactor: &dyn Reactor, callback: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let liveness = self.liveness.clone();
        reactor.spawn_task(Box::pin(async move {
            let result = self.await;
            if released(&liveness) {
                return;
            }
            callback(result);
        }));
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Poll::Ready(reply) = Pin::new(&mut this.receiver).poll(cx) {
            return Poll::Ready(reply.unwrap_or(Err(GcsError::Disconnected)));
        }

        // The timer is armed on first poll so issuing works outside a runtime
        if let Some(timeout) = this.timeout {
            let deadline = this
                .deadline
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
            if deadline.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(GcsError::Timeout {
                    command: this.command,
                    millis: timeout.as_millis() as u64,
                }));
            }
        }

        Poll::Pending
    }
}

/// One published write observed through a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct Notification<Id, E> {
    /// Id of the entry that was written
    pub id: Id,
    /// The entry as committed
    pub data: E,
    /// 1-based position in the log, for log-structured tables
    pub index: Option<u64>,
}

/// Live subscription to a table channel
pub struct Subscription<Id, E> {
    ack: Option<Completion<()>>,
    notifications: mpsc::UnboundedReceiver<Notification<Id, E>>,
    liveness: Option<Liveness>,
}

impl<Id, E> Subscription<Id, E>
where
    Id: Send + 'static,
    E: Send + 'static,
{
    pub(crate) fn new(
        ack: Completion<()>,
        notifications: mpsc::UnboundedReceiver<Notification<Id, E>>,
    ) -> Self {
        Self {
            liveness: ack.liveness.clone(),
            ack: Some(ack),
            notifications,
        }
    }

    /// Wait until the subscription is active.
    ///
    /// Every write committed after this returns `Ok` will be delivered.
    /// Later calls return `Ok` immediately.
    pub async fn acknowledged(&mut self) -> Result<()> {
        match self.ack.take() {
            Some(ack) => ack.await,
            None => Ok(()),
        }
    }

    /// Next notification, or `None` once the connection is released.
    ///
    /// Notifications still buffered at release are discarded.
    pub async fn next(&mut self) -> Option<Notification<Id, E>> {
        if released(&self.liveness) {
            return None;
        }
        let notification = self.notifications.recv().await?;
        if released(&self.liveness) {
            return None;
        }
        Some(notification)
    }

    /// Drive the subscription on a reactor with callbacks.
    ///
    /// `on_ack` fires exactly once when the subscription becomes active;
    /// `on_notification` fires once per delivered write, in channel order.
    /// Nothing fires after the connection is released.
    pub fn on_notification<A, N>(mut self, reactor: &dyn Reactor, on_ack: A, mut on_notification: N)
    where
        A: FnOnce(Result<()>) + Send + 'static,
        N: FnMut(Notification<Id, E>) + Send + 'static,
    {
        reactor.spawn_task(Box::pin(async move {
            let ack = self.acknowledged().await;
            if released(&self.liveness) {
                return;
            }
            let failed = ack.is_err();
            on_ack(ack);
            if failed {
                return;
            }
            while let Some(notification) = self.next().await {
                on_notification(notification);
            }
        }));
    }
}
