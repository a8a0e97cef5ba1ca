//! Loop stop signalling
//!
//! A stop request is remembered until the loop consumes it, so a callback
//! that fires before `run` starts still ends that `run`.

use std::sync::Arc;
use tokio::sync::Notify;

/// Cloneable stop handle shared between a loop and its callbacks
#[derive(Clone, Default)]
pub struct StopSignal {
    notify: Arc<Notify>,
}

impl StopSignal {
    /// Create a new stop signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop
    pub fn stop(&self) {
        self.notify.notify_one();
    }

    /// Resolves once a stop has been requested, consuming the request
    pub async fn stopped(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_signal() {
        let signal = StopSignal::new();
        let waiter = signal.clone();

        // Spawn task waiting for stop
        let handle = tokio::spawn(async move {
            waiter.stopped().await;
            42
        });

        signal.stop();

        let result = handle.await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn test_stop_is_remembered() {
        let signal = StopSignal::new();
        signal.stop();
        // No waiter existed when stop was called
        signal.stopped().await;
    }
}
