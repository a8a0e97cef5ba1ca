//! In-process backing store
//!
//! Holds keys and channel subscribers behind mutexes. Publishing happens
//! under the channel lock, which keeps delivery in commit order per channel.
//! Writes that publish hold the value lock until delivery is queued, so a
//! later commit can never overtake an earlier one on a channel. Lock order
//! is values, then channels.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Backend, BackendSubscription, Publication};
use crate::error::{GcsError, Result};

#[derive(Debug, Clone)]
enum Value {
    Single(Bytes),
    List(Vec<Bytes>),
}

/// Backing store living inside the current process
#[derive(Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, Value>>,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }

    /// Drop every key, like FLUSHALL. Subscriptions are kept.
    pub fn flush_all(&self) {
        self.values.lock().clear();
    }

    /// Live subscribers on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

type Values = HashMap<String, Value>;
type Channels = HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>;

impl MemoryBackend {
    fn deliver(&self, publication: &Publication, index: Option<u64>) {
        let message = publication.message(index);
        let mut channels = self.channels.lock();
        for channel in &publication.channels {
            send_on(&mut channels, channel, &message);
        }
    }
}

fn send_on(channels: &mut Channels, channel: &str, payload: &Bytes) -> usize {
    let Some(senders) = channels.get_mut(channel) else {
        return 0;
    };
    senders.retain(|sender| sender.send(payload.clone()).is_ok());
    let reached = senders.len();
    if senders.is_empty() {
        channels.remove(channel);
    }
    reached
}

fn swap(values: &mut Values, key: &str, expected: Option<Bytes>, new: Bytes) -> Result<bool> {
    let current = match values.get(key) {
        None => None,
        Some(Value::Single(bytes)) => Some(bytes),
        Some(Value::List(_)) => return Err(wrong_type(key)),
    };
    if current != expected.as_ref() {
        return Ok(false);
    }
    values.insert(key.to_string(), Value::Single(new));
    Ok(true)
}

fn push(values: &mut Values, key: &str, payload: Bytes) -> Result<u64> {
    let entry = values
        .entry(key.to_string())
        .or_insert_with(|| Value::List(Vec::new()));
    match entry {
        Value::List(items) => {
            items.push(payload);
            Ok(items.len() as u64)
        }
        Value::Single(_) => Err(wrong_type(key)),
    }
}

fn wrong_type(key: &str) -> GcsError {
    GcsError::Backend {
        message: format!("WRONGTYPE operation against key {} holding the wrong kind of value", key),
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn endpoint(&self) -> String {
        "memory".into()
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.values.lock().get(key) {
            None => Ok(None),
            Some(Value::Single(bytes)) => Ok(Some(bytes.clone())),
            Some(Value::List(_)) => Err(wrong_type(key)),
        }
    }

    async fn put(&self, key: &str, payload: Bytes) -> Result<()> {
        self.values.lock().insert(key.to_string(), Value::Single(payload));
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Bytes>,
        new: Bytes,
    ) -> Result<bool> {
        swap(&mut self.values.lock(), key, expected, new)
    }

    async fn append(&self, key: &str, payload: Bytes) -> Result<u64> {
        push(&mut self.values.lock(), key, payload)
    }

    async fn put_and_publish(&self, key: &str, payload: Bytes, publication: &Publication) -> Result<()> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), Value::Single(payload));
        self.deliver(publication, None);
        Ok(())
    }

    async fn compare_and_swap_and_publish(
        &self,
        key: &str,
        expected: Option<Bytes>,
        new: Bytes,
        publication: &Publication,
    ) -> Result<bool> {
        let mut values = self.values.lock();
        let swapped = swap(&mut values, key, expected, new)?;
        if swapped {
            self.deliver(publication, None);
        }
        Ok(swapped)
    }

    async fn append_and_publish(&self, key: &str, payload: Bytes, publication: &Publication) -> Result<u64> {
        let mut values = self.values.lock();
        let length = push(&mut values, key, payload)?;
        self.deliver(publication, Some(length));
        Ok(length)
    }

    async fn range(&self, key: &str) -> Result<Vec<Bytes>> {
        match self.values.lock().get(key) {
            None => Ok(Vec::new()),
            Some(Value::List(items)) => Ok(items.clone()),
            Some(Value::Single(_)) => Err(wrong_type(key)),
        }
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize> {
        Ok(send_on(&mut self.channels.lock(), channel, &payload))
    }

    async fn subscribe(&self, channel: &str) -> Result<BackendSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        debug!("Memory backend subscribed to {}", channel);
        Ok(BackendSubscription::new(channel.to_string(), rx))
    }
}
