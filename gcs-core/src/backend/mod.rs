//! Backing store adapters
//!
//! The key-value / pub-sub contract the table layer is written against,
//! with an in-process implementation and a Redis implementation.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::error::Result;

pub use memory::MemoryBackend;
pub use redis::RedisBackend;

/// Message published in the same atomic step as a write.
///
/// Keyed writes publish `head` followed by `tail`. Appends publish the new
/// list length between the two, so the message can carry its log position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Publication {
    pub channels: Vec<String>,
    pub head: Bytes,
    pub tail: Bytes,
}

impl Publication {
    pub fn new(channels: Vec<String>, message: Bytes) -> Self {
        Self {
            channels,
            head: message,
            tail: Bytes::new(),
        }
    }

    /// Message whose list position is spliced between `head` and `tail`
    pub fn indexed(channels: Vec<String>, head: Bytes, tail: Bytes) -> Self {
        Self { channels, head, tail }
    }

    /// Bytes sent on every channel
    pub fn message(&self, index: Option<u64>) -> Bytes {
        let index = index.map(|i| i.to_string()).unwrap_or_default();
        let mut message = BytesMut::with_capacity(self.head.len() + index.len() + self.tail.len());
        message.put_slice(&self.head);
        message.put_slice(index.as_bytes());
        message.put_slice(&self.tail);
        message.freeze()
    }
}

/// Atomic single-key store with per-channel ordered publish/subscribe.
///
/// Every method is a single round trip to the store. Implementations never
/// retry internally. The `*_and_publish` methods commit and publish as one
/// step, so the order subscribers observe on a channel is the commit order.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Human readable location of the store, used in logs and errors
    fn endpoint(&self) -> String;

    /// Read a value; `None` if the key is absent
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Overwrite a value
    async fn put(&self, key: &str, payload: Bytes) -> Result<()>;

    /// Write `new` only if the stored value equals `expected`
    /// (`None` = key absent). Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Bytes>,
        new: Bytes,
    ) -> Result<bool>;

    /// Append to the list stored at `key`, returning the new list length
    async fn append(&self, key: &str, payload: Bytes) -> Result<u64>;

    /// Overwrite a value and publish `publication`
    async fn put_and_publish(&self, key: &str, payload: Bytes, publication: &Publication) -> Result<()>;

    /// `compare_and_swap` that publishes `publication` only if the write happened
    async fn compare_and_swap_and_publish(
        &self,
        key: &str,
        expected: Option<Bytes>,
        new: Bytes,
        publication: &Publication,
    ) -> Result<bool>;

    /// Append and publish `publication` carrying the new list length
    async fn append_and_publish(&self, key: &str, payload: Bytes, publication: &Publication) -> Result<u64>;

    /// Read the whole list stored at `key`; empty if absent
    async fn range(&self, key: &str) -> Result<Vec<Bytes>>;

    /// Publish to a channel, returning the number of receivers reached
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize>;

    /// Subscribe to a channel. The subscription is active once this returns.
    async fn subscribe(&self, channel: &str) -> Result<BackendSubscription>;
}

/// Stream of raw payloads published on one channel
#[derive(Debug)]
pub struct BackendSubscription {
    channel: String,
    receiver: mpsc::UnboundedReceiver<Bytes>,
}

impl BackendSubscription {
    pub fn new(channel: String, receiver: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { channel, receiver }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the backend side has gone away
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }
}
