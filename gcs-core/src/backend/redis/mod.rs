//! Redis backing store
//!
//! One connection carries request/reply commands; a second connection is
//! switched into subscriber mode and owned by a reader task that routes
//! pushed messages to per-channel receivers.

pub mod resp;

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::resp::{RespConnection, RespValue};
use super::{Backend, BackendSubscription, Publication};
use crate::error::{GcsError, Result};

/// Conditional SET. ARGV[1] is "1" when a current value is expected.
/// On success publishes ARGV[4] .. ARGV[5] to every channel from ARGV[6] on.
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
else
  if current then return 0 end
end
redis.call('SET', KEYS[1], ARGV[3])
local message = ARGV[4] .. ARGV[5]
for i = 6, #ARGV do
  redis.call('PUBLISH', ARGV[i], message)
end
return 1
"#;

/// SET, then PUBLISH ARGV[2] .. ARGV[3] to every channel from ARGV[4] on.
const PUT_AND_PUBLISH_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], ARGV[1])
local message = ARGV[2] .. ARGV[3]
for i = 4, #ARGV do
  redis.call('PUBLISH', ARGV[i], message)
end
return 1
"#;

/// RPUSH, then PUBLISH with the new length between ARGV[2] and ARGV[3].
const APPEND_AND_PUBLISH_SCRIPT: &str = r#"
local length = redis.call('RPUSH', KEYS[1], ARGV[1])
local message = ARGV[2] .. length .. ARGV[3]
for i = 4, #ARGV do
  redis.call('PUBLISH', ARGV[i], message)
end
return length
"#;

struct SubscribeRequest {
    channel: String,
    sender: mpsc::UnboundedSender<Bytes>,
    ack: oneshot::Sender<Result<()>>,
}

/// Backing store speaking RESP2 to a Redis server
pub struct RedisBackend {
    endpoint: String,
    commands: Mutex<RespConnection>,
    subscribe_tx: mpsc::UnboundedSender<SubscribeRequest>,
    subscriber_task: JoinHandle<()>,
}

impl RedisBackend {
    /// Open the command and subscriber connections.
    ///
    /// Failure is reported immediately and never retried.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let endpoint = format!("{}:{}", host, port);
        let open = |endpoint: String| async move {
            TcpStream::connect(&endpoint)
                .await
                .map_err(|e| GcsError::ConnectionFailed {
                    endpoint,
                    reason: e.to_string(),
                })
        };

        let commands = RespConnection::new(open(endpoint.clone()).await?, endpoint.clone());
        let subscriber = RespConnection::new(open(endpoint.clone()).await?, endpoint.clone());

        let (subscribe_tx, subscribe_rx) = mpsc::unbounded_channel();
        let subscriber_task = tokio::spawn(run_subscriber(subscriber, subscribe_rx, endpoint.clone()));

        info!("Connected to Redis at {}", endpoint);
        Ok(Self {
            endpoint,
            commands: Mutex::new(commands),
            subscribe_tx,
            subscriber_task,
        })
    }

    async fn request(&self, args: &[&[u8]]) -> Result<RespValue> {
        let mut conn = self.commands.lock().await;
        conn.request(args).await?.into_result()
    }

    /// Run a single-key script whose trailing arguments are the publication
    async fn eval(&self, script: &str, key: &str, argv: &[&[u8]], publication: &Publication) -> Result<i64> {
        let mut args: Vec<&[u8]> = vec![&b"EVAL"[..], script.as_bytes(), &b"1"[..], key.as_bytes()];
        args.extend_from_slice(argv);
        args.push(&publication.head);
        args.push(&publication.tail);
        args.extend(publication.channels.iter().map(|c| c.as_bytes()));
        self.request(&args).await?.into_integer()
    }

    fn lost(&self, reason: &str) -> GcsError {
        GcsError::ConnectionLost {
            endpoint: self.endpoint.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Drop for RedisBackend {
    fn drop(&mut self) {
        self.subscriber_task.abort();
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.request(&[b"GET", key.as_bytes()]).await?.into_optional_bytes()
    }

    async fn put(&self, key: &str, payload: Bytes) -> Result<()> {
        self.request(&[b"SET", key.as_bytes(), &payload]).await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Bytes>,
        new: Bytes,
    ) -> Result<bool> {
        self.compare_and_swap_and_publish(key, expected, new, &Publication::default())
            .await
    }

    async fn append(&self, key: &str, payload: Bytes) -> Result<u64> {
        let len = self
            .request(&[b"RPUSH", key.as_bytes(), &payload])
            .await?
            .into_integer()?;
        Ok(len as u64)
    }

    async fn put_and_publish(&self, key: &str, payload: Bytes, publication: &Publication) -> Result<()> {
        self.eval(PUT_AND_PUBLISH_SCRIPT, key, &[&payload], publication).await?;
        Ok(())
    }

    async fn compare_and_swap_and_publish(
        &self,
        key: &str,
        expected: Option<Bytes>,
        new: Bytes,
        publication: &Publication,
    ) -> Result<bool> {
        let (has_expected, expected) = match &expected {
            Some(bytes) => (&b"1"[..], &bytes[..]),
            None => (&b"0"[..], &b""[..]),
        };
        let swapped = self
            .eval(COMPARE_AND_SWAP_SCRIPT, key, &[has_expected, expected, &new], publication)
            .await?;
        Ok(swapped == 1)
    }

    async fn append_and_publish(&self, key: &str, payload: Bytes, publication: &Publication) -> Result<u64> {
        let length = self
            .eval(APPEND_AND_PUBLISH_SCRIPT, key, &[&payload], publication)
            .await?;
        Ok(length as u64)
    }

    async fn range(&self, key: &str) -> Result<Vec<Bytes>> {
        self.request(&[b"LRANGE", key.as_bytes(), b"0", b"-1"])
            .await?
            .into_bytes_array()
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize> {
        let reached = self
            .request(&[b"PUBLISH", channel.as_bytes(), &payload])
            .await?
            .into_integer()?;
        Ok(reached as usize)
    }

    async fn subscribe(&self, channel: &str) -> Result<BackendSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.subscribe_tx
            .send(SubscribeRequest {
                channel: channel.to_string(),
                sender: tx,
                ack: ack_tx,
            })
            .map_err(|_| self.lost("subscriber connection closed"))?;
        ack_rx
            .await
            .map_err(|_| self.lost("subscriber connection closed"))??;
        Ok(BackendSubscription::new(channel.to_string(), rx))
    }
}

/// Owns the subscriber-mode connection until it fails or the backend drops
async fn run_subscriber(
    mut conn: RespConnection,
    mut requests: mpsc::UnboundedReceiver<SubscribeRequest>,
    endpoint: String,
) {
    let mut routes: HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>> = HashMap::new();
    let mut pending_acks: HashMap<String, VecDeque<oneshot::Sender<Result<()>>>> = HashMap::new();

    let failure = loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    break GcsError::ConnectionLost {
                        endpoint,
                        reason: "backend dropped".into(),
                    };
                };
                let already_subscribed = routes.contains_key(&request.channel);
                routes
                    .entry(request.channel.clone())
                    .or_default()
                    .push(request.sender);
                if already_subscribed && !pending_acks.contains_key(&request.channel) {
                    let _ = request.ack.send(Ok(()));
                    continue;
                }
                pending_acks
                    .entry(request.channel.clone())
                    .or_default()
                    .push_back(request.ack);
                if !already_subscribed {
                    if let Err(e) = conn.send(&[b"SUBSCRIBE", request.channel.as_bytes()]).await {
                        warn!("Redis subscriber connection failed: {}", e);
                        break e;
                    }
                }
            }
            value = conn.read_value() => {
                match value {
                    Ok(value) => route_push(value, &mut routes, &mut pending_acks),
                    Err(e) => {
                        warn!("Redis subscriber connection lost: {}", e);
                        break e;
                    }
                }
            }
        }
    };

    // Routes drop here, which ends every open subscription stream
    for (_, acks) in pending_acks {
        for ack in acks {
            let _ = ack.send(Err(failure.clone()));
        }
    }
}

fn route_push(
    value: RespValue,
    routes: &mut HashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>,
    pending_acks: &mut HashMap<String, VecDeque<oneshot::Sender<Result<()>>>>,
) {
    let RespValue::Array(items) = value else {
        warn!("Ignoring unexpected subscriber reply {:?}", value);
        return;
    };
    let kind = items.first().and_then(RespValue::as_bytes);
    let channel = items
        .get(1)
        .and_then(RespValue::as_bytes)
        .map(|c| String::from_utf8_lossy(c).into_owned());

    match (kind, channel) {
        (Some(b"subscribe"), Some(channel)) => {
            debug!("Redis subscription to {} active", channel);
            if let Some(acks) = pending_acks.remove(&channel) {
                for ack in acks {
                    let _ = ack.send(Ok(()));
                }
            }
        }
        (Some(b"message"), Some(channel)) => {
            let Some(RespValue::BulkString(payload)) = items.get(2) else {
                warn!("Malformed message push on {}", channel);
                return;
            };
            if let Some(senders) = routes.get_mut(&channel) {
                senders.retain(|sender| sender.send(payload.clone()).is_ok());
            }
        }
        _ => debug!("Ignoring subscriber push {:?}", items),
    }
}
