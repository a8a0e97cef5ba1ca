//! Typed tables over the backing store
//!
//! A table is a namespace of keyed records with add / lookup / subscribe.
//! Keys and channel names are derived from the table kind so different
//! tables never collide:
//!
//! ```text
//! entry key      {PREFIX}:{entry_id}
//! requests key   {PREFIX}:NOTIFY:{entry_id}
//! channel        {PUBSUB}:{job_id}            every write for the job
//! channel        {PUBSUB}:{job_id}:{client}   only ids the client requested
//! ```
//!
//! Writers publish each committed write to the job channel and, for a
//! non-nil job, to the nil-job channel, so a nil-job subscriber sees every
//! job. The publish happens in the same atomic backend step as the write,
//! so every channel carries writes in commit order.

pub mod client;
pub mod heartbeat;
pub mod log;
pub mod object;
pub mod task;

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::backend::{Backend, Publication};
use crate::connection::Connection;
use crate::dispatch::{Completion, Notification, Subscription};
use crate::error::{GcsError, Result};
use crate::id::{ClientId, JobId, UniqueId};
use crate::metrics::standard;

pub use self::log::Log;

/// Which table a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Object,
    Task,
    Heartbeat,
    Client,
}

impl TableKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            TableKind::Object => "OBJECT",
            TableKind::Task => "TASK",
            TableKind::Heartbeat => "HEARTBEAT",
            TableKind::Client => "CLIENT",
        }
    }

    pub fn pubsub(&self) -> &'static str {
        match self {
            TableKind::Object => "OBJECT_PUBSUB",
            TableKind::Task => "TASK_PUBSUB",
            TableKind::Heartbeat => "HEARTBEAT_PUBSUB",
            TableKind::Client => "CLIENT_PUBSUB",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TableKind::Object => "object",
            TableKind::Task => "task",
            TableKind::Heartbeat => "heartbeat",
            TableKind::Client => "client",
        }
    }
}

/// Identifier usable as a table key
pub trait EntryId:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Serialize + DeserializeOwned + Into<UniqueId> + Send + Sync + 'static
{
}

impl<T> EntryId for T where
    T: Copy + Eq + Hash + fmt::Debug + fmt::Display + Serialize + DeserializeOwned + Into<UniqueId> + Send + Sync + 'static
{
}

/// Record type stored in a table
pub trait TableEntry: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Key type of the table
    type Id: EntryId;

    /// Table this record lives in
    const KIND: TableKind;

    /// Reject records that break a representation invariant
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Reject records that cannot be stored under `id`
    fn validate_for(&self, _id: &Self::Id) -> Result<()> {
        self.validate()
    }
}

pub fn entry_key(kind: TableKind, id: UniqueId) -> String {
    format!("{}:{}", kind.prefix(), id.hex())
}

pub fn requests_key(kind: TableKind, id: UniqueId) -> String {
    format!("{}:NOTIFY:{}", kind.prefix(), id.hex())
}

pub fn channel_name(kind: TableKind, job_id: JobId, client_filter: ClientId) -> String {
    if client_filter.is_nil() {
        format!("{}:{}", kind.pubsub(), job_id.hex())
    } else {
        format!("{}:{}:{}", kind.pubsub(), job_id.hex(), client_filter.hex())
    }
}

/// Published form of a committed write
#[derive(Serialize, Deserialize)]
struct Envelope<Id, T> {
    id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index: Option<u64>,
    data: T,
}

/// Subscriber that asked for notifications on specific entry ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct NotificationRequest {
    job_id: JobId,
    client_id: ClientId,
}

pub(crate) fn encode<E: TableEntry>(value: &impl Serialize) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| GcsError::malformed(E::KIND.name(), e))
}

pub(crate) fn decode<E: TableEntry, T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| GcsError::malformed(E::KIND.name(), e))
}

/// Channels and message for one write, published atomically with it.
///
/// Log appends get their position spliced in by the backend as the last
/// envelope field.
pub(crate) async fn write_publication<E: TableEntry>(
    backend: &dyn Backend,
    job_id: JobId,
    id: E::Id,
    data: &E,
    indexed: bool,
) -> Result<Publication> {
    let mut channels = vec![channel_name(E::KIND, job_id, ClientId::nil())];
    if !job_id.is_nil() {
        channels.push(channel_name(E::KIND, JobId::nil(), ClientId::nil()));
    }
    for request in load_requests::<E>(backend, &requests_key(E::KIND, id.into())).await? {
        channels.push(channel_name(E::KIND, request.job_id, request.client_id));
    }

    let message = encode::<E>(&Envelope { id, index: None, data })?;
    if !indexed {
        return Ok(Publication::new(channels, message));
    }
    let Some(body) = message.strip_suffix(b"}") else {
        return Err(GcsError::Internal {
            message: format!("{} envelope is not a JSON object", E::KIND.name()),
        });
    };
    let mut head = BytesMut::with_capacity(body.len() + 9);
    head.put_slice(body);
    head.put_slice(b",\"index\":");
    Ok(Publication::indexed(channels, head.freeze(), Bytes::from_static(b"}")))
}

async fn load_requests<E: TableEntry>(
    backend: &dyn Backend,
    key: &str,
) -> Result<Vec<NotificationRequest>> {
    match backend.get(key).await? {
        Some(bytes) => decode::<E, _>(&bytes),
        None => Ok(Vec::new()),
    }
}

/// Read-modify-write the notification request set of one entry
async fn update_requests<E, F>(backend: &dyn Backend, key: &str, mut modify: F) -> Result<()>
where
    E: TableEntry,
    F: FnMut(&mut Vec<NotificationRequest>),
{
    loop {
        let current = backend.get(key).await?;
        let mut requests: Vec<NotificationRequest> = match &current {
            Some(bytes) => decode::<E, _>(bytes)?,
            None => Vec::new(),
        };
        modify(&mut requests);
        let new = encode::<E>(&requests)?;
        if backend.compare_and_swap(key, current, new).await? {
            return Ok(());
        }
        debug!("Notification requests for {} changed concurrently, retrying", key);
    }
}

/// Open a channel subscription and forward decoded writes to the caller
pub(crate) fn subscribe_channel<E: TableEntry>(
    connection: &Connection,
    job_id: JobId,
    client_filter: ClientId,
) -> Result<Subscription<E::Id, E>> {
    let channel = channel_name(E::KIND, job_id, client_filter);
    let raw = {
        let channel = channel.clone();
        connection.issue("SUBSCRIBE", move |backend| async move {
            backend.subscribe(&channel).await
        })?
    };

    let (ack_tx, ack_rx) = oneshot::channel();
    let (tx, rx) = mpsc::unbounded_channel();
    connection.spawn_tracked(async move {
        let mut raw = match raw.await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Subscription to {} failed: {}", channel, e);
                let _ = ack_tx.send(Err(e));
                return;
            }
        };
        debug!("Subscription to {} active", channel);
        let _ = ack_tx.send(Ok(()));

        while let Some(payload) = raw.recv().await {
            let envelope: Envelope<E::Id, E> = match decode::<E, _>(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    standard::MALFORMED_PAYLOADS.inc();
                    warn!("Dropping notification on {}: {}", channel, e);
                    continue;
                }
            };
            let notification = Notification {
                id: envelope.id,
                data: envelope.data,
                index: envelope.index,
            };
            if tx.send(notification).is_err() {
                debug!("Subscriber to {} went away", channel);
                break;
            }
            standard::NOTIFICATIONS_DELIVERED.inc();
        }
    })?;

    Ok(Subscription::new(
        Completion::new("SUBSCRIBE", ack_rx, connection.command_timeout()).bound_to(connection.liveness()),
        rx,
    ))
}

/// Keyed table whose entries are replaced wholesale by each `add`
pub struct Table<E: TableEntry> {
    pub(crate) connection: Arc<Connection>,
    _entry: PhantomData<fn() -> E>,
}

impl<E: TableEntry> Clone for Table<E> {
    fn clone(&self) -> Self {
        Self::new(self.connection.clone())
    }
}

impl<E: TableEntry> Table<E> {
    pub(crate) fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            _entry: PhantomData,
        }
    }

    /// Write `entry` under `id` and publish it.
    ///
    /// Resolves with the written entry once the backend acknowledged it.
    pub fn add(&self, job_id: JobId, id: E::Id, entry: E) -> Result<Completion<E>> {
        entry.validate_for(&id)?;
        let payload = encode::<E>(&entry)?;
        let key = entry_key(E::KIND, id.into());

        self.connection.issue("ADD", move |backend| async move {
            let publication = write_publication(backend.as_ref(), job_id, id, &entry, false).await?;
            backend.put_and_publish(&key, payload, &publication).await?;
            debug!("Added {} entry {}", E::KIND.name(), id);
            Ok(entry)
        })
    }

    /// Read the latest entry under `id`. A miss resolves to `Ok(None)`.
    ///
    /// Keys are not job scoped; `job_id` is accepted for symmetry.
    pub fn lookup(&self, _job_id: JobId, id: E::Id) -> Result<Completion<Option<E>>> {
        let key = entry_key(E::KIND, id.into());

        self.connection.issue("LOOKUP", move |backend| async move {
            match backend.get(&key).await? {
                Some(bytes) => decode::<E, E>(&bytes).map(Some),
                None => {
                    standard::LOOKUP_MISSES.inc();
                    debug!("Lookup miss for {} entry {}", E::KIND.name(), id);
                    Ok(None)
                }
            }
        })
    }

    /// Subscribe to writes for `job_id` (nil = all jobs).
    ///
    /// With a nil `client_filter` every write is delivered; otherwise only
    /// writes to ids requested through `request_notifications`.
    pub fn subscribe(
        &self,
        job_id: JobId,
        client_filter: ClientId,
    ) -> Result<Subscription<E::Id, E>> {
        subscribe_channel::<E>(&self.connection, job_id, client_filter)
    }

    /// Ask for writes to `id` to be delivered to `client_id`'s filtered
    /// subscription. The current entry, if any, is delivered right away.
    pub fn request_notifications(
        &self,
        job_id: JobId,
        id: E::Id,
        client_id: ClientId,
    ) -> Result<Completion<()>> {
        if client_id.is_nil() {
            return Err(GcsError::InvalidArgument {
                reason: "notification requests need a non-nil client id".into(),
            });
        }
        let request = NotificationRequest { job_id, client_id };
        let key = entry_key(E::KIND, id.into());
        let requests = requests_key(E::KIND, id.into());

        self.connection.issue("REQUEST_NOTIFICATIONS", move |backend| async move {
            update_requests::<E, _>(backend.as_ref(), &requests, |set| {
                if !set.contains(&request) {
                    set.push(request);
                }
            })
            .await?;

            if let Some(bytes) = backend.get(&key).await? {
                let current: E = decode::<E, E>(&bytes)?;
                let payload = encode::<E>(&Envelope { id, index: None, data: &current })?;
                backend
                    .publish(&channel_name(E::KIND, job_id, client_id), payload)
                    .await?;
            }
            Ok(())
        })
    }

    /// Stop delivering writes to `id` to `client_id`'s filtered subscription
    pub fn cancel_notifications(
        &self,
        job_id: JobId,
        id: E::Id,
        client_id: ClientId,
    ) -> Result<Completion<()>> {
        let request = NotificationRequest { job_id, client_id };
        let requests = requests_key(E::KIND, id.into());

        self.connection.issue("CANCEL_NOTIFICATIONS", move |backend| async move {
            update_requests::<E, _>(backend.as_ref(), &requests, |set| {
                set.retain(|r| *r != request)
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation() {
        let id = UniqueId::from_binary(&[7u8; 20]).unwrap();
        assert_eq!(entry_key(TableKind::Object, id), format!("OBJECT:{}", "07".repeat(20)));
        assert_ne!(entry_key(TableKind::Task, id), entry_key(TableKind::Heartbeat, id));
        assert_eq!(
            requests_key(TableKind::Task, id),
            format!("TASK:NOTIFY:{}", "07".repeat(20))
        );
    }

    #[test]
    fn test_channel_names() {
        let job = JobId::from_random();
        let client = ClientId::from_random();
        assert_eq!(
            channel_name(TableKind::Object, job, ClientId::nil()),
            format!("OBJECT_PUBSUB:{}", job.hex())
        );
        assert_eq!(
            channel_name(TableKind::Object, job, client),
            format!("OBJECT_PUBSUB:{}:{}", job.hex(), client.hex())
        );
        assert_ne!(
            channel_name(TableKind::Object, job, ClientId::nil()),
            channel_name(TableKind::Client, job, ClientId::nil())
        );
    }

    #[tokio::test]
    async fn test_indexed_publication_carries_position() {
        use crate::backend::MemoryBackend;
        use crate::tables::object::ObjectTableData;

        let backend = MemoryBackend::new();
        let job = JobId::from_random();
        let id = crate::id::ObjectId::from_random();
        let data = ObjectTableData::new(["A"]);

        let publication = write_publication(&backend, job, id, &data, true).await.unwrap();
        assert_eq!(
            publication.channels,
            vec![
                channel_name(TableKind::Object, job, ClientId::nil()),
                channel_name(TableKind::Object, JobId::nil(), ClientId::nil()),
            ]
        );

        let envelope: Envelope<crate::id::ObjectId, ObjectTableData> =
            decode::<ObjectTableData, _>(&publication.message(Some(3))).unwrap();
        assert_eq!(envelope.id, id);
        assert_eq!(envelope.index, Some(3));
        assert_eq!(envelope.data, data);

        let keyed = write_publication(&backend, JobId::nil(), id, &data, false).await.unwrap();
        assert_eq!(keyed.channels.len(), 1);
        let envelope: Envelope<crate::id::ObjectId, ObjectTableData> =
            decode::<ObjectTableData, _>(&keyed.message(None)).unwrap();
        assert_eq!(envelope.index, None);
    }
}
