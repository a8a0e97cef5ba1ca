//! Append-only tables
//!
//! Every append adds a record to the list stored under the entry id and is
//! published with its 1-based log position. Nothing is ever overwritten.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use super::{decode, encode, entry_key, subscribe_channel, write_publication, TableEntry};
use crate::connection::Connection;
use crate::dispatch::{Completion, Subscription};
use crate::error::Result;
use crate::id::{ClientId, JobId};
use crate::metrics::standard;

/// Table whose entries are append-only histories
pub struct Log<E: TableEntry> {
    connection: Arc<Connection>,
    _entry: PhantomData<fn() -> E>,
}

impl<E: TableEntry> Clone for Log<E> {
    fn clone(&self) -> Self {
        Self::new(self.connection.clone())
    }
}

impl<E: TableEntry> Log<E> {
    pub(crate) fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            _entry: PhantomData,
        }
    }

    /// Append `entry` to the history of `id` and publish it.
    ///
    /// Resolves with the entry's log position.
    pub fn append(&self, job_id: JobId, id: E::Id, entry: E) -> Result<Completion<u64>> {
        entry.validate_for(&id)?;
        let payload = encode::<E>(&entry)?;
        let key = entry_key(E::KIND, id.into());

        self.connection.issue("APPEND", move |backend| async move {
            let publication = write_publication(backend.as_ref(), job_id, id, &entry, true).await?;
            let index = backend.append_and_publish(&key, payload, &publication).await?;
            debug!("Appended {} entry {} at {}", E::KIND.name(), id, index);
            Ok(index)
        })
    }

    /// Read the full history of `id`, oldest first. A miss is an empty list.
    pub fn lookup(&self, _job_id: JobId, id: E::Id) -> Result<Completion<Vec<E>>> {
        let key = entry_key(E::KIND, id.into());

        self.connection.issue("LOOKUP", move |backend| async move {
            let entries = backend
                .range(&key)
                .await?
                .iter()
                .map(|bytes| decode::<E, E>(bytes))
                .collect::<Result<Vec<E>>>()?;
            if entries.is_empty() {
                standard::LOOKUP_MISSES.inc();
            }
            Ok(entries)
        })
    }

    /// Subscribe to appends for `job_id` (nil = all jobs)
    pub fn subscribe(
        &self,
        job_id: JobId,
        client_filter: ClientId,
    ) -> Result<Subscription<E::Id, E>> {
        subscribe_channel::<E>(&self.connection, job_id, client_filter)
    }
}
