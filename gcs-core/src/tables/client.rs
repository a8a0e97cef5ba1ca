//! Client table and membership protocol
//!
//! Membership is one append-only log under a well-known key. A client
//! joins by appending an insertion record and leaves by appending a
//! tombstone for the same id. Every process folds the log and its
//! notifications into a local cache and fans changes out to callbacks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{Log, TableEntry, TableKind};
use crate::connection::{Connection, Liveness};
use crate::dispatch::{Completion, Notification, Subscription};
use crate::error::{GcsError, Result};
use crate::id::{ClientId, JobId};
use crate::metrics::standard;

/// One membership record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTableData {
    pub client_id: ClientId,
    /// `true` for a join record, `false` for a tombstone
    pub is_insertion: bool,
    pub node_manager_address: String,
    pub node_manager_port: u16,
    pub object_manager_port: u16,
}

impl ClientTableData {
    /// Join record with no network info yet
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            is_insertion: true,
            node_manager_address: String::new(),
            node_manager_port: 0,
            object_manager_port: 0,
        }
    }

    /// Tombstone carrying the same network info
    pub fn tombstone(&self) -> Self {
        Self {
            is_insertion: false,
            ..self.clone()
        }
    }
}

impl TableEntry for ClientTableData {
    type Id = ClientId;
    const KIND: TableKind = TableKind::Client;

    fn validate(&self) -> Result<()> {
        if self.client_id.is_nil() {
            return Err(GcsError::InvalidArgument {
                reason: "membership record needs a non-nil client id".into(),
            });
        }
        Ok(())
    }
}

/// Observer of membership changes
pub type ClientCallback = Arc<dyn Fn(&ClientId, &ClientTableData) + Send + Sync>;

/// Every client appends to the log stored under this id
fn membership_log_id() -> ClientId {
    ClientId::nil()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connected,
    Disconnected,
}

struct LocalState {
    info: ClientTableData,
    phase: Phase,
}

struct CachedRecord {
    index: u64,
    data: ClientTableData,
}

/// Local view of the cluster membership.
///
/// Holds no connection handle so the task folding notifications into it
/// does not keep the connection alive. Only the liveness token is shared,
/// and no callback runs once it reports the release.
///
/// Lock order is `cache`, then `added` / `removed`.
struct Membership {
    local_id: ClientId,
    liveness: Liveness,
    local: Mutex<LocalState>,
    cache: Mutex<HashMap<ClientId, CachedRecord>>,
    added: Mutex<Vec<ClientCallback>>,
    removed: Mutex<Vec<ClientCallback>>,
}

impl Membership {
    fn new(local_id: ClientId, liveness: Liveness) -> Self {
        Self {
            local_id,
            liveness,
            local: Mutex::new(LocalState {
                info: ClientTableData::new(local_id),
                phase: Phase::Idle,
            }),
            cache: Mutex::new(HashMap::new()),
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    /// Fold one log record into the cache and notify observers.
    ///
    /// Records are applied in log order per client; a record at or before
    /// the cached position was already seen (bootstrap and notification
    /// overlap) and is skipped.
    fn apply(&self, index: u64, data: ClientTableData) {
        let client_id = data.client_id;
        // Callbacks are picked under the cache lock so a concurrent
        // registration sees this record either in its replay or here
        let callbacks = {
            let mut cache = self.cache.lock();
            if let Some(cached) = cache.get(&client_id) {
                if cached.index >= index {
                    debug!("Skipping membership record {} for {}", index, client_id);
                    return;
                }
            }
            cache.insert(
                client_id,
                CachedRecord {
                    index,
                    data: data.clone(),
                },
            );
            let live = cache.values().filter(|r| r.data.is_insertion).count();
            standard::LIVE_CLIENTS.set(live as i64);
            if data.is_insertion {
                self.added.lock().clone()
            } else {
                self.removed.lock().clone()
            }
        };

        if data.is_insertion {
            info!("Client {} joined at {}", client_id, data.node_manager_address);
        } else {
            info!("Client {} left", client_id);
        }
        for callback in callbacks {
            if !self.liveness.is_alive() {
                return;
            }
            callback(&client_id, &data);
        }
    }

    /// Add an added-callback and return the live clients it has not seen
    fn register_added(&self, callback: ClientCallback) -> Vec<ClientTableData> {
        let cache = self.cache.lock();
        self.added.lock().push(callback);
        cache
            .values()
            .filter(|r| r.data.is_insertion)
            .map(|r| r.data.clone())
            .collect()
    }

    fn register_removed(&self, callback: ClientCallback) {
        let _cache = self.cache.lock();
        self.removed.lock().push(callback);
    }

    fn get(&self, client_id: &ClientId) -> Option<ClientTableData> {
        self.cache.lock().get(client_id).map(|r| r.data.clone())
    }

    fn snapshot(&self) -> Vec<ClientTableData> {
        self.cache.lock().values().map(|r| r.data.clone()).collect()
    }
}

/// Commands queued by `connect`, in issue order
struct JoinCommands {
    subscription: Subscription<ClientId, ClientTableData>,
    joined: Completion<u64>,
    bootstrap: Completion<Vec<ClientTableData>>,
}

/// Membership protocol for the local client
#[derive(Clone)]
pub struct ClientTable {
    connection: Arc<Connection>,
    log: Log<ClientTableData>,
    membership: Arc<Membership>,
}

impl ClientTable {
    pub(crate) fn new(connection: Arc<Connection>, local_id: ClientId) -> Self {
        Self {
            log: Log::new(connection.clone()),
            membership: Arc::new(Membership::new(local_id, connection.liveness())),
            connection,
        }
    }

    /// Underlying membership log
    pub fn log(&self) -> &Log<ClientTableData> {
        &self.log
    }

    /// Join the cluster with `info` and start tracking membership.
    ///
    /// The subscription, the join append and the bootstrap read are queued
    /// in that order, so the join is committed only once the subscription
    /// is active and this process observes its own join. Resolves once the
    /// existing log has been folded into the cache.
    pub fn connect(&self, info: ClientTableData) -> Result<Completion<()>> {
        let local_id = self.membership.local_id;
        if info.client_id != local_id {
            return Err(GcsError::InvalidArgument {
                reason: format!("connect info is for {}, local client is {}", info.client_id, local_id),
            });
        }
        if !info.is_insertion {
            return Err(GcsError::InvalidArgument {
                reason: "connect info must be an insertion record".into(),
            });
        }

        {
            let mut local = self.membership.local.lock();
            if local.phase != Phase::Idle {
                return Err(GcsError::AlreadyConnected {
                    client_id: local_id.hex(),
                });
            }
            local.info = info.clone();
            local.phase = Phase::Connected;
        }

        let issued = self.issue_join(info);
        if issued.is_err() {
            self.membership.local.lock().phase = Phase::Idle;
        }
        let JoinCommands {
            mut subscription,
            joined,
            bootstrap,
        } = issued?;

        let membership = self.membership.clone();
        let (done_tx, done_rx) = oneshot::channel();
        self.connection.spawn_tracked(async move {
            let setup = async {
                subscription.acknowledged().await?;
                let index = joined.await?;
                debug!("Client {} joined membership log at {}", membership.local_id, index);
                let records = bootstrap.await?;
                for (position, record) in records.into_iter().enumerate() {
                    membership.apply(position as u64 + 1, record);
                }
                Ok::<(), GcsError>(())
            };
            let result = setup.await;
            let failed = result.is_err();
            if let Err(e) = &result {
                warn!("Membership setup for {} failed: {}", membership.local_id, e);
            }
            let _ = done_tx.send(result);
            if failed {
                return;
            }

            while let Some(Notification { data, index, .. }) = subscription.next().await {
                match index {
                    Some(index) => membership.apply(index, data),
                    None => warn!("Membership notification for {} has no log index", data.client_id),
                }
            }
        })?;

        Ok(Completion::new("CONNECT", done_rx, self.connection.command_timeout())
            .bound_to(self.connection.liveness()))
    }

    fn issue_join(&self, info: ClientTableData) -> Result<JoinCommands> {
        let subscription = self.log.subscribe(JobId::nil(), ClientId::nil())?;
        let joined = self.log.append(JobId::nil(), membership_log_id(), info)?;
        let bootstrap = self.log.lookup(JobId::nil(), membership_log_id())?;
        Ok(JoinCommands {
            subscription,
            joined,
            bootstrap,
        })
    }

    /// Leave the cluster by appending a tombstone for the local client.
    ///
    /// Resolves with the tombstone's log position.
    pub fn disconnect(&self) -> Result<Completion<u64>> {
        let tombstone = {
            let mut local = self.membership.local.lock();
            if local.phase != Phase::Connected {
                return Err(GcsError::NotConnected {
                    client_id: self.membership.local_id.hex(),
                });
            }
            local.phase = Phase::Disconnected;
            local.info.tombstone()
        };
        info!("Client {} disconnecting", self.membership.local_id);
        self.log.append(JobId::nil(), membership_log_id(), tombstone)
    }

    /// Local client's own record, without a round trip
    pub fn local_client(&self) -> ClientTableData {
        self.membership.local.lock().info.clone()
    }

    pub fn local_client_id(&self) -> ClientId {
        self.membership.local_id
    }

    /// Whether the local client has joined and not yet left
    pub fn is_connected(&self) -> bool {
        self.membership.local.lock().phase == Phase::Connected
    }

    /// Most recent cached record for `client_id`
    pub fn get_client(&self, client_id: &ClientId) -> Option<ClientTableData> {
        self.membership.get(client_id)
    }

    /// Latest cached record of every client seen so far
    pub fn clients(&self) -> Vec<ClientTableData> {
        self.membership.snapshot()
    }

    /// Observe joins. Runs right away for clients already cached as live.
    pub fn register_client_added_callback<F>(&self, callback: F)
    where
        F: Fn(&ClientId, &ClientTableData) + Send + Sync + 'static,
    {
        let callback: ClientCallback = Arc::new(callback);
        for client in self.membership.register_added(callback.clone()) {
            if !self.membership.liveness.is_alive() {
                return;
            }
            callback(&client.client_id, &client);
        }
    }

    /// Observe departures
    pub fn register_client_removed_callback<F>(&self, callback: F)
    where
        F: Fn(&ClientId, &ClientTableData) + Send + Sync + 'static,
    {
        self.membership.register_removed(Arc::new(callback));
    }
}
