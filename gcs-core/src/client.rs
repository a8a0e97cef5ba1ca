//! GCS client
//!
//! Bundles one connection with the four tables that share it.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::info;

use crate::backend::{Backend, RedisBackend};
use crate::connection::{Connection, ConnectionState};
use crate::error::{GcsError, Result};
use crate::id::ClientId;
use crate::tables::client::ClientTable;
use crate::tables::heartbeat::HeartbeatTable;
use crate::tables::object::ObjectTable;
use crate::tables::task::TaskTable;

/// Client configuration
#[derive(Debug, Clone)]
pub struct GcsClientConfig {
    /// Host of the backing store
    pub address: String,
    /// Port of the backing store
    pub port: u16,
    /// Per-command timeout. `None` waits forever.
    pub command_timeout: Option<Duration>,
    /// Identity of this process. A random id is generated when unset.
    pub client_id: Option<ClientId>,
}

impl Default for GcsClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".into(),
            port: crate::DEFAULT_GCS_PORT,
            command_timeout: None,
            client_id: None,
        }
    }
}

impl GcsClientConfig {
    /// Read `GCS_ADDRESS`, `GCS_PORT`, `GCS_COMMAND_TIMEOUT_MS` and
    /// `GCS_CLIENT_ID`, falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let port = match std::env::var("GCS_PORT") {
            Ok(port) => port.parse().map_err(|e| GcsError::InvalidArgument {
                reason: format!("GCS_PORT={}: {}", port, e),
            })?,
            Err(_) => defaults.port,
        };
        let command_timeout = match std::env::var("GCS_COMMAND_TIMEOUT_MS") {
            Ok(millis) => Some(Duration::from_millis(millis.parse().map_err(|e| {
                GcsError::InvalidArgument {
                    reason: format!("GCS_COMMAND_TIMEOUT_MS={}: {}", millis, e),
                }
            })?)),
            Err(_) => defaults.command_timeout,
        };
        let client_id = match std::env::var("GCS_CLIENT_ID") {
            Ok(hex) => Some(ClientId::from_hex(&hex)?),
            Err(_) => None,
        };

        Ok(Self {
            address: std::env::var("GCS_ADDRESS").unwrap_or(defaults.address),
            port,
            command_timeout,
            client_id,
        })
    }
}

/// Client of the Global Control Store.
///
/// Dropping the client closes its connection: pending operations resolve
/// to `Disconnected` and no further callbacks run.
pub struct AsyncGcsClient {
    client_id: ClientId,
    connection: Arc<Connection>,
    object_table: ObjectTable,
    task_table: TaskTable,
    heartbeat_table: HeartbeatTable,
    client_table: ClientTable,
}

impl AsyncGcsClient {
    /// Connect to Redis at the configured address.
    ///
    /// Must be called from within the runtime that will drive the client.
    pub async fn connect(config: GcsClientConfig) -> Result<Self> {
        let backend = RedisBackend::connect(&config.address, config.port).await?;
        Ok(Self::with_backend(Arc::new(backend), Handle::current(), config))
    }

    /// Build a client over an existing backend, driven by `handle`
    pub fn with_backend(backend: Arc<dyn Backend>, handle: Handle, config: GcsClientConfig) -> Self {
        let client_id = config.client_id.unwrap_or_else(ClientId::from_random);
        let connection = Arc::new(Connection::new(backend, handle, config.command_timeout));
        info!("GCS client {} using {}", client_id, connection.endpoint());

        Self {
            client_id,
            object_table: ObjectTable::new(connection.clone()),
            task_table: TaskTable::new(connection.clone()),
            heartbeat_table: HeartbeatTable::new(connection.clone()),
            client_table: ClientTable::new(connection.clone(), client_id),
            connection,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn object_table(&self) -> &ObjectTable {
        &self.object_table
    }

    pub fn task_table(&self) -> &TaskTable {
        &self.task_table
    }

    pub fn heartbeat_table(&self) -> &HeartbeatTable {
        &self.heartbeat_table
    }

    pub fn client_table(&self) -> &ClientTable {
        &self.client_table
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Close the connection. Idempotent.
    pub fn shutdown(&self) {
        self.connection.close();
    }
}

impl Drop for AsyncGcsClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
