//! Collaborator seams of the connection registry.
//!
//! The registry never speaks a wire protocol itself.  It is handed a
//! [`Connector`] that dials parts and yields [`MachineClient`]s, and a
//! [`PendingWork`] sink that cancels request work tagged with a part.
//!
//! # Overview
//!
//! - [`Connector`] – `connect(config) -> client`, failing with
//!   [`PartSyncError::ConnectFailed`] or [`PartSyncError::Aborted`].
//! - [`MachineClient`] – a live connection: disconnect, state-change
//!   notifications and the method surface used by the query layer, including
//!   server-streaming methods that yield a [`ChunkStream`].
//! - [`PartClient`] – a client paired with the part that owns it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use partsync_types::{
    ConnectionConfig, ConnectionEvent, MachineStatus, PartId, PartSyncError, ResourceName,
};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Items of a server-streaming call, in arrival order.
pub type ChunkStream = BoxStream<'static, Result<Value, PartSyncError>>;

/// Dials a part described by a [`ConnectionConfig`].
///
/// # Contract
///
/// * Implementations should poll `config.is_aborted()` while dialling and give
///   up with [`PartSyncError::Aborted`] once it fires.  The registry discards
///   the result of an aborted attempt either way.
/// * Reconnection knobs on the config are passed through untouched.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig)
    -> Result<Arc<dyn MachineClient>, PartSyncError>;
}

/// A live connection to one part.
#[async_trait]
pub trait MachineClient: Send + Sync {
    /// Close the connection.
    async fn disconnect(&self) -> Result<(), PartSyncError>;

    /// Subscribe to transport-level connection state changes.
    fn subscribe_state(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// `true` when `method` can be invoked on `resource` (or on the machine
    /// itself when `resource` is `None`).  Must not touch the network.
    fn has_method(&self, resource: Option<&str>, method: &str) -> bool;

    /// Invoke `method` with JSON-encoded `args`.
    async fn invoke(
        &self,
        resource: Option<&str>,
        method: &str,
        args: Value,
    ) -> Result<Value, PartSyncError>;

    /// Open a server-streaming `method`.  Clients without streaming methods
    /// keep the default, which reports every method as missing.
    async fn invoke_stream(
        &self,
        resource: Option<&str>,
        method: &str,
        args: Value,
    ) -> Result<ChunkStream, PartSyncError> {
        let _ = (resource, args);
        Err(PartSyncError::MethodNotFound {
            method: method.to_string(),
        })
    }

    async fn resource_names(&self) -> Result<Vec<ResourceName>, PartSyncError>;

    async fn machine_status(&self) -> Result<MachineStatus, PartSyncError>;
}

/// Cancels outstanding request work associated with a part.
///
/// The registry awaits this alongside `MachineClient::disconnect` so no
/// request tagged with the part outlives its connection.
#[async_trait]
pub trait PendingWork: Send + Sync {
    async fn cancel_pending(&self, part_id: &PartId);
}

/// [`PendingWork`] sink for registries that run without a request cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPendingWork;

#[async_trait]
impl PendingWork for NoPendingWork {
    async fn cancel_pending(&self, _part_id: &PartId) {}
}

/// A [`MachineClient`] tagged with the part it belongs to.
///
/// Downstream caches key their entries by [`PartClient::part_id`].  The
/// `session` distinguishes successive connections to the same part.
#[derive(Clone)]
pub struct PartClient {
    part_id: PartId,
    session: Uuid,
    connected_at: DateTime<Utc>,
    client: Arc<dyn MachineClient>,
}

impl PartClient {
    pub fn new(part_id: PartId, client: Arc<dyn MachineClient>) -> Self {
        Self {
            part_id,
            session: Uuid::new_v4(),
            connected_at: Utc::now(),
            client,
        }
    }

    pub fn part_id(&self) -> &PartId {
        &self.part_id
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn client(&self) -> &Arc<dyn MachineClient> {
        &self.client
    }
}

impl fmt::Debug for PartClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartClient")
            .field("part_id", &self.part_id)
            .field("session", &self.session)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}
