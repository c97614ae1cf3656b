//! `partsync-types` – shared data model for the partsync workspace.
//!
//! Everything that crosses a crate boundary lives here: part identifiers,
//! connection configs and states, the machine-status payloads returned by a
//! connected part, and the [`PartSyncError`] taxonomy.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque identifier of one remote machine part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartId(String);

impl PartId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PartId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for PartId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of the connection to one part.
///
/// Every part the registry has seen holds exactly one of these.  Parts that
/// were never seen read as [`ConnectionState::Disconnected`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// `true` while a client is being dialled or is live.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(label)
    }
}

/// A connection-state change reported asynchronously by a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub state: ConnectionState,
}

impl ConnectionEvent {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            state,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Connection config
// ────────────────────────────────────────────────────────────────────────────

/// Shared cancellation flag for an in-flight connection attempt.
///
/// Clones observe the same flag.  A connector polls [`is_aborted`] while it
/// dials; the registry checks it again before publishing a client.
///
/// [`is_aborted`]: AbortSignal::is_aborted
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `true` when both handles refer to the same flag.
    pub fn same_as(&self, other: &AbortSignal) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Credentials presented when dialling a part.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// e.g. `"api-key"` or `"robot-location-secret"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_entity: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("kind", &self.kind)
            .field("payload", &"<redacted>")
            .field("auth_entity", &self.auth_entity)
            .finish()
    }
}

/// How to reach one part.
///
/// Configs are compared by value (see `partsync_connect::deep_equal`), never
/// by identity.  The abort signal is runtime state and takes no part in the
/// comparison or in serialisation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signaling_address: Option<String>,

    /// Passed through to the transport unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_max_attempts: Option<u32>,

    /// Passed through to the transport unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_max_wait_ms: Option<u64>,

    /// Transport-specific options the core does not interpret.
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,

    #[serde(skip)]
    pub abort_signal: Option<AbortSignal>,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_signaling_address(mut self, address: impl Into<String>) -> Self {
        self.signaling_address = Some(address.into());
        self
    }

    pub fn with_abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort_signal = Some(signal);
        self
    }

    /// `true` when an abort signal is attached and has fired.
    pub fn is_aborted(&self) -> bool {
        self.abort_signal.as_ref().is_some_and(AbortSignal::is_aborted)
    }

    /// The serialisable part of the config as a JSON value.
    pub fn to_value(&self) -> Result<serde_json::Value, PartSyncError> {
        serde_json::to_value(self).map_err(|e| PartSyncError::Serialization(e.to_string()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Machine payloads
// ────────────────────────────────────────────────────────────────────────────

/// Fully qualified name of a resource (component or service) on a part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceName {
    pub namespace: String,
    /// `"component"` or `"service"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub subtype: String,
    /// Remote resources carry a `remote:` prefix.
    pub name: String,
}

impl ResourceName {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        subtype: impl Into<String>,
    ) -> Self {
        Self {
            namespace: "rdk".to_string(),
            kind: kind.into(),
            subtype: subtype.into(),
            name: name.into(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.name.contains(':')
    }
}

/// Health of a single resource as reported in a [`MachineStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub name: Option<ResourceName>,
    pub state: String,
    #[serde(default)]
    pub revision: String,
}

/// Snapshot of a part's running config and resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub config_revision: String,
    pub state: String,
    pub resources: Vec<ResourceStatus>,
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error type shared by the registry, the query layer and the transports.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartSyncError {
    #[error("Connection to {host} failed: {details}")]
    ConnectFailed { host: String, details: String },

    #[error("Disconnect from part {part} failed: {details}")]
    DisconnectFailed { part: PartId, details: String },

    #[error("Connection attempt to {0} was aborted")]
    Aborted(String),

    #[error("No client connected for part {0}")]
    NoClient(PartId),

    #[error("no connection registry available")]
    NoRegistry,

    #[error("{method} is not a method on the resource client.")]
    MethodNotFound { method: String },

    #[error("Unknown query {0}")]
    UnknownQuery(String),

    #[error("Query {0} is disabled")]
    QueryDisabled(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),
}
