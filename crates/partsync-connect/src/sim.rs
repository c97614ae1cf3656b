//! [`SimConnector`] – in-process simulated fleet.
//!
//! Lets the registry, the query layer and the CLI run end to end without a
//! real transport.  Every host is a [`SimMachine`]; connecting to it yields a
//! [`SimClient`] that answers a small method surface from the machine's
//! definition.
//!
//! # Stub behaviour
//!
//! | Method | Target | Reply |
//! |---|---|---|
//! | `getMachineStatus` | machine | revision, `"running"`, one `"ready"` status per resource |
//! | `resourceNames` | machine | the machine's resources |
//! | `getVersion` | machine | `{"version": "sim", "platform": "partsync-sim"}` |
//! | `doCommand` | any resource | echoes its arguments |
//! | per-subtype methods | resource | fixed placeholder values (see [`subtype_methods`]) |
//! | per-subtype streams | resource | `args.count` chunks, default 3 (see [`subtype_streams`]) |
//!
//! Machine edits made through the connector (revision bumps, taking a host
//! offline) are visible to clients that are already connected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use partsync_types::{
    ConnectionConfig, ConnectionEvent, ConnectionState, MachineStatus, PartSyncError,
    ResourceName, ResourceStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::debug;

use crate::client::{ChunkStream, Connector, MachineClient};
use crate::state_bus::StateBus;

/// How often an in-flight connect re-checks its abort signal.
const ABORT_POLL: Duration = Duration::from_millis(10);

const MACHINE_METHODS: &[&str] = &["getMachineStatus", "resourceNames", "getVersion"];

/// Methods a resource of `subtype` answers besides `doCommand`.
pub fn subtype_methods(subtype: &str) -> &'static [&'static str] {
    match subtype {
        "arm" => &["getEndPosition", "moveToPosition", "isMoving", "stop"],
        "base" => &["moveStraight", "spin", "isMoving", "stop"],
        "camera" => &["getImage", "getProperties"],
        "motor" => &["setPower", "goFor", "getPosition", "isMoving", "stop"],
        "sensor" | "movement_sensor" => &["getReadings"],
        _ => &[],
    }
}

/// Server-streaming methods a resource of `subtype` answers.
pub fn subtype_streams(subtype: &str) -> &'static [&'static str] {
    match subtype {
        "camera" => &["getImages"],
        "sensor" | "movement_sensor" => &["streamReadings"],
        _ => &[],
    }
}

const DEFAULT_STREAM_CHUNKS: u64 = 3;

fn default_revision() -> String {
    "1".to_string()
}

/// Definition of one simulated host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimMachine {
    pub host: String,
    #[serde(default)]
    pub resources: Vec<ResourceName>,
    #[serde(default = "default_revision")]
    pub revision: String,
    /// Time a connect takes before it succeeds.
    #[serde(default)]
    pub latency_ms: u64,
    /// Offline hosts refuse connections.
    #[serde(default)]
    pub offline: bool,
}

impl SimMachine {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            resources: Vec::new(),
            revision: default_revision(),
            latency_ms: 0,
            offline: false,
        }
    }

    pub fn with_resource(mut self, resource: ResourceName) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    fn status(&self) -> MachineStatus {
        MachineStatus {
            config_revision: self.revision.clone(),
            state: "running".to_string(),
            resources: self
                .resources
                .iter()
                .map(|name| ResourceStatus {
                    name: Some(name.clone()),
                    state: "ready".to_string(),
                    revision: self.revision.clone(),
                })
                .collect(),
        }
    }
}

type Machines = Arc<RwLock<HashMap<String, SimMachine>>>;

// ────────────────────────────────────────────────────────────────────────────
// SimConnector
// ────────────────────────────────────────────────────────────────────────────

/// [`Connector`] over a set of [`SimMachine`]s keyed by host.
#[derive(Clone, Default)]
pub struct SimConnector {
    machines: Machines,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_machine(self, machine: SimMachine) -> Self {
        self.add_machine(machine);
        self
    }

    /// Register (or replace) the machine for `machine.host`.
    pub fn add_machine(&self, machine: SimMachine) {
        self.machines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(machine.host.clone(), machine);
    }

    pub fn machine(&self, host: &str) -> Option<SimMachine> {
        lookup(&self.machines, host)
    }

    /// Every registered host, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .machines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        hosts.sort();
        hosts
    }

    /// Change a machine's config revision.  Returns `false` for unknown hosts.
    pub fn set_revision(&self, host: &str, revision: impl Into<String>) -> bool {
        self.edit(host, |m| m.revision = revision.into())
    }

    /// Mark a host as offline (refusing new connections) or back online.
    pub fn set_offline(&self, host: &str, offline: bool) -> bool {
        self.edit(host, |m| m.offline = offline)
    }

    fn edit(&self, host: &str, f: impl FnOnce(&mut SimMachine)) -> bool {
        let mut machines = self.machines.write().unwrap_or_else(PoisonError::into_inner);
        match machines.get_mut(host) {
            Some(machine) => {
                f(machine);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn MachineClient>, PartSyncError> {
        let host = config.host.clone();
        let machine = self.machine(&host).ok_or_else(|| PartSyncError::ConnectFailed {
            host: host.clone(),
            details: "unknown host".to_string(),
        })?;

        let mut remaining = machine.latency();
        while !remaining.is_zero() {
            if config.is_aborted() {
                return Err(PartSyncError::Aborted(host));
            }
            let step = remaining.min(ABORT_POLL);
            tokio::time::sleep(step).await;
            remaining -= step;
        }
        if config.is_aborted() {
            return Err(PartSyncError::Aborted(host));
        }

        // Re-read: the machine may have gone offline while we were dialling.
        if self.machine(&host).is_none_or(|m| m.offline) {
            return Err(PartSyncError::ConnectFailed {
                host,
                details: "machine is offline".to_string(),
            });
        }

        debug!(host = %host, "simulated connection established");
        Ok(Arc::new(SimClient::new(host, Arc::clone(&self.machines))))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimClient
// ────────────────────────────────────────────────────────────────────────────

/// [`MachineClient`] backed by a [`SimMachine`].
pub struct SimClient {
    host: String,
    machines: Machines,
    bus: StateBus,
    closed: AtomicBool,
    readings: AtomicU64,
}

impl SimClient {
    fn new(host: String, machines: Machines) -> Self {
        Self {
            host,
            machines,
            bus: StateBus::default(),
            closed: AtomicBool::new(false),
            readings: AtomicU64::new(0),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Report a transport-level drop without closing the client.
    pub fn simulate_drop(&self) {
        self.bus.publish(ConnectionState::Disconnected);
    }

    /// Report that the transport reconnected on its own.
    pub fn simulate_recovery(&self) {
        self.bus.publish(ConnectionState::Connected);
    }

    fn machine(&self) -> Result<SimMachine, PartSyncError> {
        if self.is_closed() {
            return Err(PartSyncError::Request(format!("client for {} is closed", self.host)));
        }
        lookup(&self.machines, &self.host)
            .ok_or_else(|| PartSyncError::Request(format!("machine {} no longer exists", self.host)))
    }

    fn respond(&self, subtype: &str, method: &str, args: Value) -> Value {
        match (subtype, method) {
            (_, "doCommand") => args,
            (_, "isMoving") => json!(false),
            (_, "getPosition") => json!(0.0),
            (_, "getReadings") => {
                let n = self.readings.fetch_add(1, Ordering::SeqCst);
                json!({ "reading": n })
            }
            (_, "getEndPosition") => json!({ "x": 0.0, "y": 0.0, "z": 0.0 }),
            (_, "getImage") => json!({ "mime_type": "image/jpeg", "bytes": 0 }),
            (_, "getProperties") => json!({ "supports_pcd": false }),
            _ => Value::Null,
        }
    }
}

fn lookup(machines: &Machines, host: &str) -> Option<SimMachine> {
    machines
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(host)
        .cloned()
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, PartSyncError> {
    serde_json::to_value(value).map_err(|e| PartSyncError::Serialization(e.to_string()))
}

#[async_trait]
impl MachineClient for SimClient {
    async fn disconnect(&self) -> Result<(), PartSyncError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(host = %self.host, "simulated connection closed");
            self.bus.publish(ConnectionState::Disconnected);
        }
        Ok(())
    }

    fn subscribe_state(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.bus.subscribe()
    }

    fn has_method(&self, resource: Option<&str>, method: &str) -> bool {
        match resource {
            None => MACHINE_METHODS.contains(&method),
            Some(name) => lookup(&self.machines, &self.host)
                .and_then(|m| m.resources.into_iter().find(|r| r.name == name))
                .is_some_and(|r| {
                    method == "doCommand"
                        || subtype_methods(&r.subtype).contains(&method)
                        || subtype_streams(&r.subtype).contains(&method)
                }),
        }
    }

    async fn invoke(&self, resource: Option<&str>, method: &str, args: Value) -> Result<Value, PartSyncError> {
        let machine = self.machine()?;
        if !self.has_method(resource, method) {
            return Err(PartSyncError::MethodNotFound {
                method: method.to_string(),
            });
        }
        match resource {
            None => match method {
                "getMachineStatus" => to_json(&machine.status()),
                "resourceNames" => to_json(&machine.resources),
                _ => Ok(json!({ "version": "sim", "platform": "partsync-sim" })),
            },
            Some(name) => {
                let subtype = machine
                    .resources
                    .iter()
                    .find(|r| r.name == name)
                    .map(|r| r.subtype.as_str())
                    .unwrap_or_default();
                Ok(self.respond(subtype, method, args))
            }
        }
    }

    async fn invoke_stream(
        &self,
        resource: Option<&str>,
        method: &str,
        args: Value,
    ) -> Result<ChunkStream, PartSyncError> {
        let machine = self.machine()?;
        let subtype = resource
            .and_then(|name| machine.resources.iter().find(|r| r.name == name))
            .map(|r| r.subtype.clone())
            .filter(|subtype| subtype_streams(subtype).contains(&method))
            .ok_or_else(|| PartSyncError::MethodNotFound {
                method: method.to_string(),
            })?;

        let count = args.get("count").and_then(Value::as_u64).unwrap_or(DEFAULT_STREAM_CHUNKS);
        let chunks: Vec<Result<Value, PartSyncError>> = (0..count)
            .map(|i| match subtype.as_str() {
                "camera" => Ok(json!({ "frame": i, "mime_type": "image/jpeg" })),
                _ => Ok(json!({ "reading": i })),
            })
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn resource_names(&self) -> Result<Vec<ResourceName>, PartSyncError> {
        Ok(self.machine()?.resources)
    }

    async fn machine_status(&self) -> Result<MachineStatus, PartSyncError> {
        Ok(self.machine()?.status())
    }
}
