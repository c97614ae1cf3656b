//! [`ConnectionRegistry`] – one live client per part, kept in step with a
//! changing set of desired connection configs.
//!
//! # Reconciliation
//!
//! [`ConnectionRegistry::reconcile`] diffs the desired configs against the
//! last applied set with [`compare_part_ids`]:
//!
//! | Partition | Action |
//! |---|---|
//! | added | `connect` with the new config |
//! | removed | `disconnect`, aborting any in-flight attempt |
//! | unchanged | reconnect only when the config differs by value ([`deep_equal`]) |
//!
//! # Views
//!
//! The registry publishes a single [`RegistrySnapshot`] (clients and
//! connection states together) through a `watch` channel, so readers never
//! observe a client without its matching state.  Only the registry writes it.
//!
//! # Failure semantics
//!
//! Nothing here returns an error to the caller.  Connect failures are logged
//! and leave the part `Disconnected` until the next reconcile; disconnect
//! failures are logged and local state is cleared regardless.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use partsync_types::{AbortSignal, ConnectionConfig, ConnectionState, PartId, PartSyncError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::{Connector, MachineClient, PartClient, PendingWork};
use crate::compare::{PartIdDiff, compare_part_ids, deep_equal};
use crate::state_bus::StateSubscription;

// ────────────────────────────────────────────────────────────────────────────
// Snapshot
// ────────────────────────────────────────────────────────────────────────────

/// Read-only view of the registry.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    /// Connected clients.  A part with no entry has no client.
    pub clients: HashMap<PartId, PartClient>,
    /// State of every part the registry has seen.
    pub status: HashMap<PartId, ConnectionState>,
}

impl RegistrySnapshot {
    pub fn client(&self, part_id: &PartId) -> Option<&PartClient> {
        self.clients.get(part_id)
    }

    /// State of `part_id`; parts never seen are `Disconnected`.
    pub fn status(&self, part_id: &PartId) -> ConnectionState {
        self.status.get(part_id).copied().unwrap_or_default()
    }

    /// Every part the registry has seen, sorted.
    pub fn part_ids(&self) -> Vec<PartId> {
        let mut ids: Vec<PartId> = self.status.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn session_of(&self, part_id: &PartId) -> Option<uuid::Uuid> {
        self.clients.get(part_id).map(PartClient::session)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

struct Live {
    client: PartClient,
    subscription: StateSubscription,
}

#[derive(Default)]
struct Inner {
    /// Configs applied by the last reconcile, in input order.
    last: Vec<(PartId, ConnectionConfig)>,
    /// Abort handle of the in-flight connect for each part.
    attempts: HashMap<PartId, AbortSignal>,
    /// Clients this registry owns and has not started disconnecting.
    live: HashMap<PartId, Live>,
}

impl Inner {
    fn owns_attempt(&self, part_id: &PartId, signal: &AbortSignal) -> bool {
        self.attempts
            .get(part_id)
            .is_some_and(|current| current.same_as(signal))
    }

    fn is_busy(&self, part_id: &PartId) -> bool {
        self.attempts.contains_key(part_id) || self.live.contains_key(part_id)
    }
}

enum Op {
    Connect(PartId, ConnectionConfig),
    Disconnect(PartId, ConnectionConfig),
}

// ────────────────────────────────────────────────────────────────────────────
// ConnectionRegistry
// ────────────────────────────────────────────────────────────────────────────

/// Owns the live connection for every configured part.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use partsync_connect::{ConnectionRegistry, NoPendingWork, SimConnector, SimMachine};
/// use partsync_types::{ConnectionConfig, PartId};
///
/// # async fn run() {
/// let connector = SimConnector::new().with_machine(SimMachine::new("arm.local"));
/// let registry = ConnectionRegistry::new(Arc::new(connector), Arc::new(NoPendingWork));
///
/// registry
///     .reconcile([(PartId::from("arm"), ConnectionConfig::new("arm.local"))])
///     .await;
/// assert!(registry.client(&PartId::from("arm")).is_some());
///
/// registry.shutdown().await;
/// # }
/// ```
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    pending: Arc<dyn PendingWork>,
    snapshot: Arc<watch::Sender<RegistrySnapshot>>,
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>, pending: Arc<dyn PendingWork>) -> Self {
        let (snapshot, _) = watch::channel(RegistrySnapshot::default());
        Self {
            connector,
            pending,
            snapshot: Arc::new(snapshot),
            inner: Mutex::new(Inner::default()),
        }
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<RegistrySnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.snapshot.borrow().clone()
    }

    /// Part id to connected client.
    pub fn current(&self) -> HashMap<PartId, PartClient> {
        self.snapshot.borrow().clients.clone()
    }

    /// Part id to connection state.
    pub fn connection_status(&self) -> HashMap<PartId, ConnectionState> {
        self.snapshot.borrow().status.clone()
    }

    pub fn client(&self, part_id: &PartId) -> Option<PartClient> {
        self.snapshot.borrow().client(part_id).cloned()
    }

    pub fn status(&self, part_id: &PartId) -> ConnectionState {
        self.snapshot.borrow().status(part_id)
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Bring the held connections in line with `desired`.
    ///
    /// A part listed more than once is classified once, with its last config.
    /// The last-applied set is replaced before any connect or disconnect is
    /// awaited, so overlapping calls diff against each other's input.  Returns
    /// once every operation this call started has settled.
    pub async fn reconcile<I>(&self, desired: I) -> PartIdDiff<PartId>
    where
        I: IntoIterator<Item = (PartId, ConnectionConfig)>,
    {
        let desired = collect_desired(desired);

        let (diff, ops) = {
            let mut inner = self.lock();
            let current_ids: Vec<PartId> = desired.iter().map(|(id, _)| id.clone()).collect();
            let last_ids: Vec<PartId> = inner.last.iter().map(|(id, _)| id.clone()).collect();
            let diff = compare_part_ids(&current_ids, &last_ids);

            let mut ops = Vec::new();
            for id in &diff.added {
                if let Some(config) = lookup(&desired, id) {
                    ops.push(Op::Connect(id.clone(), config.clone()));
                }
            }
            for id in &diff.removed {
                if let Some(config) = lookup(&inner.last, id) {
                    ops.push(Op::Disconnect(id.clone(), config.clone()));
                }
            }
            for id in &diff.unchanged {
                if let (Some(old), Some(new)) = (lookup(&inner.last, id), lookup(&desired, id)) {
                    if config_changed(old, new) {
                        debug!(part = %id, "connection config changed; reconnecting");
                        ops.push(Op::Connect(id.clone(), new.clone()));
                    }
                }
            }

            inner.last = desired;
            (diff, ops)
        };

        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            unchanged = diff.unchanged.len(),
            operations = ops.len(),
            "reconciling parts"
        );

        join_all(ops.into_iter().map(|op| self.apply(op))).await;
        diff
    }

    async fn apply(&self, op: Op) {
        match op {
            Op::Connect(part_id, config) => self.connect(part_id, config).await,
            Op::Disconnect(part_id, config) => self.disconnect(&part_id, Some(&config)).await,
        }
    }

    // -----------------------------------------------------------------------
    // Connect / disconnect
    // -----------------------------------------------------------------------

    /// Open a connection to `part_id`, replacing any existing one.
    ///
    /// Never fails: errors are logged and leave the part `Disconnected`.  A
    /// newer `connect` or a `disconnect` for the same part aborts this
    /// attempt, and a client that arrives after the abort is closed instead
    /// of published.
    pub async fn connect(&self, part_id: PartId, mut config: ConnectionConfig) {
        self.disconnect(&part_id, Some(&config)).await;

        // Fresh handle so a stale abort does not cancel this attempt.
        let signal = AbortSignal::new();
        config.abort_signal = Some(signal.clone());
        {
            let mut inner = self.lock();
            if let Some(stale) = inner.attempts.insert(part_id.clone(), signal.clone()) {
                stale.abort();
            }
            self.set_status(&part_id, ConnectionState::Connecting);
        }
        info!(part = %part_id, host = %config.host, "connecting");

        match self.connector.connect(&config).await {
            Ok(client) => self.commit(part_id, &signal, client).await,
            Err(e) => {
                match &e {
                    PartSyncError::Aborted(_) => {
                        debug!(part = %part_id, "connection attempt aborted")
                    }
                    _ => error!(part = %part_id, host = %config.host, error = %e, "connection failed"),
                }
                let mut inner = self.lock();
                if inner.owns_attempt(&part_id, &signal) {
                    inner.attempts.remove(&part_id);
                    self.set_status(&part_id, ConnectionState::Disconnected);
                }
            }
        }
    }

    async fn commit(&self, part_id: PartId, signal: &AbortSignal, client: Arc<dyn MachineClient>) {
        let discarded = {
            let mut inner = self.lock();
            if signal.is_aborted() || !inner.owns_attempt(&part_id, signal) {
                Some(client)
            } else {
                inner.attempts.remove(&part_id);
                let part_client = PartClient::new(part_id.clone(), client);
                let subscription = self.watch_transport(&part_client);
                self.snapshot.send_modify(|s| {
                    s.clients.insert(part_id.clone(), part_client.clone());
                    s.status.insert(part_id.clone(), ConnectionState::Connected);
                });
                inner.live.insert(
                    part_id.clone(),
                    Live {
                        client: part_client,
                        subscription,
                    },
                );
                None
            }
        };

        match discarded {
            None => info!(part = %part_id, "connected"),
            Some(client) => {
                debug!(part = %part_id, "discarding client from aborted attempt");
                if let Err(e) = client.disconnect().await {
                    warn!(part = %part_id, error = %e, "failed to close discarded client");
                }
            }
        }
    }

    /// Close the connection to `part_id`.
    ///
    /// Aborts the abort signal on `config` and any in-flight attempt first.
    /// Without a live client this is a no-op apart from the abort.
    pub async fn disconnect(&self, part_id: &PartId, config: Option<&ConnectionConfig>) {
        if let Some(signal) = config.and_then(|c| c.abort_signal.as_ref()) {
            signal.abort();
        }

        let live = {
            let mut inner = self.lock();
            let aborted = inner
                .attempts
                .remove(part_id)
                .inspect(AbortSignal::abort)
                .is_some();
            match inner.live.remove(part_id) {
                Some(live) => {
                    self.set_status(part_id, ConnectionState::Disconnecting);
                    live
                }
                None => {
                    if aborted {
                        debug!(part = %part_id, "aborted in-flight connection");
                        self.set_status(part_id, ConnectionState::Disconnected);
                    }
                    return;
                }
            }
        };

        info!(part = %part_id, "disconnecting");
        let (result, ()) = tokio::join!(
            live.client.client().disconnect(),
            self.pending.cancel_pending(part_id)
        );
        if let Err(e) = result {
            warn!(part = %part_id, error = %e, "disconnect failed; clearing local state anyway");
        }
        drop(live.subscription);

        let session = live.client.session();
        let inner = self.lock();
        let superseded = inner.is_busy(part_id);
        self.snapshot.send_modify(|s| {
            if s.session_of(part_id) == Some(session) {
                s.clients.remove(part_id);
            }
            if !superseded {
                s.status.insert(part_id.clone(), ConnectionState::Disconnected);
            }
        });
        debug!(part = %part_id, "disconnected");
    }

    /// Disconnect every held client and abort every in-flight attempt.
    ///
    /// The last-applied config set is cleared, so a later reconcile treats
    /// every part as added.
    pub async fn shutdown(&self) {
        let parts: Vec<PartId> = {
            let mut inner = self.lock();
            inner.last.clear();
            let ids: HashSet<PartId> = inner
                .attempts
                .keys()
                .chain(inner.live.keys())
                .cloned()
                .collect();
            ids.into_iter().collect()
        };
        info!(parts = parts.len(), "shutting down connection registry");
        join_all(parts.iter().map(|id| self.disconnect(id, None))).await;
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, part_id: &PartId, state: ConnectionState) {
        self.snapshot.send_modify(|s| {
            s.status.insert(part_id.clone(), state);
        });
    }

    /// Forward transport notifications for this client into the status map.
    /// Events from a client that is no longer published are ignored.
    fn watch_transport(&self, part_client: &PartClient) -> StateSubscription {
        let snapshot = Arc::clone(&self.snapshot);
        let part_id = part_client.part_id().clone();
        let session = part_client.session();
        StateSubscription::spawn(
            part_id.to_string(),
            part_client.client().subscribe_state(),
            move |state| {
                snapshot.send_if_modified(|s| {
                    if s.session_of(&part_id) != Some(session) {
                        return false;
                    }
                    s.status.insert(part_id.clone(), state) != Some(state)
                });
            },
        )
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, signal) in inner.attempts.drain() {
            signal.abort();
        }
        if inner.live.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(parts = inner.live.len(), "registry dropped outside a runtime; clients not closed");
            return;
        };
        for (part_id, live) in inner.live.drain() {
            let client = Arc::clone(live.client.client());
            handle.spawn(async move {
                if let Err(e) = client.disconnect().await {
                    warn!(part = %part_id, error = %e, "disconnect on teardown failed");
                }
            });
        }
    }
}

fn collect_desired<I>(desired: I) -> Vec<(PartId, ConnectionConfig)>
where
    I: IntoIterator<Item = (PartId, ConnectionConfig)>,
{
    let mut out: Vec<(PartId, ConnectionConfig)> = Vec::new();
    for (id, config) in desired {
        match out.iter_mut().find(|(existing, _)| *existing == id) {
            Some(slot) => slot.1 = config,
            None => out.push((id, config)),
        }
    }
    out
}

fn lookup<'a>(configs: &'a [(PartId, ConnectionConfig)], id: &PartId) -> Option<&'a ConnectionConfig> {
    configs.iter().find(|(k, _)| k == id).map(|(_, c)| c)
}

fn config_changed(old: &ConnectionConfig, new: &ConnectionConfig) -> bool {
    match (old.to_value(), new.to_value()) {
        (Ok(old), Ok(new)) => !deep_equal(&old, &new),
        _ => true,
    }
}
