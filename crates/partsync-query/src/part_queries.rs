//! [`PartQueries`] – one robot-level query per known part.
//!
//! Follows the registry: a part that appears gets a query keyed
//! `["partsync", "partID", <part>, "robotClient", <method>]`, a part that
//! disappears loses it.  The query is enabled while the part has a connected
//! client and its [`QueryKind`] toggle is on, and is fetched whenever it
//! becomes enabled or the part's client is replaced.  With an interval
//! receiver every enabled query is also polled; its polling session is
//! started afresh on each of those transitions, so a session that stopped
//! after a failed refetch resumes once the part reconnects.

use std::collections::HashMap;
use std::sync::Arc;

use partsync_connect::{ConnectionRegistry, PartClient, RegistrySnapshot};
use partsync_types::{PartId, PartSyncError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{QueryCache, QueryFn, QueryResult, QueryState};
use crate::context::FleetContext;
use crate::key::QueryKey;
use crate::polling::{Interval, PollHandle, Poller};
use crate::toggles::{QueryKind, QueryToggles};

pub type PartStates = HashMap<PartId, QueryState>;

type MakeQuery = Box<dyn Fn(&PartId) -> QueryFn + Send + Sync>;

/// Key of the robot-level `method` query for `part_id`.
pub fn robot_key(part_id: &PartId, method: &str) -> QueryKey {
    QueryKey::part(part_id).push("robotClient").push(method)
}

pub struct PartQueries {
    method: &'static str,
    cache: Arc<QueryCache>,
    states: watch::Receiver<PartStates>,
    driver: JoinHandle<()>,
}

impl PartQueries {
    pub(crate) fn spawn<F>(
        ctx: &FleetContext,
        method: &'static str,
        kind: QueryKind,
        interval: Option<watch::Receiver<Interval>>,
        make_query: F,
    ) -> Result<Self, PartSyncError>
    where
        F: Fn(&PartId) -> QueryFn + Send + Sync + 'static,
    {
        let registry = Arc::clone(ctx.registry()?);
        let (states_tx, states) = watch::channel(PartStates::new());
        let driver = Driver {
            method,
            kind,
            registry,
            cache: Arc::clone(ctx.cache()),
            poller: ctx.poller(),
            interval,
            make_query: Box::new(make_query),
            states: Arc::new(states_tx),
            watched: HashMap::new(),
        };
        let toggles = ctx.enabled().subscribe();
        Ok(Self {
            method,
            cache: Arc::clone(ctx.cache()),
            states,
            driver: tokio::spawn(driver.run(toggles)),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<PartStates> {
        self.states.clone()
    }

    pub fn current(&self) -> PartStates {
        self.states.borrow().clone()
    }

    pub fn state(&self, part_id: &PartId) -> Option<QueryState> {
        self.states.borrow().get(part_id).cloned()
    }

    pub fn key(&self, part_id: &PartId) -> QueryKey {
        robot_key(part_id, self.method)
    }

    /// Fetch `part_id`'s query now.
    pub async fn refetch(&self, part_id: &PartId) -> QueryResult {
        self.cache.fetch(&self.key(part_id)).await
    }
}

impl Drop for PartQueries {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Driver
// ────────────────────────────────────────────────────────────────────────────

struct Watched {
    key: QueryKey,
    enabled: bool,
    /// Connection session of the client the query last ran against.
    session: Option<Uuid>,
    key_tx: watch::Sender<QueryKey>,
    /// Present only while the query is enabled.
    poll: Option<PollHandle>,
    forward: JoinHandle<()>,
}

impl Drop for Watched {
    fn drop(&mut self) {
        self.forward.abort();
    }
}

struct Driver {
    method: &'static str,
    kind: QueryKind,
    registry: Arc<ConnectionRegistry>,
    cache: Arc<QueryCache>,
    poller: Poller,
    interval: Option<watch::Receiver<Interval>>,
    make_query: MakeQuery,
    states: Arc<watch::Sender<PartStates>>,
    watched: HashMap<PartId, Watched>,
}

impl Driver {
    async fn run(mut self, mut toggles: watch::Receiver<QueryToggles>) {
        let mut snapshots = self.registry.subscribe();
        loop {
            let snapshot = snapshots.borrow_and_update().clone();
            let switched_on = toggles.borrow_and_update().is_enabled(self.kind);
            self.sync(&snapshot, switched_on);

            let open = tokio::select! {
                changed = snapshots.changed() => changed.is_ok(),
                changed = toggles.changed() => changed.is_ok(),
            };
            if !open {
                break;
            }
        }
    }

    fn sync(&mut self, snapshot: &RegistrySnapshot, switched_on: bool) {
        let parts = snapshot.part_ids();

        let gone: Vec<PartId> = self
            .watched
            .keys()
            .filter(|id| !parts.contains(id))
            .cloned()
            .collect();
        for part_id in gone {
            if let Some(watched) = self.watched.remove(&part_id) {
                self.cache.remove(&watched.key);
            }
            self.states.send_modify(|states| {
                states.remove(&part_id);
            });
        }

        for part_id in parts {
            let session = snapshot.client(&part_id).map(PartClient::session);
            let enabled = switched_on && session.is_some();
            if !self.watched.contains_key(&part_id) {
                let watched = self.watch(&part_id, enabled);
                self.watched.insert(part_id.clone(), watched);
            }
            let Some(watched) = self.watched.get_mut(&part_id) else {
                continue;
            };
            self.cache.set_enabled(&watched.key, enabled);

            let reconnected = session.is_some() && session != watched.session;
            if !enabled {
                watched.poll = None;
            } else if !watched.enabled || reconnected {
                debug!(part = %part_id, method = self.method, reconnected, "query enabled; fetching");
                watched.poll = self
                    .interval
                    .clone()
                    .map(|interval| self.poller.schedule_with(watched.key_tx.subscribe(), interval));
                let cache = Arc::clone(&self.cache);
                let key = watched.key.clone();
                tokio::spawn(async move {
                    // Outcome lands in the query state.
                    let _ = cache.fetch(&key).await;
                });
            }
            watched.enabled = enabled;
            if session.is_some() {
                watched.session = session;
            }
        }
    }

    fn watch(&self, part_id: &PartId, enabled: bool) -> Watched {
        let key = robot_key(part_id, self.method);
        let mut state_rx = self.cache.ensure(key.clone(), (self.make_query)(part_id), enabled);
        let (key_tx, _) = watch::channel(key.clone());

        let states = Arc::clone(&self.states);
        let owner = part_id.clone();
        let forward = tokio::spawn(async move {
            loop {
                let state = state_rx.borrow_and_update().clone();
                states.send_modify(|states| {
                    states.insert(owner.clone(), state);
                });
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        });

        Watched {
            key,
            enabled: false,
            session: None,
            key_tx,
            poll: None,
            forward,
        }
    }
}
