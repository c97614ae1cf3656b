//! [`QueryCache`] – keyed store of query functions and their latest results.
//!
//! # Overview
//!
//! - [`QueryCache::ensure`] registers a query (or replaces its function and
//!   enabled flag) and returns a `watch` receiver of its [`QueryState`].
//! - [`QueryCache::fetch`] runs a query.  Concurrent fetches of one key share
//!   a single in-flight future.
//! - [`QueryCache::refetch_matching`] fetches every enabled query under a key
//!   prefix; this is the polling scheduler's [`Refetch`] target.
//! - [`QueryCache::cancel_part`] aborts every in-flight fetch of a part and
//!   keeps previous data; this is the registry's [`PendingWork`] sink.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared, join_all};
use partsync_connect::PendingWork;
use partsync_types::{PartId, PartSyncError};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::key::QueryKey;
use crate::polling::Refetch;

pub type QueryResult = Result<Value, PartSyncError>;

/// Produces one run of a query.
pub type QueryFn = Arc<dyn Fn() -> BoxFuture<'static, QueryResult> + Send + Sync>;

/// Wrap an async closure as a [`QueryFn`].
pub fn query_fn<F, Fut>(f: F) -> QueryFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = QueryResult> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Latest observable state of one query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    /// Result of the last successful run.  Kept across errors and cancels.
    pub data: Option<Value>,
    /// Error of the last run, cleared by the next success.
    pub error: Option<PartSyncError>,
    pub fetching: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

struct InFlight {
    id: u64,
    future: Shared<BoxFuture<'static, QueryResult>>,
    abort: AbortHandle,
}

struct Entry {
    query_fn: QueryFn,
    enabled: bool,
    state: Arc<watch::Sender<QueryState>>,
    in_flight: Option<InFlight>,
}

type Entries = Arc<Mutex<HashMap<QueryKey, Entry>>>;

#[derive(Default)]
pub struct QueryCache {
    entries: Entries,
    next_id: AtomicU64,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key`, or update the function and enabled flag of an existing
    /// entry without touching its state.
    pub fn ensure(&self, key: QueryKey, query_fn: QueryFn, enabled: bool) -> watch::Receiver<QueryState> {
        let mut entries = lock(&self.entries);
        let entry = entries.entry(key).or_insert_with(|| Entry {
            query_fn: Arc::clone(&query_fn),
            enabled,
            state: Arc::new(watch::channel(QueryState::default()).0),
            in_flight: None,
        });
        entry.query_fn = query_fn;
        entry.enabled = enabled;
        entry.state.subscribe()
    }

    /// Returns `false` for unknown keys.
    pub fn set_enabled(&self, key: &QueryKey, enabled: bool) -> bool {
        match lock(&self.entries).get_mut(key) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, key: &QueryKey) -> bool {
        lock(&self.entries).get(key).is_some_and(|e| e.enabled)
    }

    pub fn state(&self, key: &QueryKey) -> Option<QueryState> {
        lock(&self.entries).get(key).map(|e| e.state.borrow().clone())
    }

    pub fn subscribe(&self, key: &QueryKey) -> Option<watch::Receiver<QueryState>> {
        lock(&self.entries).get(key).map(|e| e.state.subscribe())
    }

    /// Forget `key`, aborting its in-flight fetch.
    pub fn remove(&self, key: &QueryKey) -> bool {
        match lock(&self.entries).remove(key) {
            Some(entry) => {
                if let Some(in_flight) = entry.in_flight {
                    in_flight.abort.abort();
                }
                true
            }
            None => false,
        }
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        lock(&self.entries).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the query for `key`, joining a fetch that is already in flight.
    pub async fn fetch(&self, key: &QueryKey) -> QueryResult {
        let future = {
            let mut entries = lock(&self.entries);
            let entry = entries
                .get_mut(key)
                .ok_or_else(|| PartSyncError::UnknownQuery(key.to_string()))?;
            if !entry.enabled {
                return Err(PartSyncError::QueryDisabled(key.to_string()));
            }
            match &entry.in_flight {
                Some(in_flight) => in_flight.future.clone(),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let in_flight = self.start(key.clone(), id, entry);
                    let future = in_flight.future.clone();
                    entry.in_flight = Some(in_flight);
                    future
                }
            }
        };
        future.await
    }

    fn start(&self, key: QueryKey, id: u64, entry: &Entry) -> InFlight {
        let run = (entry.query_fn)();
        entry.state.send_modify(|s| s.fetching = true);

        let entries = Arc::clone(&self.entries);
        let task = tokio::spawn(async move {
            let result = run.await;
            complete(&entries, &key, id, &result);
            result
        });
        let abort = task.abort_handle();
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(PartSyncError::Cancelled),
                Err(e) => Err(PartSyncError::Request(e.to_string())),
            }
        }
        .boxed()
        .shared();

        InFlight { id, future, abort }
    }

    /// Fetch every enabled query whose key starts with `prefix`.
    ///
    /// Resolves once all of them settle; the first error (if any) is returned.
    pub async fn refetch_matching(&self, prefix: &QueryKey) -> Result<(), PartSyncError> {
        let keys: Vec<QueryKey> = lock(&self.entries)
            .iter()
            .filter(|(key, entry)| entry.enabled && key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();

        let results = join_all(keys.iter().map(|key| self.fetch(key))).await;
        match results.into_iter().find_map(Result::err) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Abort every in-flight fetch under `part_id`'s key prefix.
    ///
    /// Previous data stays in place; callers awaiting the aborted fetches get
    /// [`PartSyncError::Cancelled`].  Returns the number of fetches aborted.
    pub fn cancel_part(&self, part_id: &PartId) -> usize {
        let prefix = QueryKey::part(part_id);
        let mut cancelled = 0;
        for (key, entry) in lock(&self.entries).iter_mut() {
            if !key.starts_with(&prefix) {
                continue;
            }
            if let Some(in_flight) = entry.in_flight.take() {
                in_flight.abort.abort();
                entry.state.send_modify(|s| s.fetching = false);
                cancelled += 1;
            }
        }
        cancelled
    }
}

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<QueryKey, Entry>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Record the outcome of fetch `id`, unless it was cancelled or superseded.
fn complete(entries: &Entries, key: &QueryKey, id: u64, result: &QueryResult) {
    let mut entries = lock(entries);
    let Some(entry) = entries.get_mut(key) else {
        return;
    };
    if entry.in_flight.as_ref().map(|f| f.id) != Some(id) {
        return;
    }
    entry.in_flight = None;
    entry.state.send_modify(|s| {
        s.fetching = false;
        match result {
            Ok(data) => {
                s.data = Some(data.clone());
                s.error = None;
                s.updated_at = Some(Utc::now());
            }
            Err(e) => s.error = Some(e.clone()),
        }
    });
}

#[async_trait]
impl Refetch for QueryCache {
    async fn refetch(&self, key: &QueryKey) -> Result<(), PartSyncError> {
        self.refetch_matching(key).await
    }
}

#[async_trait]
impl PendingWork for QueryCache {
    async fn cancel_pending(&self, part_id: &PartId) {
        let cancelled = self.cancel_part(part_id);
        if cancelled > 0 {
            debug!(part = %part_id, cancelled, "cancelled pending queries");
        }
    }
}
