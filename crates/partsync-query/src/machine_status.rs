//! Machine status of every known part, polled on a shared interval.
//!
//! Resources in a returned status are ordered for display:
//!
//! ```text
//! component a
//! component z
//! service   b
//! component remote:c
//! service   remote:b
//! ```

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use partsync_connect::ConnectionRegistry;
use partsync_types::{MachineStatus, PartId, PartSyncError, ResourceStatus};
use serde_json::Value;
use tokio::sync::watch;

use crate::cache::{QueryFn, QueryResult, QueryState, query_fn};
use crate::context::FleetContext;
use crate::logger::{LogKind, QueryLogger};
use crate::part_queries::{PartQueries, PartStates};
use crate::polling::Interval;
use crate::toggles::QueryKind;

pub const GET_MACHINE_STATUS: &str = "getMachineStatus";

/// Order resource statuses: unnamed first, then local before remote, then by
/// type, name and subtype.
pub fn sort_resource_statuses(mut status: MachineStatus) -> MachineStatus {
    status.resources.sort_by(compare_statuses);
    status
}

fn compare_statuses(a: &ResourceStatus, b: &ResourceStatus) -> Ordering {
    match (&a.name, &b.name) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a
            .is_remote()
            .cmp(&b.is_remote())
            .then_with(|| a.kind.cmp(&b.kind))
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.subtype.cmp(&b.subtype)),
    }
}

fn machine_status_query(registry: Arc<ConnectionRegistry>, logger: QueryLogger, part_id: PartId) -> QueryFn {
    query_fn(move || {
        let registry = Arc::clone(&registry);
        let logger = logger.clone();
        let part_id = part_id.clone();
        async move {
            let client = registry
                .client(&part_id)
                .ok_or_else(|| PartSyncError::NoClient(part_id.clone()))?;
            let log = logger.create_logger();
            log.log(LogKind::Req, Some("robot"), GET_MACHINE_STATUS, None);

            let result = client
                .client()
                .machine_status()
                .await
                .map(sort_resource_statuses)
                .and_then(|status| {
                    serde_json::to_value(status).map_err(|e| PartSyncError::Serialization(e.to_string()))
                });
            match &result {
                Ok(value) => log.log(LogKind::Res, Some("robot"), GET_MACHINE_STATUS, Some(value)),
                Err(e) => log.log(
                    LogKind::Err,
                    Some("robot"),
                    GET_MACHINE_STATUS,
                    Some(&Value::String(e.to_string())),
                ),
            };
            result
        }
    })
}

/// Decode the status held in a query state.
pub fn status_of(state: &QueryState) -> Option<MachineStatus> {
    state
        .data
        .as_ref()
        .and_then(|data| serde_json::from_value(data.clone()).ok())
}

/// Keeps a `getMachineStatus` query per part and polls them all.
pub struct MachineStatusProvider {
    queries: PartQueries,
    interval: watch::Sender<Interval>,
}

impl MachineStatusProvider {
    pub fn spawn(ctx: &FleetContext, interval: Interval) -> Result<Self, PartSyncError> {
        let registry = Arc::clone(ctx.registry()?);
        let logger = ctx.logger().clone();
        let (interval_tx, interval_rx) = watch::channel(interval);
        let queries = PartQueries::spawn(
            ctx,
            GET_MACHINE_STATUS,
            QueryKind::MachineStatus,
            Some(interval_rx),
            move |part_id| machine_status_query(Arc::clone(&registry), logger.clone(), part_id.clone()),
        )?;
        Ok(Self {
            queries,
            interval: interval_tx,
        })
    }

    /// Change the polling interval of every part.
    pub fn set_interval(&self, interval: Interval) {
        self.interval.send_if_modified(|current| {
            let changed = *current != interval;
            *current = interval;
            changed
        });
    }

    pub fn interval(&self) -> Interval {
        *self.interval.borrow()
    }

    /// Query states keyed by part.
    pub fn subscribe(&self) -> watch::Receiver<PartStates> {
        self.queries.subscribe()
    }

    pub fn state(&self, part_id: &PartId) -> Option<QueryState> {
        self.queries.state(part_id)
    }

    pub fn status(&self, part_id: &PartId) -> Option<MachineStatus> {
        self.state(part_id).as_ref().and_then(status_of)
    }

    pub fn statuses(&self) -> HashMap<PartId, MachineStatus> {
        self.queries
            .current()
            .iter()
            .filter_map(|(id, state)| status_of(state).map(|s| (id.clone(), s)))
            .collect()
    }

    pub async fn refetch(&self, part_id: &PartId) -> QueryResult {
        self.queries.refetch(part_id).await
    }
}
