//! Resource names of every known part.
//!
//! Names are fetched once when a part's client appears and again whenever the
//! part's machine-status config revision moves away from a previously seen,
//! non-empty revision.

use std::collections::HashMap;
use std::sync::Arc;

use partsync_connect::ConnectionRegistry;
use partsync_types::{PartId, PartSyncError, ResourceName};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::{QueryCache, QueryFn, QueryResult, QueryState, query_fn};
use crate::context::FleetContext;
use crate::logger::{LogKind, QueryLogger};
use crate::machine_status::status_of;
use crate::part_queries::{PartQueries, PartStates, robot_key};
use crate::toggles::QueryKind;

pub const RESOURCE_NAMES: &str = "resourceNames";

/// Local before remote, then by type, then by name.
pub fn sort_resource_names(names: &mut [ResourceName]) {
    names.sort_by(|a, b| {
        a.is_remote()
            .cmp(&b.is_remote())
            .then_with(|| a.kind.cmp(&b.kind))
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Element-wise value equality.
pub fn resource_names_equal(a: &[ResourceName], b: &[ResourceName]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

/// Narrow `names` to one subtype; `None` keeps everything.
pub fn filter_by_subtype(names: &[ResourceName], subtype: Option<&str>) -> Vec<ResourceName> {
    match subtype {
        Some(subtype) => names.iter().filter(|n| n.subtype == subtype).cloned().collect(),
        None => names.to_vec(),
    }
}

/// Remembers the last config revision seen per part.
#[derive(Debug, Default)]
pub struct RevisionTracker {
    last: HashMap<PartId, String>,
}

impl RevisionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `revision` for `part_id`.  Returns `true` when a previously
    /// seen, non-empty revision differs from it.
    pub fn observe(&mut self, part_id: &PartId, revision: &str) -> bool {
        match self.last.insert(part_id.clone(), revision.to_string()) {
            Some(previous) if !previous.is_empty() => previous != revision,
            _ => false,
        }
    }

    pub fn forget(&mut self, part_id: &PartId) {
        self.last.remove(part_id);
    }
}

fn resource_names_query(registry: Arc<ConnectionRegistry>, logger: QueryLogger, part_id: PartId) -> QueryFn {
    query_fn(move || {
        let registry = Arc::clone(&registry);
        let logger = logger.clone();
        let part_id = part_id.clone();
        async move {
            let client = registry
                .client(&part_id)
                .ok_or_else(|| PartSyncError::NoClient(part_id.clone()))?;
            let log = logger.create_logger();
            log.log(LogKind::Req, Some("robot"), RESOURCE_NAMES, None);

            let result = client.client().resource_names().await.and_then(|mut names| {
                sort_resource_names(&mut names);
                serde_json::to_value(names).map_err(|e| PartSyncError::Serialization(e.to_string()))
            });
            match &result {
                Ok(value) => log.log(LogKind::Res, Some("robot"), RESOURCE_NAMES, Some(value)),
                Err(e) => log.log(
                    LogKind::Err,
                    Some("robot"),
                    RESOURCE_NAMES,
                    Some(&serde_json::Value::String(e.to_string())),
                ),
            };
            result
        }
    })
}

/// Decode the names held in a query state; empty until the first success.
pub fn names_of(state: &QueryState) -> Vec<ResourceName> {
    state
        .data
        .as_ref()
        .and_then(|data| serde_json::from_value(data.clone()).ok())
        .unwrap_or_default()
}

pub struct ResourceNamesProvider {
    queries: PartQueries,
    revisions: JoinHandle<()>,
}

impl ResourceNamesProvider {
    /// `statuses` is the machine-status map whose revisions trigger refetches.
    pub fn spawn(ctx: &FleetContext, statuses: watch::Receiver<PartStates>) -> Result<Self, PartSyncError> {
        let registry = Arc::clone(ctx.registry()?);
        let logger = ctx.logger().clone();
        let queries = PartQueries::spawn(ctx, RESOURCE_NAMES, QueryKind::ResourceNames, None, move |part_id| {
            resource_names_query(Arc::clone(&registry), logger.clone(), part_id.clone())
        })?;
        let revisions = tokio::spawn(follow_revisions(Arc::clone(ctx.cache()), statuses));
        Ok(Self { queries, revisions })
    }

    pub fn subscribe(&self) -> watch::Receiver<PartStates> {
        self.queries.subscribe()
    }

    pub fn state(&self, part_id: &PartId) -> Option<QueryState> {
        self.queries.state(part_id)
    }

    /// Names of `part_id`, optionally narrowed to one subtype.
    pub fn names(&self, part_id: &PartId, subtype: Option<&str>) -> Vec<ResourceName> {
        let names = self.state(part_id).as_ref().map(names_of).unwrap_or_default();
        filter_by_subtype(&names, subtype)
    }

    pub async fn refetch(&self, part_id: &PartId) -> QueryResult {
        self.queries.refetch(part_id).await
    }
}

impl Drop for ResourceNamesProvider {
    fn drop(&mut self) {
        self.revisions.abort();
    }
}

async fn follow_revisions(cache: Arc<QueryCache>, mut statuses: watch::Receiver<PartStates>) {
    let mut tracker = RevisionTracker::new();
    loop {
        let changed: Vec<PartId> = {
            let states = statuses.borrow_and_update();
            states
                .iter()
                .filter_map(|(part_id, state)| {
                    let revision = status_of(state).map(|s| s.config_revision).unwrap_or_default();
                    tracker.observe(part_id, &revision).then(|| part_id.clone())
                })
                .collect()
        };
        for part_id in changed {
            debug!(part = %part_id, "config revision changed; refetching resource names");
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                // Outcome lands in the query state.
                let _ = cache.fetch(&robot_key(&part_id, RESOURCE_NAMES)).await;
            });
        }
        if statuses.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LoggingToggles;
    use crate::machine_status::MachineStatusProvider;
    use crate::polling::Interval;
    use partsync_connect::{SimConnector, SimMachine};
    use partsync_types::ConnectionConfig;
    use std::time::Duration;

    fn name(name: &str, kind: &str, subtype: &str) -> ResourceName {
        ResourceName::new(name, kind, subtype)
    }

    #[test]
    fn names_sort_local_type_name() {
        let mut names = vec![
            name("remote:b", "service", "nav"),
            name("z", "component", "arm"),
            name("remote:c", "component", "arm"),
            name("b", "service", "nav"),
            name("a", "component", "arm"),
        ];
        sort_resource_names(&mut names);
        let order: Vec<&str> = names.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(order, vec!["a", "z", "b", "remote:c", "remote:b"]);
    }

    #[test]
    fn equality_and_subtype_filter() {
        let a = vec![name("cam", "component", "camera"), name("arm", "component", "arm")];
        let b = a.clone();
        assert!(resource_names_equal(&a, &b));
        assert!(!resource_names_equal(&a, &b[..1]));
        assert!(!resource_names_equal(&a, &[b[1].clone(), b[0].clone()]));

        let cameras = filter_by_subtype(&a, Some("camera"));
        assert_eq!(cameras, vec![name("cam", "component", "camera")]);
        assert_eq!(filter_by_subtype(&a, None).len(), 2);
    }

    #[test]
    fn revision_tracker_only_fires_on_real_changes() {
        let mut tracker = RevisionTracker::new();
        let part = PartId::from("p1");

        assert!(!tracker.observe(&part, ""), "first sighting never fires");
        assert!(!tracker.observe(&part, "r1"), "previous revision was empty");
        assert!(!tracker.observe(&part, "r1"));
        assert!(tracker.observe(&part, "r2"));

        tracker.forget(&part);
        assert!(!tracker.observe(&part, "r3"));
    }

    #[tokio::test(start_paused = true)]
    async fn names_follow_config_revision() -> Result<(), Box<dyn std::error::Error>> {
        let connector = SimConnector::new().with_machine(
            SimMachine::new("arm.local")
                .with_resource(name("cam", "component", "camera"))
                .with_revision("r1"),
        );
        let ctx = FleetContext::with_connector(
            Arc::new(connector.clone()),
            Arc::new(LoggingToggles::default()),
        );
        let part = PartId::from("arm");
        ctx.registry()?
            .reconcile([(part.clone(), ConnectionConfig::new("arm.local"))])
            .await;

        let statuses = MachineStatusProvider::spawn(&ctx, Interval::Every(Duration::from_millis(100)))?;
        let names = ResourceNamesProvider::spawn(&ctx, statuses.subscribe())?;

        let mut rx = names.subscribe();
        rx.wait_for(|states| states.get(&part).is_some_and(|s| s.data.is_some()))
            .await?;
        assert_eq!(names.names(&part, None), vec![name("cam", "component", "camera")]);

        // New resource without a revision bump: names stay cached.
        connector.add_machine(
            SimMachine::new("arm.local")
                .with_resource(name("cam", "component", "camera"))
                .with_resource(name("arm1", "component", "arm"))
                .with_revision("r1"),
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(names.names(&part, None).len(), 1);

        // Revision bump: the next status poll triggers a refetch.
        connector.set_revision("arm.local", "r2");
        tokio::time::sleep(Duration::from_millis(250)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(names.names(&part, None).len(), 2);
        assert_eq!(
            names.names(&part, Some("arm")),
            vec![name("arm1", "component", "arm")]
        );
        Ok(())
    }
}
