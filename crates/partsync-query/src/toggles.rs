//! [`EnabledQueries`] – runtime switches for each family of queries.
//!
//! All families start enabled.  Providers subscribe and re-sync their
//! queries' enabled flags whenever a switch flips.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryToggles {
    pub machine_status: bool,
    pub resource_names: bool,
    pub resource_queries: bool,
    pub robot_queries: bool,
    pub streams: bool,
}

impl Default for QueryToggles {
    fn default() -> Self {
        Self {
            machine_status: true,
            resource_names: true,
            resource_queries: true,
            robot_queries: true,
            streams: true,
        }
    }
}

impl QueryToggles {
    pub fn is_enabled(&self, kind: QueryKind) -> bool {
        let mut toggles = *self;
        *kind.flag(&mut toggles)
    }
}

/// Names accepted by [`EnabledQueries::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    MachineStatus,
    ResourceNames,
    ResourceQueries,
    RobotQueries,
    Streams,
}

impl QueryKind {
    pub const ALL: [QueryKind; 5] = [
        Self::MachineStatus,
        Self::ResourceNames,
        Self::ResourceQueries,
        Self::RobotQueries,
        Self::Streams,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MachineStatus => "machine-status",
            Self::ResourceNames => "resource-names",
            Self::ResourceQueries => "resource-queries",
            Self::RobotQueries => "robot-queries",
            Self::Streams => "streams",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    fn flag(self, toggles: &mut QueryToggles) -> &mut bool {
        match self {
            Self::MachineStatus => &mut toggles.machine_status,
            Self::ResourceNames => &mut toggles.resource_names,
            Self::ResourceQueries => &mut toggles.resource_queries,
            Self::RobotQueries => &mut toggles.robot_queries,
            Self::Streams => &mut toggles.streams,
        }
    }
}

#[derive(Debug)]
pub struct EnabledQueries {
    tx: watch::Sender<QueryToggles>,
}

impl Default for EnabledQueries {
    fn default() -> Self {
        Self::new()
    }
}

impl EnabledQueries {
    pub fn new() -> Self {
        Self {
            tx: watch::channel(QueryToggles::default()).0,
        }
    }

    pub fn current(&self) -> QueryToggles {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryToggles> {
        self.tx.subscribe()
    }

    /// Flip one family.  Subscribers are only woken by real changes.
    pub fn set(&self, kind: QueryKind, enabled: bool) {
        self.tx.send_if_modified(|toggles| {
            let flag = kind.flag(toggles);
            let changed = *flag != enabled;
            *flag = enabled;
            changed
        });
    }

    pub fn get(&self, kind: QueryKind) -> bool {
        self.current().is_enabled(kind)
    }

    pub fn machine_status(&self) -> bool {
        self.current().machine_status
    }
    pub fn enable_machine_status(&self) {
        self.set(QueryKind::MachineStatus, true);
    }
    pub fn disable_machine_status(&self) {
        self.set(QueryKind::MachineStatus, false);
    }

    pub fn resource_names(&self) -> bool {
        self.current().resource_names
    }
    pub fn enable_resource_names(&self) {
        self.set(QueryKind::ResourceNames, true);
    }
    pub fn disable_resource_names(&self) {
        self.set(QueryKind::ResourceNames, false);
    }

    pub fn resource_queries(&self) -> bool {
        self.current().resource_queries
    }
    pub fn enable_resource_queries(&self) {
        self.set(QueryKind::ResourceQueries, true);
    }
    pub fn disable_resource_queries(&self) {
        self.set(QueryKind::ResourceQueries, false);
    }

    pub fn robot_queries(&self) -> bool {
        self.current().robot_queries
    }
    pub fn enable_robot_queries(&self) {
        self.set(QueryKind::RobotQueries, true);
    }
    pub fn disable_robot_queries(&self) {
        self.set(QueryKind::RobotQueries, false);
    }

    pub fn streams(&self) -> bool {
        self.current().streams
    }
    pub fn enable_streams(&self) {
        self.set(QueryKind::Streams, true);
    }
    pub fn disable_streams(&self) {
        self.set(QueryKind::Streams, false);
    }
}
