//! [`FleetContext`] – the dependencies every query consumer is handed.
//!
//! Consumers never reach for ambient globals.  A context built without a
//! registry still constructs, but every consumer that needs connections fails
//! fast with [`PartSyncError::NoRegistry`].

use std::sync::Arc;

use partsync_connect::{ConnectionRegistry, Connector, PartClient, PendingWork};
use partsync_types::{ConnectionState, PartId, PartSyncError};

use crate::cache::QueryCache;
use crate::logger::{LoggingToggles, QueryLogger};
use crate::polling::{Poller, Refetch};
use crate::toggles::EnabledQueries;

#[derive(Clone)]
pub struct FleetContext {
    registry: Option<Arc<ConnectionRegistry>>,
    cache: Arc<QueryCache>,
    logger: QueryLogger,
    enabled: Arc<EnabledQueries>,
}

impl FleetContext {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        cache: Arc<QueryCache>,
        logger: QueryLogger,
        enabled: Arc<EnabledQueries>,
    ) -> Self {
        Self {
            registry: Some(registry),
            cache,
            logger,
            enabled,
        }
    }

    /// Wire a registry over `connector` whose disconnects cancel pending
    /// work in a fresh cache.
    pub fn with_connector(connector: Arc<dyn Connector>, logging: Arc<LoggingToggles>) -> Self {
        let cache = Arc::new(QueryCache::new());
        let registry = ConnectionRegistry::new(connector, Arc::clone(&cache) as Arc<dyn PendingWork>);
        Self::new(
            Arc::new(registry),
            cache,
            QueryLogger::new(logging),
            Arc::new(EnabledQueries::new()),
        )
    }

    /// A context with no registry.
    pub fn detached(cache: Arc<QueryCache>, logger: QueryLogger, enabled: Arc<EnabledQueries>) -> Self {
        Self {
            registry: None,
            cache,
            logger,
            enabled,
        }
    }

    pub fn registry(&self) -> Result<&Arc<ConnectionRegistry>, PartSyncError> {
        self.registry.as_ref().ok_or(PartSyncError::NoRegistry)
    }

    pub fn client(&self, part_id: &PartId) -> Result<Option<PartClient>, PartSyncError> {
        Ok(self.registry()?.client(part_id))
    }

    pub fn connection_status(&self, part_id: &PartId) -> Result<ConnectionState, PartSyncError> {
        Ok(self.registry()?.status(part_id))
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn logger(&self) -> &QueryLogger {
        &self.logger
    }

    pub fn enabled(&self) -> &Arc<EnabledQueries> {
        &self.enabled
    }

    /// A [`Poller`] that refetches through this context's cache.
    pub fn poller(&self) -> Poller {
        Poller::new(Arc::clone(&self.cache) as Arc<dyn Refetch>)
    }
}
