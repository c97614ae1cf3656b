//! Cached method calls on a part's resources or on the machine itself.
//!
//! # Keys
//!
//! | Call | Key |
//! |---|---|
//! | resource | `["partsync","partID",P,"resource",R,M,A]` |
//! | robot | `["partsync","partID",P,"robotClient",M]` plus `A` when given |
//! | stream | `["partsync","partID",P,"resource",R,M]` plus `A` when given |
//!
//! A query is enabled while its [`QueryOptions::enabled`] flag is set, the
//! part has a connected client, and the matching [`QueryKind`] toggle is on.
//! It is fetched each time it becomes enabled or the part's client is
//! replaced, and polled while enabled and its refetch interval is enabled.
//! Method support is checked with [`MachineClient::has_method`] before any
//! request is sent.
//!
//! A [`ResourceStream`] follows the same rules under the
//! [`QueryKind::Streams`] switch, collecting the chunks of a server-streaming
//! method as they arrive.
//!
//! [`MachineClient::has_method`]: partsync_connect::MachineClient::has_method

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use partsync_connect::{ChunkStream, ConnectionRegistry, PartClient, RegistrySnapshot};
use partsync_types::{PartId, PartSyncError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{QueryCache, QueryResult, QueryState, query_fn};
use crate::context::FleetContext;
use crate::key::QueryKey;
use crate::logger::{LogKind, QueryLogger};
use crate::polling::{Interval, PollHandle, Poller};
use crate::toggles::{EnabledQueries, QueryKind, QueryToggles};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    pub enabled: bool,
    pub refetch_interval: Interval,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            refetch_interval: Interval::Disabled,
        }
    }
}

impl QueryOptions {
    pub fn polled(interval: Interval) -> Self {
        Self {
            refetch_interval: interval,
            ..Self::default()
        }
    }
}

/// What a call is addressed to.
#[derive(Debug, Clone)]
struct Target {
    part_id: PartId,
    /// `None` addresses the machine itself.
    resource: Option<String>,
    method: String,
}

impl Target {
    fn kind(&self) -> QueryKind {
        match self.resource {
            Some(_) => QueryKind::ResourceQueries,
            None => QueryKind::RobotQueries,
        }
    }

    fn log_name(&self) -> &str {
        self.resource.as_deref().unwrap_or("robot")
    }

    /// Invoke through the registry's current client for the part.
    async fn call(&self, registry: &ConnectionRegistry, logger: &QueryLogger, args: Value) -> QueryResult {
        let client = registry
            .client(&self.part_id)
            .ok_or_else(|| PartSyncError::NoClient(self.part_id.clone()))?;
        let resource = self.resource.as_deref();
        if !client.client().has_method(resource, &self.method) {
            return Err(PartSyncError::MethodNotFound {
                method: self.method.clone(),
            });
        }

        let log = logger.create_logger();
        log.log(LogKind::Req, Some(self.log_name()), &self.method, Some(&args));
        let result = client.client().invoke(resource, &self.method, args).await;
        match &result {
            Ok(value) => log.log(LogKind::Res, Some(self.log_name()), &self.method, Some(value)),
            Err(e) => log.log(
                LogKind::Err,
                Some(self.log_name()),
                &self.method,
                Some(&Value::String(e.to_string())),
            ),
        };
        result
    }

    /// Open a server-streaming call through the registry's current client.
    async fn open_stream(
        &self,
        registry: &ConnectionRegistry,
        logger: &QueryLogger,
        args: Value,
    ) -> Result<ChunkStream, PartSyncError> {
        let client = registry
            .client(&self.part_id)
            .ok_or_else(|| PartSyncError::NoClient(self.part_id.clone()))?;
        let resource = self.resource.as_deref();
        if !client.client().has_method(resource, &self.method) {
            return Err(PartSyncError::MethodNotFound {
                method: self.method.clone(),
            });
        }

        let log = logger.create_logger();
        log.log(LogKind::Req, Some(self.log_name()), &self.method, Some(&args));
        let result = client.client().invoke_stream(resource, &self.method, args).await;
        match &result {
            Ok(_) => log.log(LogKind::Res, Some(self.log_name()), &self.method, None),
            Err(e) => log.log(
                LogKind::Err,
                Some(self.log_name()),
                &self.method,
                Some(&Value::String(e.to_string())),
            ),
        };
        result
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Gate
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// Enabled, or enabled against a replaced client: run from scratch.
    Start,
    Stop,
    Unchanged,
}

/// Follows the registry and the toggles for one part-scoped call.
struct Gate {
    snapshots: watch::Receiver<RegistrySnapshot>,
    toggles: watch::Receiver<QueryToggles>,
    part_id: PartId,
    kind: QueryKind,
    wanted: bool,
    enabled: bool,
    session: Option<Uuid>,
}

impl Gate {
    fn new(
        registry: &ConnectionRegistry,
        toggles: &EnabledQueries,
        part_id: PartId,
        kind: QueryKind,
        wanted: bool,
    ) -> Self {
        Self {
            snapshots: registry.subscribe(),
            toggles: toggles.subscribe(),
            part_id,
            kind,
            wanted,
            enabled: false,
            session: None,
        }
    }

    fn update(&mut self) -> Transition {
        let session = self
            .snapshots
            .borrow_and_update()
            .client(&self.part_id)
            .map(PartClient::session);
        let switched_on = self.toggles.borrow_and_update().is_enabled(self.kind);
        let enabled = self.wanted && switched_on && session.is_some();
        let reconnected = session.is_some() && session != self.session;

        let transition = if !enabled {
            if self.enabled {
                Transition::Stop
            } else {
                Transition::Unchanged
            }
        } else if !self.enabled || reconnected {
            Transition::Start
        } else {
            Transition::Unchanged
        };
        self.enabled = enabled;
        if session.is_some() {
            self.session = session;
        }
        transition
    }

    /// `false` once the registry or the toggles are gone.
    async fn changed(&mut self) -> bool {
        tokio::select! {
            changed = self.snapshots.changed() => changed.is_ok(),
            changed = self.toggles.changed() => changed.is_ok(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ResourceQuery
// ────────────────────────────────────────────────────────────────────────────

pub struct ResourceQuery {
    key: QueryKey,
    options: QueryOptions,
    cache: Arc<QueryCache>,
    state: watch::Receiver<QueryState>,
    interval: watch::Sender<Interval>,
    sync: JoinHandle<()>,
}

impl ResourceQuery {
    /// Cache `method(args)` on resource `resource` of `part_id`.
    pub fn resource(
        ctx: &FleetContext,
        part_id: PartId,
        resource: impl Into<String>,
        method: impl Into<String>,
        args: Value,
        options: QueryOptions,
    ) -> Result<Self, PartSyncError> {
        let target = Target {
            part_id,
            resource: Some(resource.into()),
            method: method.into(),
        };
        let key = QueryKey::part(&target.part_id)
            .push("resource")
            .push(target.resource.clone().unwrap_or_default())
            .push(target.method.clone())
            .push(args.clone());
        Self::build(ctx, target, key, args, options)
    }

    /// Cache `method(args)` on the machine of `part_id`.
    pub fn robot(
        ctx: &FleetContext,
        part_id: PartId,
        method: impl Into<String>,
        args: Option<Value>,
        options: QueryOptions,
    ) -> Result<Self, PartSyncError> {
        let target = Target {
            part_id,
            resource: None,
            method: method.into(),
        };
        let mut key = QueryKey::part(&target.part_id)
            .push("robotClient")
            .push(target.method.clone());
        if let Some(args) = &args {
            key = key.push(args.clone());
        }
        Self::build(ctx, target, key, args.unwrap_or(Value::Null), options)
    }

    fn build(
        ctx: &FleetContext,
        target: Target,
        key: QueryKey,
        args: Value,
        options: QueryOptions,
    ) -> Result<Self, PartSyncError> {
        let registry = Arc::clone(ctx.registry()?);
        let cache = Arc::clone(ctx.cache());
        let kind = target.kind();
        let enabled_now = is_enabled(&registry, ctx.enabled(), &target, kind, options);

        let run = {
            let registry = Arc::clone(&registry);
            let logger = ctx.logger().clone();
            let target = target.clone();
            query_fn(move || {
                let registry = Arc::clone(&registry);
                let logger = logger.clone();
                let target = target.clone();
                let args = args.clone();
                async move { target.call(&registry, &logger, args).await }
            })
        };
        let state = cache.ensure(key.clone(), run, enabled_now);

        let gate = Gate::new(&registry, ctx.enabled(), target.part_id, kind, options.enabled);
        let (interval, interval_rx) = watch::channel(options.refetch_interval);
        let sync = tokio::spawn(keep_enabled(
            gate,
            Arc::clone(&cache),
            key.clone(),
            ctx.poller(),
            interval_rx,
        ));

        Ok(Self {
            key,
            options,
            cache,
            state,
            interval,
            sync,
        })
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn options(&self) -> QueryOptions {
        self.options
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_enabled(&self.key)
    }

    pub fn state(&self) -> QueryState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryState> {
        self.state.clone()
    }

    pub async fn fetch(&self) -> QueryResult {
        self.cache.fetch(&self.key).await
    }

    /// [`fetch`](Self::fetch) and decode the result.
    pub async fn fetch_as<T: DeserializeOwned>(&self) -> Result<T, PartSyncError> {
        let value = self.fetch().await?;
        serde_json::from_value(value).map_err(|e| PartSyncError::Serialization(e.to_string()))
    }

    pub fn set_refetch_interval(&mut self, interval: Interval) {
        self.options.refetch_interval = interval;
        self.interval.send_replace(interval);
    }
}

impl Drop for ResourceQuery {
    fn drop(&mut self) {
        self.sync.abort();
    }
}

fn is_enabled(
    registry: &ConnectionRegistry,
    toggles: &EnabledQueries,
    target: &Target,
    kind: QueryKind,
    options: QueryOptions,
) -> bool {
    options.enabled && toggles.get(kind) && registry.client(&target.part_id).is_some()
}

/// Re-sync the query's enabled flag with the registry and the toggles.  Each
/// start fetches and begins a new polling session.
async fn keep_enabled(
    mut gate: Gate,
    cache: Arc<QueryCache>,
    key: QueryKey,
    poller: Poller,
    interval: watch::Receiver<Interval>,
) {
    let (key_tx, _) = watch::channel(key.clone());
    let mut _poll: Option<PollHandle> = None;
    loop {
        match gate.update() {
            Transition::Start => {
                cache.set_enabled(&key, true);
                _poll = Some(poller.schedule_with(key_tx.subscribe(), interval.clone()));
                let cache = Arc::clone(&cache);
                let key = key.clone();
                tokio::spawn(async move {
                    // Outcome lands in the query state.
                    let _ = cache.fetch(&key).await;
                });
            }
            Transition::Stop => {
                cache.set_enabled(&key, false);
                _poll = None;
            }
            Transition::Unchanged => {}
        }
        if !gate.changed().await {
            break;
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ResourceStream
// ────────────────────────────────────────────────────────────────────────────

/// How a re-run treats the chunks of the previous run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefetchMode {
    /// Keep them and add the new chunks after them.
    Append,
    /// Drop them as soon as the re-run starts.
    #[default]
    Reset,
    /// Keep showing them until the re-run completes, then swap in the new
    /// chunks all at once.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    pub enabled: bool,
    pub refetch_mode: RefetchMode,
    /// Oldest chunks are dropped beyond this many.
    pub max_chunks: Option<usize>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            refetch_mode: RefetchMode::Reset,
            max_chunks: None,
        }
    }
}

/// Latest observable state of one stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamState {
    pub chunks: Vec<Value>,
    /// Error that ended the last run, cleared when the next run starts.
    pub error: Option<PartSyncError>,
    pub streaming: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Applies the chunks of one run to the visible list.
struct ChunkWriter {
    mode: RefetchMode,
    max_chunks: Option<usize>,
    pending: Vec<Value>,
}

impl ChunkWriter {
    fn new(options: StreamOptions) -> Self {
        Self {
            mode: options.refetch_mode,
            max_chunks: options.max_chunks,
            pending: Vec::new(),
        }
    }

    fn begin(&self, visible: &mut Vec<Value>) {
        if self.mode == RefetchMode::Reset {
            visible.clear();
        }
    }

    /// `true` when `visible` changed.
    fn push(&mut self, visible: &mut Vec<Value>, chunk: Value) -> bool {
        let max_chunks = self.max_chunks;
        let target = match self.mode {
            RefetchMode::Replace => &mut self.pending,
            RefetchMode::Append | RefetchMode::Reset => visible,
        };
        target.push(chunk);
        if let Some(max) = max_chunks {
            let excess = target.len().saturating_sub(max);
            target.drain(..excess);
        }
        self.mode != RefetchMode::Replace
    }

    /// Completed runs publish what `Replace` held back.
    fn finish(self, visible: &mut Vec<Value>) {
        if self.mode == RefetchMode::Replace {
            *visible = self.pending;
        }
    }
}

/// Collects the chunks of a server-streaming resource method.
pub struct ResourceStream {
    key: QueryKey,
    options: StreamOptions,
    part_id: PartId,
    registry: Arc<ConnectionRegistry>,
    toggles: Arc<EnabledQueries>,
    state: watch::Receiver<StreamState>,
    rerun: Arc<Notify>,
    sync: JoinHandle<()>,
}

impl ResourceStream {
    /// Stream `method(args)` from resource `resource` of `part_id`.
    pub fn resource(
        ctx: &FleetContext,
        part_id: PartId,
        resource: impl Into<String>,
        method: impl Into<String>,
        args: Option<Value>,
        options: StreamOptions,
    ) -> Result<Self, PartSyncError> {
        let registry = Arc::clone(ctx.registry()?);
        let target = Target {
            part_id,
            resource: Some(resource.into()),
            method: method.into(),
        };
        let key = stream_key(
            &target.part_id,
            target.resource.as_deref().unwrap_or_default(),
            &target.method,
            args.as_ref(),
        );

        let (state_tx, state) = watch::channel(StreamState::default());
        let rerun = Arc::new(Notify::new());
        let gate = Gate::new(
            &registry,
            ctx.enabled(),
            target.part_id.clone(),
            QueryKind::Streams,
            options.enabled,
        );
        let run = StreamRun {
            target: target.clone(),
            args: args.unwrap_or(Value::Null),
            options,
            registry: Arc::clone(&registry),
            logger: ctx.logger().clone(),
            state: Arc::new(state_tx),
        };
        let sync = tokio::spawn(drive_stream(gate, run, Arc::clone(&rerun)));

        Ok(Self {
            key,
            options,
            part_id: target.part_id,
            registry,
            toggles: Arc::clone(ctx.enabled()),
            state,
            rerun,
            sync,
        })
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn options(&self) -> StreamOptions {
        self.options
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
            && self.toggles.get(QueryKind::Streams)
            && self.registry.client(&self.part_id).is_some()
    }

    pub fn state(&self) -> StreamState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    /// Start the stream over, applying the configured [`RefetchMode`].  A run
    /// still in progress is abandoned.  Ignored while disabled.
    pub fn refetch(&self) {
        self.rerun.notify_one();
    }
}

impl Drop for ResourceStream {
    fn drop(&mut self) {
        self.sync.abort();
    }
}

/// `["partsync","partID",P,"resource",R,M]`, plus `args` when given.
pub fn stream_key(part_id: &PartId, resource: &str, method: &str, args: Option<&Value>) -> QueryKey {
    let key = QueryKey::part(part_id).push("resource").push(resource).push(method);
    match args {
        Some(args) => key.push(args.clone()),
        None => key,
    }
}

/// Everything one run of a stream needs.
#[derive(Clone)]
struct StreamRun {
    target: Target,
    args: Value,
    options: StreamOptions,
    registry: Arc<ConnectionRegistry>,
    logger: QueryLogger,
    state: Arc<watch::Sender<StreamState>>,
}

impl StreamRun {
    async fn run(self) {
        let mut writer = ChunkWriter::new(self.options);
        self.state.send_modify(|state| {
            state.streaming = true;
            state.error = None;
            writer.begin(&mut state.chunks);
        });

        let mut chunks = match self
            .target
            .open_stream(&self.registry, &self.logger, self.args.clone())
            .await
        {
            Ok(chunks) => chunks,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => {
                    self.state.send_if_modified(|state| {
                        let changed = writer.push(&mut state.chunks, chunk);
                        if changed {
                            state.updated_at = Some(Utc::now());
                        }
                        changed
                    });
                }
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }

        self.state.send_modify(|state| {
            writer.finish(&mut state.chunks);
            state.streaming = false;
            state.updated_at = Some(Utc::now());
        });
    }

    fn fail(&self, error: PartSyncError) {
        debug!(method = %self.target.method, error = %error, "stream ended with an error");
        self.state.send_modify(|state| {
            state.streaming = false;
            state.error = Some(error);
        });
    }
}

/// Aborts its run when dropped.
struct Running(JoinHandle<()>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn drive_stream(mut gate: Gate, run: StreamRun, rerun: Arc<Notify>) {
    let mut running: Option<Running> = None;
    loop {
        match gate.update() {
            Transition::Start => {
                running = Some(Running(tokio::spawn(run.clone().run())));
            }
            Transition::Stop => {
                if running.take().is_some() {
                    run.state.send_modify(|state| state.streaming = false);
                }
            }
            Transition::Unchanged => {}
        }

        let open = tokio::select! {
            open = gate.changed() => open,
            _ = rerun.notified() => {
                if gate.enabled {
                    running = Some(Running(tokio::spawn(run.clone().run())));
                }
                true
            }
        };
        if !open {
            break;
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ResourceMutation
// ────────────────────────────────────────────────────────────────────────────

/// Uncached method call; each [`mutate`](Self::mutate) hits the machine.
pub struct ResourceMutation {
    registry: Arc<ConnectionRegistry>,
    logger: QueryLogger,
    target: Target,
}

impl ResourceMutation {
    pub fn resource(
        ctx: &FleetContext,
        part_id: PartId,
        resource: impl Into<String>,
        method: impl Into<String>,
    ) -> Result<Self, PartSyncError> {
        Ok(Self {
            registry: Arc::clone(ctx.registry()?),
            logger: ctx.logger().clone(),
            target: Target {
                part_id,
                resource: Some(resource.into()),
                method: method.into(),
            },
        })
    }

    pub fn robot(ctx: &FleetContext, part_id: PartId, method: impl Into<String>) -> Result<Self, PartSyncError> {
        Ok(Self {
            registry: Arc::clone(ctx.registry()?),
            logger: ctx.logger().clone(),
            target: Target {
                part_id,
                resource: None,
                method: method.into(),
            },
        })
    }

    /// `["partsync","partID",P,"resource",R,M]` (or `"robotClient",M`).
    pub fn key(&self) -> QueryKey {
        let key = QueryKey::part(&self.target.part_id);
        match &self.target.resource {
            Some(resource) => key.push("resource").push(resource.clone()),
            None => key.push("robotClient"),
        }
        .push(self.target.method.clone())
    }

    pub async fn mutate(&self, args: Value) -> QueryResult {
        self.target.call(&self.registry, &self.logger, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LoggingToggles;
    use partsync_connect::{SimConnector, SimMachine};
    use partsync_types::{ConnectionConfig, ResourceName};
    use serde_json::json;
    use std::time::Duration;

    async fn fleet() -> Result<FleetContext, PartSyncError> {
        let connector = SimConnector::new().with_machine(
            SimMachine::new("arm.local")
                .with_resource(ResourceName::new("cam", "component", "camera"))
                .with_resource(ResourceName::new("imu", "component", "sensor")),
        );
        let ctx = FleetContext::with_connector(Arc::new(connector), Arc::new(LoggingToggles::new(true, true)));
        ctx.registry()?
            .reconcile([(PartId::from("arm"), ConnectionConfig::new("arm.local"))])
            .await;
        Ok(ctx)
    }

    async fn wait_for_chunks(
        stream: &ResourceStream,
        done: impl FnMut(&StreamState) -> bool,
    ) -> Result<StreamState, Box<dyn std::error::Error>> {
        let mut rx = stream.subscribe();
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(done)).await??;
        Ok(state.clone())
    }

    fn frames(state: &StreamState) -> Vec<u64> {
        state
            .chunks
            .iter()
            .filter_map(|c| c.get("frame").and_then(Value::as_u64))
            .collect()
    }

    async fn wait_for_data(query: &ResourceQuery) -> Result<(), Box<dyn std::error::Error>> {
        let mut rx = query.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.data.is_some())).await??;
        Ok(())
    }

    #[tokio::test]
    async fn resource_query_key_and_result() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = fleet().await?;
        let query = ResourceQuery::resource(
            &ctx,
            PartId::from("arm"),
            "cam",
            "doCommand",
            json!({ "ping": 1 }),
            QueryOptions::default(),
        )?;

        assert_eq!(
            query.key().to_string(),
            r#"["partsync","partID","arm","resource","cam","doCommand",{"ping":1}]"#
        );
        assert_eq!(query.fetch().await?, json!({ "ping": 1 }));
        wait_for_data(&query).await?;
        assert_eq!(query.state().data, Some(json!({ "ping": 1 })));
        Ok(())
    }

    #[tokio::test]
    async fn robot_query_key_omits_missing_args() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = fleet().await?;
        let query = ResourceQuery::robot(&ctx, PartId::from("arm"), "getVersion", None, QueryOptions::default())?;
        assert_eq!(
            query.key().to_string(),
            r#"["partsync","partID","arm","robotClient","getVersion"]"#
        );

        #[derive(serde::Deserialize)]
        struct Version {
            version: String,
        }
        let version: Version = query.fetch_as().await?;
        assert_eq!(version.version, "sim");
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_method_fails_before_any_request() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = fleet().await?;
        let query = ResourceQuery::resource(
            &ctx,
            PartId::from("arm"),
            "cam",
            "spin",
            Value::Null,
            QueryOptions::default(),
        )?;
        assert_eq!(
            query.fetch().await,
            Err(PartSyncError::MethodNotFound {
                method: "spin".to_string()
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn query_without_client_is_disabled() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = fleet().await?;
        let query = ResourceQuery::resource(
            &ctx,
            PartId::from("elsewhere"),
            "cam",
            "doCommand",
            Value::Null,
            QueryOptions::default(),
        )?;
        assert!(!query.is_enabled());
        assert!(matches!(query.fetch().await, Err(PartSyncError::QueryDisabled(_))));
        Ok(())
    }

    #[tokio::test]
    async fn detached_context_reports_missing_registry() {
        let ctx = FleetContext::detached(
            Arc::new(QueryCache::new()),
            QueryLogger::new(Arc::new(LoggingToggles::default())),
            Arc::new(EnabledQueries::new()),
        );
        let query = ResourceQuery::robot(&ctx, PartId::from("arm"), "getVersion", None, QueryOptions::default());
        assert!(matches!(query, Err(PartSyncError::NoRegistry)));
        let mutation = ResourceMutation::robot(&ctx, PartId::from("arm"), "getVersion");
        assert!(matches!(mutation, Err(PartSyncError::NoRegistry)));
    }

    #[tokio::test]
    async fn toggle_disables_and_reenables() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = fleet().await?;
        let query = ResourceQuery::resource(
            &ctx,
            PartId::from("arm"),
            "imu",
            "getReadings",
            Value::Null,
            QueryOptions::default(),
        )?;
        wait_for_data(&query).await?;

        ctx.enabled().disable_resource_queries();
        tokio::time::timeout(Duration::from_secs(5), async {
            while query.is_enabled() {
                tokio::task::yield_now().await;
            }
        })
        .await?;
        assert!(matches!(query.fetch().await, Err(PartSyncError::QueryDisabled(_))));

        // Robot-level switches do not affect resource queries.
        ctx.enabled().enable_resource_queries();
        ctx.enabled().disable_robot_queries();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !query.is_enabled() {
                tokio::task::yield_now().await;
            }
        })
        .await?;
        assert!(query.fetch().await.is_ok());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn refetch_interval_polls() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = fleet().await?;
        let mut query = ResourceQuery::resource(
            &ctx,
            PartId::from("arm"),
            "imu",
            "getReadings",
            Value::Null,
            QueryOptions::polled(Interval::Every(Duration::from_millis(100))),
        )?;
        wait_for_data(&query).await?;
        let reading = |q: &ResourceQuery| {
            q.state()
                .data
                .and_then(|d| d.get("reading").and_then(Value::as_u64))
                .unwrap_or_default()
        };
        let first = reading(&query);

        tokio::time::sleep(Duration::from_millis(350)).await;
        let polled = reading(&query);
        assert!(polled >= first + 2, "expected polling, got {first} -> {polled}");

        query.set_refetch_interval(Interval::Disabled);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let stopped = reading(&query);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(reading(&query), stopped);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_fetches_and_polls_the_new_client() -> Result<(), Box<dyn std::error::Error>> {
        let imu = ResourceName::new("imu", "component", "sensor");
        let connector = SimConnector::new()
            .with_machine(SimMachine::new("arm.local").with_resource(imu.clone()))
            .with_machine(SimMachine::new("arm2.local").with_resource(imu));
        let ctx = FleetContext::with_connector(Arc::new(connector), Arc::new(LoggingToggles::default()));
        let part = PartId::from("arm");
        ctx.registry()?
            .reconcile([(part.clone(), ConnectionConfig::new("arm.local"))])
            .await;

        let query = ResourceQuery::resource(
            &ctx,
            part.clone(),
            "imu",
            "getReadings",
            Value::Null,
            QueryOptions::polled(Interval::Every(Duration::from_millis(100))),
        )?;
        let reading = |q: &ResourceQuery| {
            q.state()
                .data
                .and_then(|d| d.get("reading").and_then(Value::as_u64))
        };
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(reading(&query) >= Some(2), "expected polling, got {:?}", reading(&query));

        // Readings count per client, so a fresh client starts over at 0.
        ctx.registry()?
            .reconcile([(part.clone(), ConnectionConfig::new("arm2.local"))])
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(reading(&query), Some(0));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(reading(&query) >= Some(2), "polling did not resume: {:?}", reading(&query));
        Ok(())
    }

    #[test]
    fn stream_key_shapes() {
        let part = PartId::from("part-123");
        assert_eq!(
            stream_key(&part, "camera", "getImages", Some(&json!({ "enabled": true }))).to_string(),
            r#"["partsync","partID","part-123","resource","camera","getImages",{"enabled":true}]"#
        );
        assert_eq!(
            stream_key(&part, "camera", "getImages", None).to_string(),
            r#"["partsync","partID","part-123","resource","camera","getImages"]"#
        );
        assert_eq!(
            stream_key(&part, "camera", "getImages", Some(&json!(42))).to_string(),
            r#"["partsync","partID","part-123","resource","camera","getImages",42]"#
        );
        assert_eq!(
            stream_key(&PartId::from(""), "", "getImages", None).to_string(),
            r#"["partsync","partID","","resource","","getImages"]"#
        );
    }

    #[test]
    fn chunk_writer_modes() {
        let options = |mode, max_chunks| StreamOptions {
            refetch_mode: mode,
            max_chunks,
            ..StreamOptions::default()
        };
        let mut visible = vec![json!("old")];

        let mut reset = ChunkWriter::new(options(RefetchMode::Reset, None));
        reset.begin(&mut visible);
        assert!(visible.is_empty());
        assert!(reset.push(&mut visible, json!(1)));
        reset.finish(&mut visible);
        assert_eq!(visible, vec![json!(1)]);

        let mut append = ChunkWriter::new(options(RefetchMode::Append, Some(2)));
        append.begin(&mut visible);
        append.push(&mut visible, json!(2));
        append.push(&mut visible, json!(3));
        append.finish(&mut visible);
        assert_eq!(visible, vec![json!(2), json!(3)]);

        let mut replace = ChunkWriter::new(options(RefetchMode::Replace, None));
        replace.begin(&mut visible);
        assert!(!replace.push(&mut visible, json!(4)));
        assert_eq!(visible, vec![json!(2), json!(3)], "previous chunks stay until the run completes");
        replace.finish(&mut visible);
        assert_eq!(visible, vec![json!(4)]);
    }

    #[tokio::test]
    async fn stream_appends_on_refetch() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = fleet().await?;
        let stream = ResourceStream::resource(
            &ctx,
            PartId::from("arm"),
            "cam",
            "getImages",
            Some(json!({ "count": 2 })),
            StreamOptions {
                refetch_mode: RefetchMode::Append,
                max_chunks: Some(3),
                ..StreamOptions::default()
            },
        )?;
        assert_eq!(
            stream.key().to_string(),
            r#"["partsync","partID","arm","resource","cam","getImages",{"count":2}]"#
        );

        let first = wait_for_chunks(&stream, |s| s.chunks.len() == 2 && !s.streaming).await?;
        assert_eq!(frames(&first), vec![0, 1]);
        assert!(first.error.is_none());

        stream.refetch();
        let second = wait_for_chunks(&stream, |s| s.chunks.len() == 3 && !s.streaming).await?;
        assert_eq!(frames(&second), vec![1, 0, 1]);
        Ok(())
    }

    #[tokio::test]
    async fn stream_waits_for_its_toggle() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = fleet().await?;
        ctx.enabled().disable_streams();
        let stream = ResourceStream::resource(
            &ctx,
            PartId::from("arm"),
            "imu",
            "streamReadings",
            None,
            StreamOptions::default(),
        )?;
        assert!(!stream.is_enabled());
        stream.refetch();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(stream.state().chunks.is_empty());

        ctx.enabled().enable_streams();
        let state = wait_for_chunks(&stream, |s| s.chunks.len() == 3 && !s.streaming).await?;
        assert_eq!(state.chunks[2], json!({ "reading": 2 }));
        assert!(stream.is_enabled());
        Ok(())
    }

    #[tokio::test]
    async fn stream_of_unknown_method_reports_error() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = fleet().await?;
        let stream = ResourceStream::resource(
            &ctx,
            PartId::from("arm"),
            "cam",
            "streamReadings",
            None,
            StreamOptions::default(),
        )?;
        let state = wait_for_chunks(&stream, |s| s.error.is_some()).await?;
        assert_eq!(
            state.error,
            Some(PartSyncError::MethodNotFound {
                method: "streamReadings".to_string()
            })
        );
        assert!(!state.streaming);
        Ok(())
    }

    #[tokio::test]
    async fn mutation_invokes_directly() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = fleet().await?;
        let mutation = ResourceMutation::resource(&ctx, PartId::from("arm"), "cam", "doCommand")?;
        assert_eq!(
            mutation.key().to_string(),
            r#"["partsync","partID","arm","resource","cam","doCommand"]"#
        );
        assert_eq!(mutation.mutate(json!({ "go": true })).await?, json!({ "go": true }));

        let missing = ResourceMutation::resource(&ctx, PartId::from("arm"), "cam", "moveStraight")?;
        assert_eq!(
            missing.mutate(Value::Null).await,
            Err(PartSyncError::MethodNotFound {
                method: "moveStraight".to_string()
            })
        );

        let robot = ResourceMutation::robot(&ctx, PartId::from("arm"), "getMachineStatus")?;
        assert!(robot.mutate(Value::Null).await?.get("config_revision").is_some());
        Ok(())
    }
}
