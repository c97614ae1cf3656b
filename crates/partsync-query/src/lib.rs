//! `partsync-query` – Cached, polled queries over connected parts
//!
//! Builds on [`partsync_connect::ConnectionRegistry`]: every query is keyed
//! under its part, enabled only while that part has a connected client, and
//! cancelled when the part disconnects.
//!
//! # Modules
//!
//! - [`key`] – Structured [`QueryKey`]s.
//! - [`cache`] – [`QueryCache`]: shared in-flight fetches and latest states.
//! - [`polling`] – [`Poller`]: interval refetch sessions.
//! - [`logger`] – Opt-in REQ/RES/ERR request logging.
//! - [`toggles`] – Per-family enable switches.
//! - [`context`] – [`FleetContext`], the bundle every consumer is handed.
//! - [`machine_status`] – Polled `getMachineStatus` for every part.
//! - [`resource_names`] – `resourceNames` for every part, refreshed on
//!   config revision changes.
//! - [`resource`] – Cached resource/robot method queries, mutations and
//!   streamed resource queries.

pub mod cache;
pub mod context;
pub mod key;
pub mod logger;
pub mod machine_status;
mod part_queries;
pub mod polling;
pub mod resource;
pub mod resource_names;
pub mod toggles;

pub use cache::{QueryCache, QueryFn, QueryResult, QueryState, query_fn};
pub use context::FleetContext;
pub use key::QueryKey;
pub use logger::{LogKind, LoggingToggles, QueryLogger, RequestLogger};
pub use machine_status::{MachineStatusProvider, sort_resource_statuses};
pub use part_queries::{PartStates, robot_key};
pub use polling::{Interval, PollHandle, Poller, Refetch};
pub use resource::{
    QueryOptions, RefetchMode, ResourceMutation, ResourceQuery, ResourceStream, StreamOptions, StreamState,
    stream_key,
};
pub use resource_names::{ResourceNamesProvider, filter_by_subtype, resource_names_equal, sort_resource_names};
pub use toggles::{EnabledQueries, QueryKind, QueryToggles};
