//! `partsync-connect` – Connection lifecycle
//!
//! Keeps exactly one live client per configured part and re-aligns the held
//! connections whenever the desired configuration changes.
//!
//! # Modules
//!
//! - [`client`] – Collaborator seams: the [`Connector`] that dials parts, the
//!   [`MachineClient`] it yields, and the [`PendingWork`] sink cancelled on
//!   disconnect.
//! - [`compare`] – Pure helpers: [`compare_part_ids`] and [`deep_equal`].
//! - [`registry`] – [`ConnectionRegistry`]: reconcile, connect, disconnect and
//!   the published client/status snapshot.
//! - [`state_bus`] – Broadcast plumbing for transport state notifications.
//! - [`sim`] – In-process simulated fleet for tests and the CLI.

pub mod client;
pub mod compare;
pub mod registry;
pub mod sim;
pub mod state_bus;

pub use client::{ChunkStream, Connector, MachineClient, NoPendingWork, PartClient, PendingWork};
pub use compare::{PartIdDiff, compare_part_ids, deep_equal};
pub use registry::{ConnectionRegistry, RegistrySnapshot};
pub use sim::{SimClient, SimConnector, SimMachine};
pub use state_bus::{StateBus, StateSubscription};
