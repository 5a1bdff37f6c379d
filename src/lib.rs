//! Core connection-lifecycle engine for an RDMA reliable-message transport:
//! device registry and migration, shared completion queues, the three-tier
//! task-pool suite, and the per-connection CM-event state machine.
//!
//! What a CM/verbs binding (out of scope, spec §1) drives through this crate:
//! register a [`device::Device`] with the [`device::registry::DeviceRegistry`],
//! create a [`connection::Connection`] on it, and feed CM events to
//! [`connection::dispatcher::dispatch`] as they arrive.

pub mod config;
pub mod connection;
pub mod constants;
pub mod context;
pub mod cq;
pub mod device;
pub mod error;
pub mod observer;
pub mod qp;
pub mod rkey;
pub(crate) mod spawner;
pub mod task;

#[cfg(test)]
pub(crate) mod test_support;

pub use connection::{Connection, ConnectionHandle, ConnState};
pub use context::Context;
pub use device::registry::DeviceRegistry;
pub use device::Device;
pub use error::{RdmaError, Result};
