//! Connection management shared by every backend
//!
//! This module handles:
//! - The owner-facing connection handle
//! - The per-connection driver task (I/O, ordering, teardown)
//! - Server listeners and their peer registries

pub(crate) mod driver;
mod handle;
mod listener;
mod registry;

pub use handle::{Connection, ConnectionRole};
pub use listener::Listener;
pub use registry::ConnectionRegistry;
