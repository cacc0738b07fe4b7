//! # skiff-core
//!
//! The instance lifecycle core of the Skiff daemon: the authoritative
//! instance registry, the per-instance state machine, MAC address
//! allocation, mount coordination, the creation pipeline, and the persisted
//! representation of all of the above.
//!
//! Hypervisor back-ends, image acquisition, blueprint resolution, guest
//! shell sessions, and the settings store are pluggable collaborators behind
//! the traits in [`hypervisor`].

pub mod cloudinit;
pub mod config;
mod create;
mod daemon;
pub mod error;
pub mod hypervisor;
pub mod mac;
pub mod mounts;
mod names;
pub mod persistence;
pub mod selection;
mod shutdown;
pub mod spec;
pub mod validation;

#[cfg(test)]
mod testing;

pub use config::DaemonConfig;
pub use daemon::Daemon;
pub use error::{CoreError, Result};
pub use names::DefaultNameGenerator;
pub use shutdown::DelayedShutdownRegistry;
