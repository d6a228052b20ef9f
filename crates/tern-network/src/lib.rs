//! # tern-network
//!
//! Network-level building blocks for the tern engine.
//!
//! This crate provides:
//! - CNI network definitions and conflist editing under a directory lock
//! - The network driver extension point and the bridge driver
//! - Inter-container isolation rules over `iptables`/`ip6tables`
//! - Network mode classification and port mapping types

#![warn(missing_docs)]

pub mod bridge;
pub mod conflist;
pub mod driver;
pub mod iptables;
pub mod lock;
pub mod modes;
pub mod network;
pub mod portmap;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bridge::{BridgeDriver, BridgePlan};
pub use driver::{
    CreateOptions, DriverPlan, DriverRegistry, IsolationReport, NetworkDriver, PreparedCreate,
};
pub use iptables::{FilterBackend, FilterBackends, FilterError, IpFamily, IptablesCommand};
pub use lock::DirLock;
pub use modes::NetworkMode;
pub use network::{NetworkConfig, PluginConfig};
pub use portmap::{PortMapping, Protocol};
