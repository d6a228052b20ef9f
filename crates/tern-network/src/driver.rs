//! Network driver extension point.
//!
//! A driver gets three hooks around network creation and removal. Drivers
//! register themselves in a [`DriverRegistry`] by name; networks whose driver
//! is not registered are created without any hook.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tern_common::TernResult;

use crate::bridge::{BridgeDriver, BridgePlan};
use crate::iptables::{FilterBackends, IpFamily};
use crate::network::NetworkConfig;

/// Driver used when a create request names none.
pub const DEFAULT_DRIVER: &str = "bridge";

/// IPAM driver used when a create request names none.
pub const DEFAULT_IPAM_DRIVER: &str = "default";

/// Driver-neutral network creation options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    /// Network name.
    pub name: String,
    /// Network driver.
    pub driver: String,
    /// IPAM driver.
    pub ipam_driver: String,
    /// Subnet in CIDR notation.
    pub subnet: Option<String>,
    /// Range to allocate container addresses from.
    pub ip_range: Option<String>,
    /// Gateway address.
    pub gateway: Option<String>,
    /// Driver options.
    pub options: BTreeMap<String, String>,
    /// Network labels.
    pub labels: BTreeMap<String, String>,
    /// Whether IPv6 is enabled.
    pub ipv6: bool,
}

impl CreateOptions {
    /// Options with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: DEFAULT_DRIVER.to_string(),
            ipam_driver: DEFAULT_IPAM_DRIVER.to_string(),
            subnet: None,
            ip_range: None,
            gateway: None,
            options: BTreeMap::new(),
            labels: BTreeMap::new(),
            ipv6: false,
        }
    }
}

/// What a driver decided while rewriting create options.
///
/// Returned by [`NetworkDriver::handle_create_options`] and handed back to
/// [`NetworkDriver::handle_post_create`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DriverPlan {
    /// Nothing to do after creation.
    #[default]
    None,
    /// Bridge driver follow-up work.
    Bridge(BridgePlan),
}

/// Result of [`NetworkDriver::handle_create_options`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCreate {
    /// Options to create the network with.
    pub options: CreateOptions,
    /// Follow-up work for after creation.
    pub plan: DriverPlan,
    /// Non-fatal problems with the request.
    pub warnings: Vec<String>,
}

/// Consistency of a network's isolation label with its filter rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsolationReport {
    /// Network name.
    pub network: String,
    /// Whether the labels say ICC is disabled.
    pub expected: bool,
    /// Families in scope whose rule state disagrees with the label.
    pub inconsistent: Vec<IpFamily>,
    /// Whether the disagreement was repaired.
    pub repaired: bool,
}

impl IsolationReport {
    /// Returns true if label and rules agree (after any repair).
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.inconsistent.is_empty() || self.repaired
    }
}

/// Hooks a network driver runs around the CNI layer.
pub trait NetworkDriver: Send + Sync + fmt::Debug {
    /// Driver name, as used in create requests.
    fn name(&self) -> &str;

    /// Rewrite or filter the create options before the network is created.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be served by this driver.
    fn handle_create_options(&self, options: CreateOptions) -> TernResult<PreparedCreate>;

    /// Side effects once the network exists. Returns a warning, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the network exists but could not be completed.
    fn handle_post_create(
        &self,
        plan: &DriverPlan,
        network: &NetworkConfig,
    ) -> TernResult<Option<String>>;

    /// Side effects before the network is removed.
    ///
    /// # Errors
    ///
    /// Returns an error if cleanup failed.
    fn handle_remove(&self, network: &NetworkConfig) -> TernResult<()>;

    /// Compare what the driver set up with what the labels ask for, and
    /// optionally repair it.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be inspected or repaired.
    fn reconcile(&self, network: &NetworkConfig, _repair: bool) -> TernResult<IsolationReport> {
        Ok(IsolationReport {
            network: network.name.clone(),
            ..IsolationReport::default()
        })
    }
}

/// Registered drivers by name.
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn NetworkDriver>>,
}

impl DriverRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in bridge driver.
    #[must_use]
    pub fn with_defaults(filters: FilterBackends) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BridgeDriver::new(filters)));
        registry
    }

    /// Register a driver, replacing any driver with the same name.
    pub fn register(&mut self, driver: Arc<dyn NetworkDriver>) {
        tracing::debug!(driver = driver.name(), "Registering network driver");
        self.drivers.insert(driver.name().to_string(), driver);
    }

    /// Driver by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn NetworkDriver>> {
        self.drivers.get(name).cloned()
    }

    /// Driver of an existing network, chosen by its primary plugin type.
    #[must_use]
    pub fn for_network(&self, network: &NetworkConfig) -> Option<Arc<dyn NetworkDriver>> {
        network.primary_plugin_type().and_then(|t| self.get(t))
    }
}
