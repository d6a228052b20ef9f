//! Bridge network driver.
//!
//! The CNI bridge plugin has no notion of ICC, host binding addresses or
//! user-chosen bridge names. This driver strips those options from the
//! create request and applies them itself once the network exists: the bridge
//! name by editing the conflist, ICC by installing an isolation rule.

use std::collections::BTreeMap;

use tern_common::{ResultExt, TernError, TernResult, labels};

use crate::conflist::{self, BRIDGE_FIELD, BRIDGE_PLUGIN};
use crate::driver::{CreateOptions, DriverPlan, IsolationReport, NetworkDriver, PreparedCreate};
use crate::iptables::{FilterBackends, IsolationRule};
use crate::network::NetworkConfig;

/// Docker option for the host address published ports bind to.
pub const OPTION_HOST_BINDING_IPV4: &str = "com.docker.network.bridge.host_binding_ipv4";

/// Docker option enabling or disabling inter-container communication.
pub const OPTION_ENABLE_ICC: &str = "com.docker.network.bridge.enable_icc";

/// Docker option naming the host bridge interface.
pub const OPTION_BRIDGE_NAME: &str = "com.docker.network.bridge.name";

/// The only host binding address the CNI layer supports.
const ANY_IPV4: &str = "0.0.0.0";

/// Bridge follow-up work decided at option time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgePlan {
    /// Install an isolation rule after creation.
    pub disable_icc: bool,
    /// Custom bridge interface name to write into the conflist.
    pub bridge_name: Option<String>,
    /// Whether the network is IPv6-enabled.
    pub ipv6: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeOption {
    HostBinding,
    EnableIcc,
    BridgeName,
}

impl BridgeOption {
    fn parse(key: &str) -> Option<Self> {
        match key {
            OPTION_HOST_BINDING_IPV4 | "host_binding_ipv4" => Some(Self::HostBinding),
            OPTION_ENABLE_ICC | "enable_icc" => Some(Self::EnableIcc),
            OPTION_BRIDGE_NAME | "bridge_name" => Some(Self::BridgeName),
            _ => None,
        }
    }
}

/// Parse the canonical boolean spellings (`1`, `t`, `TRUE`, `false`, ...).
#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Whether the labels disable ICC, and if so whether IPv6 is in scope.
#[must_use]
pub fn icc_disabled_scope(network_labels: &BTreeMap<String, String>) -> Option<bool> {
    let disabled = |key: &str| {
        network_labels
            .get(key)
            .and_then(|value| parse_bool(value))
            == Some(false)
    };

    if disabled(labels::ICC_DISABLED_IPV6) {
        Some(true)
    } else if disabled(labels::ICC_DISABLED_IPV4) {
        Some(false)
    } else {
        None
    }
}

/// Driver for CNI `bridge` networks.
#[derive(Debug, Clone)]
pub struct BridgeDriver {
    filters: FilterBackends,
}

impl BridgeDriver {
    /// Bridge driver installing isolation rules through `filters`.
    #[must_use]
    pub fn new(filters: FilterBackends) -> Self {
        Self { filters }
    }

    /// Host bridge interface of a network.
    ///
    /// Read from the conflist when there is one, otherwise from the in-memory
    /// bridge plugin entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the network has no single bridge plugin with a name.
    pub fn bridge_name(network: &NetworkConfig) -> TernResult<String> {
        if let Some(path) = &network.config_file {
            return conflist::read_bridge_name(path);
        }

        network
            .plugin(BRIDGE_PLUGIN)?
            .string_field(BRIDGE_FIELD)
            .ok_or_else(|| {
                TernError::invalid_config(format!(
                    "bridge plugin of network {} has no bridge name",
                    network.name
                ))
            })
    }

    fn rename_bridge(network: &NetworkConfig, name: &str) -> TernResult<()> {
        let path = network.config_file.as_deref().ok_or_else(|| {
            TernError::invalid_config(format!("network {} has no config file", network.name))
        })?;
        conflist::write_bridge_name(path, name)
    }
}

impl NetworkDriver for BridgeDriver {
    fn name(&self) -> &str {
        BRIDGE_PLUGIN
    }

    fn handle_create_options(&self, mut options: CreateOptions) -> TernResult<PreparedCreate> {
        let mut plan = BridgePlan {
            ipv6: options.ipv6,
            ..BridgePlan::default()
        };
        let mut warnings = Vec::new();

        for (key, value) in std::mem::take(&mut options.options) {
            match BridgeOption::parse(&key) {
                Some(BridgeOption::HostBinding) => {
                    if value != ANY_IPV4 {
                        warnings.push(format!(
                            "network option {key} is set to {value}, but only {ANY_IPV4} is supported; option ignored"
                        ));
                    }
                }
                Some(BridgeOption::EnableIcc) => match parse_bool(&value) {
                    Some(true) => {}
                    Some(false) => {
                        plan.disable_icc = true;
                        options
                            .labels
                            .insert(labels::icc_label(options.ipv6).to_string(), "false".to_string());
                    }
                    None => warnings.push(format!(
                        "network option {key} has invalid boolean value {value:?}; option ignored"
                    )),
                },
                Some(BridgeOption::BridgeName) => {
                    if !value.is_empty() {
                        plan.bridge_name = Some(value);
                    }
                }
                None => {
                    options.options.insert(key, value);
                }
            }
        }

        tracing::debug!(
            network = %options.name,
            disable_icc = plan.disable_icc,
            bridge_name = ?plan.bridge_name,
            "Bridge create options handled"
        );

        Ok(PreparedCreate {
            options,
            plan: DriverPlan::Bridge(plan),
            warnings,
        })
    }

    fn handle_post_create(
        &self,
        plan: &DriverPlan,
        network: &NetworkConfig,
    ) -> TernResult<Option<String>> {
        let DriverPlan::Bridge(plan) = plan else {
            return Ok(None);
        };

        let mut warning = None;
        if let Some(name) = &plan.bridge_name {
            if let Err(e) = Self::rename_bridge(network, name) {
                tracing::warn!(network = %network.name, bridge = %name, error = %e, "Failed to set custom bridge name");
                warning = Some(format!(
                    "Failed to set custom bridge name {name} for network {}: {e}",
                    network.name
                ));
            }
        }

        if plan.disable_icc {
            let bridge = Self::bridge_name(network).context("resolve bridge name")?;
            self.filters
                .scope(plan.ipv6)
                .add_rule(&IsolationRule::new(bridge))
                .with_context(|| format!("disable ICC on network {}", network.name))?;
        }

        Ok(warning)
    }

    fn handle_remove(&self, network: &NetworkConfig) -> TernResult<()> {
        let scope = icc_disabled_scope(&network.labels);
        let bridge = match Self::bridge_name(network) {
            Ok(bridge) => bridge,
            Err(e) if scope.is_none() => {
                tracing::debug!(network = %network.name, error = %e, "No bridge to clean up");
                return Ok(());
            }
            Err(e) => return Err(e.context("resolve bridge name")),
        };

        let ipv6 = scope.unwrap_or(false) || network.ipv6_enabled();
        self.filters
            .scope(ipv6)
            .del_rule(&IsolationRule::new(bridge))
            .with_context(|| format!("remove isolation rule of network {}", network.name))
    }

    fn reconcile(&self, network: &NetworkConfig, repair: bool) -> TernResult<IsolationReport> {
        let scope = icc_disabled_scope(&network.labels);
        let expected = scope.is_some();
        let rules = self
            .filters
            .scope(scope.unwrap_or_else(|| network.ipv6_enabled()));
        let rule = IsolationRule::new(Self::bridge_name(network).context("resolve bridge name")?);

        let missing = rules.missing_families(&rule)?;
        let inconsistent = if expected {
            missing
        } else {
            rules
                .families()
                .into_iter()
                .filter(|family| !missing.contains(family))
                .collect()
        };

        let mut report = IsolationReport {
            network: network.name.clone(),
            expected,
            inconsistent,
            repaired: false,
        };

        if repair && !report.inconsistent.is_empty() {
            if expected {
                rules.add_rule(&rule)?;
            } else {
                rules.del_rule(&rule)?;
            }
            report.repaired = true;
            tracing::info!(
                network = %network.name,
                families = ?report.inconsistent,
                "Isolation state repaired"
            );
        }

        Ok(report)
    }
}
