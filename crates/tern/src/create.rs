//! Creating networks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tern_common::{TernError, TernResult};
use tern_network::driver::{DEFAULT_DRIVER, DEFAULT_IPAM_DRIVER};
use tern_network::{CreateOptions, DriverPlan};

use crate::service::{NetworkService, run_blocking};

/// Address pool of a create request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpamConfig {
    /// Subnet in CIDR notation.
    #[serde(default)]
    pub subnet: Option<String>,
    /// Range to allocate container addresses from.
    #[serde(rename = "IPRange", default)]
    pub ip_range: Option<String>,
    /// Gateway address.
    #[serde(default)]
    pub gateway: Option<String>,
}

/// IPAM section of a create request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpamRequest {
    /// IPAM driver, `default` when unset.
    #[serde(default)]
    pub driver: Option<String>,
    /// Address pools; only the first one is used.
    #[serde(default)]
    pub config: Vec<IpamConfig>,
}

/// A network create request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRequest {
    /// Network name.
    pub name: String,
    /// Network driver, `bridge` when unset.
    #[serde(default)]
    pub driver: Option<String>,
    /// Address management.
    #[serde(rename = "IPAM", default)]
    pub ipam: IpamRequest,
    /// Driver options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Network labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Enable IPv6.
    #[serde(rename = "EnableIPv6", default)]
    pub enable_ipv6: bool,
}

impl CreateRequest {
    /// Request for a network with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the driver.
    #[must_use]
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    /// Add a driver option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Add a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add an address pool.
    #[must_use]
    pub fn with_ipam_config(mut self, config: IpamConfig) -> Self {
        self.ipam.config.push(config);
        self
    }

    /// Enable IPv6.
    #[must_use]
    pub const fn with_ipv6(mut self) -> Self {
        self.enable_ipv6 = true;
        self
    }

    /// Driver-neutral create options with defaults applied.
    #[must_use]
    pub fn into_options(self) -> CreateOptions {
        let non_empty = |value: Option<String>, default: &str| {
            value
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let pool = self.ipam.config.into_iter().next().unwrap_or_default();

        CreateOptions {
            name: self.name,
            driver: non_empty(self.driver, DEFAULT_DRIVER),
            ipam_driver: non_empty(self.ipam.driver, DEFAULT_IPAM_DRIVER),
            subnet: pool.subnet,
            ip_range: pool.ip_range,
            gateway: pool.gateway,
            options: self.options,
            labels: self.labels,
            ipv6: self.enable_ipv6,
        }
    }
}

/// Outcome of a create request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateResponse {
    /// ID of the created (or already existing) network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Non-fatal problems, one per line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

fn join_warnings(warnings: Vec<String>) -> Option<String> {
    (!warnings.is_empty()).then(|| warnings.join("\n"))
}

impl NetworkService {
    /// Create a network.
    ///
    /// Creating a network that already exists succeeds with a warning.
    ///
    /// # Errors
    ///
    /// Returns an invalid-argument error for an empty name,
    /// [`TernError::PluginNotFound`] for an unsupported driver,
    /// [`TernError::MissingNetworkId`] if the store returns no ID, or the
    /// error of the failed step.
    pub async fn create(&self, request: CreateRequest) -> TernResult<CreateResponse> {
        if request.name.is_empty() {
            return Err(TernError::InvalidArgument {
                message: "network name must not be empty".to_string(),
            });
        }

        match self.inspect(&request.name).await {
            Ok(existing) => {
                let warning = match &existing.id {
                    Some(id) => format!(
                        "Network with name '{}' (id: {id}) already exists",
                        request.name
                    ),
                    None => format!("Network with name '{}' already exists", request.name),
                };
                tracing::debug!(network = %request.name, "Network already exists");
                return Ok(CreateResponse {
                    id: existing.id,
                    warning: Some(warning),
                });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let options = request.into_options();
        let driver = self.drivers().get(&options.driver);
        let (options, plan, mut warnings) = match &driver {
            Some(driver) => {
                let prepared = driver.handle_create_options(options)?;
                (prepared.options, prepared.plan, prepared.warnings)
            }
            None => (options, DriverPlan::None, Vec::new()),
        };

        let network = match self.store().create_network(&options).await {
            Ok(Some(network)) if network.id.is_some() => network,
            Ok(_) => {
                return Err(TernError::MissingNetworkId {
                    network: options.name,
                });
            }
            Err(e) if matches!(e.root(), TernError::UnsupportedDriver { .. }) => {
                return Err(TernError::PluginNotFound {
                    driver: options.driver,
                });
            }
            Err(e) => return Err(e.context(format!("create network {}", options.name))),
        };

        if let Some(driver) = driver {
            let created = network.clone();
            let warning = run_blocking(move || driver.handle_post_create(&plan, &created)).await?;
            warnings.extend(warning);
        }

        tracing::info!(network = %network.name, id = ?network.id, driver = %options.driver, "Network created");
        Ok(CreateResponse {
            id: network.id,
            warning: join_warnings(warnings),
        })
    }
}
