//! Engine configuration.

use std::sync::Arc;

use tern_common::NetworkPaths;
use tern_network::iptables::{DEFAULT_ISOLATION_CHAIN, FilterBackends, IpFamily, IptablesCommand};

/// Engine configuration options.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// CNI configuration and procfs locations.
    pub paths: NetworkPaths,
    /// Name of the isolation chain in the `filter` table.
    pub isolation_chain: String,
    /// Command managing IPv4 rules.
    pub iptables_binary: String,
    /// Command managing IPv6 rules.
    pub ip6tables_binary: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            paths: NetworkPaths::new(),
            isolation_chain: DEFAULT_ISOLATION_CHAIN.to_string(),
            iptables_binary: IpFamily::V4.binary().to_string(),
            ip6tables_binary: IpFamily::V6.binary().to_string(),
        }
    }
}

impl EngineConfig {
    /// Create a rootless configuration.
    #[must_use]
    pub fn rootless() -> Self {
        Self {
            paths: NetworkPaths::rootless(),
            ..Self::default()
        }
    }

    /// Set the CNI configuration directory.
    #[must_use]
    pub fn with_cni_config_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.paths = self.paths.with_cni_config_dir(dir);
        self
    }

    /// Set the procfs root.
    #[must_use]
    pub fn with_proc_root(mut self, root: impl Into<std::path::PathBuf>) -> Self {
        self.paths = self.paths.with_proc_root(root);
        self
    }

    /// Set the isolation chain name.
    #[must_use]
    pub fn with_isolation_chain(mut self, chain: impl Into<String>) -> Self {
        self.isolation_chain = chain.into();
        self
    }

    /// Use different filter commands (e.g. the `-legacy` variants).
    #[must_use]
    pub fn with_filter_binaries(
        mut self,
        iptables: impl Into<String>,
        ip6tables: impl Into<String>,
    ) -> Self {
        self.iptables_binary = iptables.into();
        self.ip6tables_binary = ip6tables.into();
        self
    }

    /// Filter backends running the configured commands.
    #[must_use]
    pub fn filter_backends(&self) -> FilterBackends {
        FilterBackends::new(
            self.isolation_chain.clone(),
            Arc::new(IptablesCommand::new(IpFamily::V4).with_binary(&self.iptables_binary)),
            Arc::new(IptablesCommand::new(IpFamily::V6).with_binary(&self.ip6tables_binary)),
        )
    }
}
