//! Standard filesystem paths for tern.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default directory holding CNI network configuration lists.
pub static DEFAULT_CNI_CONFIG_DIR: Lazy<PathBuf> = Lazy::new(|| PathBuf::from("/etc/cni/net.d"));

/// Default procfs mount used to derive network namespace paths.
pub static DEFAULT_PROC_ROOT: Lazy<PathBuf> = Lazy::new(|| PathBuf::from("/proc"));

/// File name prefix of conflists written for tern networks.
pub const CONFLIST_PREFIX: &str = "tern-";

/// File extension of CNI configuration lists.
pub const CONFLIST_EXTENSION: &str = "conflist";

/// Paths used by the network engine.
#[derive(Debug, Clone)]
pub struct NetworkPaths {
    /// CNI configuration directory (default: /etc/cni/net.d).
    pub cni_config_dir: PathBuf,
    /// procfs root (default: /proc).
    pub proc_root: PathBuf,
}

impl NetworkPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths for a rootless setup, with conflists under the user's config dir.
    #[must_use]
    pub fn rootless() -> Self {
        let config = dirs::config_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        Self {
            cni_config_dir: config.join("cni").join("net.d"),
            proc_root: DEFAULT_PROC_ROOT.clone(),
        }
    }

    /// Use a custom CNI configuration directory.
    #[must_use]
    pub fn with_cni_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cni_config_dir = dir.into();
        self
    }

    /// Use a custom procfs root.
    #[must_use]
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    /// Conflist file for a network, named deterministically from its name.
    #[must_use]
    pub fn conflist(&self, network: &str) -> PathBuf {
        self.cni_config_dir
            .join(format!("{CONFLIST_PREFIX}{network}.{CONFLIST_EXTENSION}"))
    }

    /// Network namespace of a process.
    #[must_use]
    pub fn netns(&self, pid: u32) -> PathBuf {
        self.proc_root.join(pid.to_string()).join("ns").join("net")
    }
}

impl Default for NetworkPaths {
    fn default() -> Self {
        Self {
            cni_config_dir: DEFAULT_CNI_CONFIG_DIR.clone(),
            proc_root: DEFAULT_PROC_ROOT.clone(),
        }
    }
}
