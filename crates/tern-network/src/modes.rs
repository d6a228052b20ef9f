//! Network modes a container can be attached with.
//!
//! Besides CNI networks a container may share the host's network namespace,
//! have none at all, or join another container's namespace. Only CNI networks
//! can be combined with each other.

use tern_common::{TernError, TernResult};

/// Network name selecting the host network namespace.
pub const HOST_NETWORK: &str = "host";

/// Network name selecting no networking.
pub const NONE_NETWORK: &str = "none";

/// Prefix of `container:<id>` network names.
pub const CONTAINER_PREFIX: &str = "container:";

/// Plugin types that honour a static MAC address.
pub const MAC_CAPABLE_PLUGINS: &[&str] = &["bridge", "macvlan"];

/// Kind of a container network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// One or more CNI networks.
    Cni,
    /// The host network namespace.
    Host,
    /// No networking.
    None,
    /// Another container's network namespace.
    Container,
}

impl NetworkMode {
    /// Classify a single network name.
    #[must_use]
    pub fn classify(name: &str) -> Self {
        match name {
            HOST_NETWORK => Self::Host,
            NONE_NETWORK => Self::None,
            _ if name.starts_with(CONTAINER_PREFIX) => Self::Container,
            _ => Self::Cni,
        }
    }

    /// Mode of a container attached to all of `names`.
    ///
    /// # Errors
    ///
    /// Returns an invalid-argument error if the list is empty, and an
    /// invalid-configuration error if it combines a non-CNI network with
    /// anything else.
    pub fn of_networks<S: AsRef<str>>(names: &[S]) -> TernResult<Self> {
        let Some(first) = names.first() else {
            return Err(TernError::InvalidArgument {
                message: "no network specified".to_string(),
            });
        };

        if names.len() == 1 {
            return Ok(Self::classify(first.as_ref()));
        }

        if let Some(other) = names
            .iter()
            .map(AsRef::as_ref)
            .find(|name| Self::classify(name) != Self::Cni)
        {
            return Err(TernError::invalid_config(format!(
                "network {other} cannot be combined with other networks"
            )));
        }

        Ok(Self::Cni)
    }
}

/// Returns true if the plugin type can set a static MAC address.
#[must_use]
pub fn supports_mac_address(plugin_type: &str) -> bool {
    MAC_CAPABLE_PLUGINS.contains(&plugin_type)
}
