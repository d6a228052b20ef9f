//! Container and network label keys shared with the container runtime.

/// JSON string array of the networks a container is attached to.
///
/// Stored both as a container label and as an OCI spec annotation.
pub const NETWORKS: &str = "nerdctl/networks";

/// Index of the most recently assigned container interface (`eth<index>`).
pub const NETWORK_INDEX: &str = "finch/network-index";

/// Requested static IP address.
pub const IP_ADDRESS: &str = "nerdctl/ip";

/// Requested static MAC address.
pub const MAC_ADDRESS: &str = "nerdctl/mac-address";

/// JSON array of CNI port mappings.
pub const PORTS: &str = "nerdctl/ports";

/// Container name.
pub const NAME: &str = "nerdctl/name";

/// Network label recording that ICC is disabled on an IPv4 network.
pub const ICC_DISABLED_IPV4: &str = "finch.network.bridge.enable_icc.ipv4";

/// Network label recording that ICC is disabled on an IPv6-enabled network.
pub const ICC_DISABLED_IPV6: &str = "finch.network.bridge.enable_icc.ipv6";

/// The ICC label key for a network.
#[must_use]
pub const fn icc_label(ipv6: bool) -> &'static str {
    if ipv6 { ICC_DISABLED_IPV6 } else { ICC_DISABLED_IPV4 }
}
