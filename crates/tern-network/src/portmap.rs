//! Published port mappings.
//!
//! The container runtime records published ports as a JSON array in the
//! `nerdctl/ports` label. The engine hands them to the CNI `portmap` plugin
//! through the `portMappings` capability.

use std::fmt;

use serde::{Deserialize, Serialize};
use tern_common::{ResultExt, TernError, TernResult};

/// CNI capability carrying port mappings.
pub const PORT_MAPPINGS_CAPABILITY: &str = "portMappings";

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP (the default).
    #[default]
    Tcp,
    /// UDP.
    Udp,
    /// SCTP.
    Sctp,
}

impl Protocol {
    /// Lowercase protocol name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A port published from the host into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    /// Host port.
    #[serde(alias = "HostPort")]
    pub host_port: u16,
    /// Container port.
    #[serde(alias = "ContainerPort")]
    pub container_port: u16,
    /// Transport protocol.
    #[serde(default, alias = "Protocol")]
    pub protocol: Protocol,
    /// Host address to bind to; all addresses when unset.
    #[serde(
        rename = "hostIP",
        alias = "HostIP",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub host_ip: Option<String>,
}

impl PortMapping {
    /// TCP mapping on all host addresses.
    #[must_use]
    pub const fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: Protocol::Tcp,
            host_ip: None,
        }
    }

    /// Set the protocol.
    #[must_use]
    pub const fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Bind to a single host address.
    #[must_use]
    pub fn with_host_ip(mut self, ip: impl Into<String>) -> Self {
        self.host_ip = Some(ip.into());
        self
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{ip}:")?;
        }
        write!(
            f,
            "{}->{}/{}",
            self.host_port, self.container_port, self.protocol
        )
    }
}

/// Decode the ports label. An empty label means no ports.
///
/// # Errors
///
/// Returns an error if the label is not a JSON array of port mappings.
pub fn parse_ports_label(value: &str) -> TernResult<Vec<PortMapping>> {
    if value.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(value)
        .map_err(TernError::from)
        .context("decode ports label")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_label_has_no_ports() {
        assert!(parse_ports_label("").unwrap().is_empty());
        assert!(parse_ports_label("  ").unwrap().is_empty());
        assert!(parse_ports_label("[]").unwrap().is_empty());
    }

    #[test]
    fn runtime_label_format() {
        let ports = parse_ports_label(
            r#"[{"HostPort":8080,"ContainerPort":80,"Protocol":"tcp","HostIP":"127.0.0.1"},
                {"HostPort":5353,"ContainerPort":53,"Protocol":"udp"}]"#,
        )
        .unwrap();

        assert_eq!(
            ports,
            vec![
                PortMapping::tcp(8080, 80).with_host_ip("127.0.0.1"),
                PortMapping::tcp(5353, 53).with_protocol(Protocol::Udp),
            ]
        );
    }

    #[test]
    fn capability_format() {
        let json = serde_json::to_value(vec![
            PortMapping::tcp(8080, 80).with_host_ip("0.0.0.0"),
            PortMapping::tcp(9000, 9000).with_protocol(Protocol::Sctp),
        ])
        .unwrap();

        assert_eq!(
            json,
            serde_json::json!([
                {"hostPort": 8080, "containerPort": 80, "protocol": "tcp", "hostIP": "0.0.0.0"},
                {"hostPort": 9000, "containerPort": 9000, "protocol": "sctp"}
            ])
        );
    }

    #[test]
    fn protocol_defaults_to_tcp() {
        let ports = parse_ports_label(r#"[{"hostPort":1,"containerPort":2}]"#).unwrap();
        assert_eq!(ports[0].protocol, Protocol::Tcp);
    }

    #[test]
    fn malformed_label_is_an_error() {
        let err = parse_ports_label("{not json").unwrap_err();
        assert!(err.to_string().contains("decode ports label"));
    }

    #[test]
    fn display() {
        assert_eq!(PortMapping::tcp(8080, 80).to_string(), "8080->80/tcp");
        assert_eq!(
            PortMapping::tcp(53, 53)
                .with_protocol(Protocol::Udp)
                .with_host_ip("10.0.0.1")
                .to_string(),
            "10.0.0.1:53->53/udp"
        );
    }
}
