//! Service definitions: named bundles of protocol/port pairs
//!
//! A [`Service`] is what a user is granted access to ("ssh", "imaps"). Every
//! service expands into one or more (protocol, port) pairs, and each pair
//! becomes one rule in the firewall chain.
//!
//! # Example
//!
//! ```
//! use chainwarden::core::service::{Protocol, Service};
//!
//! let dns = Service::new(
//!     "dns",
//!     "DNS",
//!     vec![(Protocol::Udp, vec![53]), (Protocol::Tcp, vec![53])],
//! )
//! .unwrap();
//!
//! assert!(dns.matches(Protocol::Tcp, 53));
//! assert_eq!(dns.enumerate().count(), 2);
//! ```

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Transport protocol a service port is reachable on
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Transmission Control Protocol
    #[strum(serialize = "tcp")]
    Tcp,
    /// User Datagram Protocol
    #[strum(serialize = "udp")]
    Udp,
}

impl Protocol {
    /// Returns lowercase protocol name as used on the iptables command line
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// Returns display name for human-readable output
    pub const fn display_name(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }

    /// Valid destination ports for this protocol
    pub const fn port_range(self) -> RangeInclusive<u16> {
        match self {
            Protocol::Tcp | Protocol::Udp => 1..=65535,
        }
    }
}

/// IP version of a source address, and of the chain it lives in
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumIter,
)]
pub enum IpVersion {
    #[strum(serialize = "IPv4")]
    V4,
    #[strum(serialize = "IPv6")]
    V6,
}

impl IpVersion {
    /// Address family number, 4 or 6
    pub const fn number(self) -> u8 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }
}

/// Ports of one protocol within a service, in definition order
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProtocolPorts {
    protocol: Protocol,
    ports: Vec<u16>,
}

/// A named set of (protocol, port) pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    code: String,
    name: String,
    definition: Vec<ProtocolPorts>,
}

impl Service {
    /// Builds a service, validating every protocol/port pair.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceDefinition`] if:
    /// - The code is empty
    /// - No protocol/port pair is given
    /// - A protocol is listed twice, or a port twice within one protocol
    /// - A port is outside the protocol's valid range
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        definition: Vec<(Protocol, Vec<u16>)>,
    ) -> Result<Self> {
        let code = code.into();
        let invalid = |message: String| Error::ServiceDefinition {
            code: code.clone(),
            message,
        };

        if code.trim().is_empty() {
            return Err(invalid("service code cannot be empty".to_string()));
        }

        let mut validated: Vec<ProtocolPorts> = Vec::with_capacity(definition.len());
        for (protocol, ports) in definition {
            if validated.iter().any(|p| p.protocol == protocol) {
                return Err(invalid(format!("protocol '{protocol}' listed twice")));
            }
            let range = protocol.port_range();
            for (idx, port) in ports.iter().enumerate() {
                if !range.contains(port) {
                    return Err(invalid(format!(
                        "port {port} not allowed, must be between {} and {}",
                        range.start(),
                        range.end()
                    )));
                }
                if ports[..idx].contains(port) {
                    return Err(invalid(format!("port {protocol}/{port} listed twice")));
                }
            }
            if !ports.is_empty() {
                validated.push(ProtocolPorts { protocol, ports });
            }
        }

        if validated.is_empty() {
            return Err(invalid("need at least one protocol/port pair".to_string()));
        }

        let name = name.into();
        let name = if name.trim().is_empty() {
            code.clone()
        } else {
            name
        };

        Ok(Self {
            code,
            name,
            definition: validated,
        })
    }

    /// Stable identifier, used by rules to refer to this service
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the protocol/port pair belongs to this service
    pub fn matches(&self, protocol: Protocol, port: u16) -> bool {
        self.definition
            .iter()
            .find(|p| p.protocol == protocol)
            .is_some_and(|p| p.ports.contains(&port))
    }

    /// Every (protocol, port) pair, protocols in definition order and ports in
    /// their defined order. Each call starts a fresh iteration.
    pub fn enumerate(&self) -> impl Iterator<Item = (Protocol, u16)> + '_ {
        self.definition
            .iter()
            .flat_map(|p| p.ports.iter().map(move |&port| (p.protocol, port)))
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocols: Vec<String> = self
            .definition
            .iter()
            .map(|p| {
                let ports: Vec<String> = p.ports.iter().map(u16::to_string).collect();
                format!("{}/{}", p.protocol.display_name(), ports.join(","))
            })
            .collect();
        write!(f, "{} [{}]", self.name, protocols.join(" and "))
    }
}

/// Serialized form of a single port entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortDefinition {
    pub protocol: String,
    pub port: u32,
}

/// Serialized form of a service, as found in desired-state documents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
    pub ports: Vec<PortDefinition>,
}

impl TryFrom<ServiceDefinition> for Service {
    type Error = Error;

    fn try_from(def: ServiceDefinition) -> Result<Self> {
        let mut grouped: Vec<(Protocol, Vec<u16>)> = Vec::new();
        for entry in &def.ports {
            let protocol =
                Protocol::from_str(&entry.protocol).map_err(|_| Error::ServiceDefinition {
                    code: def.code.clone(),
                    message: format!(
                        "unknown protocol '{}', known are: tcp, udp",
                        entry.protocol
                    ),
                })?;
            let port = u16::try_from(entry.port)
                .ok()
                .filter(|p| protocol.port_range().contains(p))
                .ok_or_else(|| Error::ServiceDefinition {
                    code: def.code.clone(),
                    message: format!("port {} not allowed, must be between 1 and 65535", entry.port),
                })?;

            match grouped.iter_mut().find(|(p, _)| *p == protocol) {
                Some((_, ports)) => ports.push(port),
                None => grouped.push((protocol, vec![port])),
            }
        }

        let name = def.name.unwrap_or_default();
        Service::new(def.code, name, grouped)
    }
}

/// Known services, in the order they were defined
#[derive(Debug, Clone, Default)]
pub struct ServiceCatalog {
    services: Vec<Service>,
}

impl ServiceCatalog {
    /// # Errors
    ///
    /// Returns [`Error::ServiceDefinition`] when two services share a code.
    pub fn new(services: Vec<Service>) -> Result<Self> {
        for (idx, service) in services.iter().enumerate() {
            if services[..idx].iter().any(|s| s.code == service.code) {
                return Err(Error::ServiceDefinition {
                    code: service.code.clone(),
                    message: "service code defined twice".to_string(),
                });
            }
        }
        Ok(Self { services })
    }

    pub fn get(&self, code: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.code == code)
    }

    /// First service, in catalog order, owning the protocol/port pair
    pub fn find(&self, protocol: Protocol, port: u16) -> Option<&Service> {
        self.services.iter().find(|s| s.matches(protocol, port))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn web() -> Service {
        Service::new(
            "web",
            "Web",
            vec![(Protocol::Tcp, vec![80, 443]), (Protocol::Udp, vec![443])],
        )
        .unwrap()
    }

    #[test]
    fn test_enumerate_follows_definition_order() {
        let pairs: Vec<_> = web().enumerate().collect();
        assert_eq!(
            pairs,
            vec![
                (Protocol::Tcp, 80),
                (Protocol::Tcp, 443),
                (Protocol::Udp, 443)
            ]
        );
    }

    #[test]
    fn test_enumerate_is_restartable() {
        let service = web();
        let first: Vec<_> = service.enumerate().collect();
        let second: Vec<_> = service.enumerate().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_matches() {
        let service = web();
        assert!(service.matches(Protocol::Tcp, 80));
        assert!(service.matches(Protocol::Udp, 443));
        assert!(!service.matches(Protocol::Udp, 80));
        assert!(!service.matches(Protocol::Tcp, 8080));
    }

    #[test]
    fn test_empty_definition_rejected() {
        assert!(matches!(
            Service::new("none", "None", vec![]),
            Err(Error::ServiceDefinition { .. })
        ));
        assert!(Service::new("none", "None", vec![(Protocol::Tcp, vec![])]).is_err());
    }

    #[test]
    fn test_port_zero_rejected() {
        let err = Service::new("bad", "Bad", vec![(Protocol::Tcp, vec![0])]).unwrap_err();
        assert!(err.to_string().contains("port 0"));
    }

    #[test]
    fn test_duplicates_rejected() {
        assert!(Service::new("dup", "Dup", vec![(Protocol::Tcp, vec![22, 22])]).is_err());
        assert!(
            Service::new(
                "dup",
                "Dup",
                vec![(Protocol::Tcp, vec![22]), (Protocol::Tcp, vec![23])]
            )
            .is_err()
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(web().to_string(), "Web [TCP/80,443 and UDP/443]");
    }

    #[test]
    fn test_definition_groups_by_protocol() {
        let def = ServiceDefinition {
            code: "dns".to_string(),
            name: Some("DNS".to_string()),
            ports: vec![
                PortDefinition {
                    protocol: "udp".to_string(),
                    port: 53,
                },
                PortDefinition {
                    protocol: "tcp".to_string(),
                    port: 53,
                },
                PortDefinition {
                    protocol: "udp".to_string(),
                    port: 5353,
                },
            ],
        };
        let service = Service::try_from(def).unwrap();
        let pairs: Vec<_> = service.enumerate().collect();
        assert_eq!(
            pairs,
            vec![
                (Protocol::Udp, 53),
                (Protocol::Udp, 5353),
                (Protocol::Tcp, 53)
            ]
        );
    }

    #[test]
    fn test_definition_rejects_unknown_protocol_and_range() {
        let def = ServiceDefinition {
            code: "x".to_string(),
            name: None,
            ports: vec![PortDefinition {
                protocol: "sctp".to_string(),
                port: 22,
            }],
        };
        let err = Service::try_from(def).unwrap_err();
        assert!(err.to_string().contains("unknown protocol 'sctp'"));

        let def = ServiceDefinition {
            code: "x".to_string(),
            name: None,
            ports: vec![PortDefinition {
                protocol: "tcp".to_string(),
                port: 70_000,
            }],
        };
        assert!(Service::try_from(def).is_err());
    }

    #[test]
    fn test_name_defaults_to_code() {
        let service = Service::new("ssh", "", vec![(Protocol::Tcp, vec![22])]).unwrap();
        assert_eq!(service.name(), "ssh");
    }

    #[test]
    fn test_catalog_lookup() {
        let ssh = Service::new("ssh", "SSH", vec![(Protocol::Tcp, vec![22])]).unwrap();
        let catalog = ServiceCatalog::new(vec![ssh, web()]).unwrap();
        assert_eq!(catalog.find(Protocol::Tcp, 443).unwrap().code(), "web");
        assert_eq!(catalog.get("ssh").unwrap().name(), "SSH");
        assert!(catalog.find(Protocol::Tcp, 9999).is_none());
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_catalog_rejects_duplicate_codes() {
        assert!(ServiceCatalog::new(vec![web(), web()]).is_err());
    }

    fn port_set() -> impl Strategy<Value = Vec<u16>> {
        prop::collection::btree_set(1u16..=65535, 0..6).prop_map(|s| s.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_enumerate_yields_configured_pairs(
            tcp in port_set(),
            udp in port_set(),
            probe_port in 1u16..=65535,
        ) {
            prop_assume!(!tcp.is_empty() || !udp.is_empty());
            let service = Service::new(
                "prop",
                "Prop",
                vec![(Protocol::Tcp, tcp.clone()), (Protocol::Udp, udp.clone())],
            ).unwrap();

            let expected: Vec<(Protocol, u16)> = tcp.iter().map(|&p| (Protocol::Tcp, p))
                .chain(udp.iter().map(|&p| (Protocol::Udp, p)))
                .collect();
            let pairs: Vec<_> = service.enumerate().collect();
            prop_assert_eq!(&pairs, &expected);

            for protocol in [Protocol::Tcp, Protocol::Udp] {
                prop_assert_eq!(
                    service.matches(protocol, probe_port),
                    expected.contains(&(protocol, probe_port))
                );
            }
        }
    }
}
