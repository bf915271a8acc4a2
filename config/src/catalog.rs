// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The built-in service catalog used to expand `service` aliases in policy
//! rules and the port bindings behind zone management capabilities.

use crate::model::Capability;
use net::{Port, PortRange, Protocol};

/// A protocol plus destination ports, the expansion of one alias leg.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePorts {
    pub proto: Protocol,
    pub ports: Vec<PortRange>,
}

fn tcp(ports: &[u16]) -> ServicePorts {
    ServicePorts {
        proto: Protocol::Tcp,
        ports: ranges(ports),
    }
}

fn udp(ports: &[u16]) -> ServicePorts {
    ServicePorts {
        proto: Protocol::Udp,
        ports: ranges(ports),
    }
}

fn ranges(ports: &[u16]) -> Vec<PortRange> {
    ports
        .iter()
        .map(|p| PortRange::single(Port::try_from(*p).unwrap_or_else(|_| unreachable!())))
        .collect()
}

/// Expand a service alias. `None` means the alias is unknown and the
/// validator reports it at the referencing path.
#[must_use]
pub fn expand_service(alias: &str) -> Option<Vec<ServicePorts>> {
    let legs = match alias {
        "web" => vec![tcp(&[80, 443])],
        "dns" => vec![udp(&[53]), tcp(&[53])],
        "ssh" => vec![tcp(&[22])],
        "smtp" => vec![tcp(&[25, 465, 587])],
        "imap" => vec![tcp(&[143, 993])],
        "snmp" => vec![udp(&[161])],
        "syslog" => vec![udp(&[514])],
        "ntp" => vec![udp(&[123])],
        "dhcp" => vec![udp(&[67, 68])],
        "api" => vec![tcp(&[8443])],
        "icmp" => vec![ServicePorts {
            proto: Protocol::Icmp,
            ports: Vec::new(),
        }],
        _ => return None,
    };
    Some(legs)
}

/// Ports the host opens toward a zone holding a management capability.
#[must_use]
pub fn capability_ports(capability: Capability) -> Vec<ServicePorts> {
    match capability {
        Capability::Web => vec![tcp(&[80, 443])],
        Capability::Api => vec![tcp(&[8443])],
        Capability::Ssh => vec![tcp(&[22])],
        Capability::Icmp => vec![ServicePorts {
            proto: Protocol::Icmp,
            ports: Vec::new(),
        }],
        Capability::Snmp => vec![udp(&[161])],
        Capability::Syslog => vec![udp(&[514])],
        Capability::Dns => vec![udp(&[53]), tcp(&[53])],
        Capability::Dhcp => vec![udp(&[67])],
        Capability::Ntp => vec![udp(&[123])],
    }
}

/// DHCP option names the scope `options` map accepts, resolved to codes.
/// Numeric strings pass through as-is.
#[must_use]
pub fn dhcp_option_code(name: &str) -> Option<u8> {
    if let Ok(code) = name.parse::<u8>() {
        return Some(code);
    }
    let code = match name {
        "subnet_mask" => 1,
        "router" => 3,
        "dns" | "domain_name_servers" => 6,
        "hostname" => 12,
        "domain" | "domain_name" => 15,
        "broadcast" => 28,
        "ntp_servers" => 42,
        "netbios_name_servers" => 44,
        "lease_time" => 51,
        "tftp_server" => 66,
        "bootfile" => 67,
        "tftp_server_address" => 150,
        _ => return None,
    };
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_aliases_expand() {
        let web = expand_service("web").unwrap();
        assert_eq!(web.len(), 1);
        assert_eq!(web[0].proto, Protocol::Tcp);
        assert_eq!(web[0].ports.len(), 2);

        let dns = expand_service("dns").unwrap();
        assert_eq!(dns.len(), 2);

        assert!(expand_service("gopher").is_none());
    }

    #[test]
    fn every_capability_expands() {
        for cap in Capability::ALL {
            assert!(!capability_ports(cap).is_empty(), "{cap} has no ports");
        }
    }

    #[test]
    fn dhcp_option_names() {
        assert_eq!(dhcp_option_code("tftp_server"), Some(66));
        assert_eq!(dhcp_option_code("150"), Some(150));
        assert_eq!(dhcp_option_code("frobnicator"), None);
    }
}
