// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

use net::{PortRange, Protocol};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

/// Management capabilities a zone can be granted toward the host.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Web,
    Api,
    Ssh,
    Icmp,
    Snmp,
    Syslog,
    Dns,
    Dhcp,
    Ntp,
}

impl Capability {
    pub const ALL: [Capability; 9] = [
        Capability::Web,
        Capability::Api,
        Capability::Ssh,
        Capability::Icmp,
        Capability::Snmp,
        Capability::Syslog,
        Capability::Dns,
        Capability::Dhcp,
        Capability::Ntp,
    ];
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::Web => "web",
            Capability::Api => "api",
            Capability::Ssh => "ssh",
            Capability::Icmp => "icmp",
            Capability::Snmp => "snmp",
            Capability::Syslog => "syslog",
            Capability::Dns => "dns",
            Capability::Dhcp => "dhcp",
            Capability::Ntp => "ntp",
        };
        write!(f, "{name}")
    }
}

/// A custom port exposure a zone offers to the host beyond the named
/// management capabilities.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServiceExposure {
    pub name: String,
    pub proto: Protocol,
    pub ports: Vec<PortRange>,
}

/// One `zone { … }` block.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ZoneConfig {
    pub name: String,
    pub management: BTreeSet<Capability>,
    pub services: Vec<ServiceExposure>,
    /// External (WAN-facing) zones get masquerade-by-default treatment in
    /// examples; the compiler only reads the flag, policy stays explicit.
    pub external: bool,
}
