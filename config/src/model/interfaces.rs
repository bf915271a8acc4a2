// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// What sort of link an [`InterfaceConfig`] describes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Physical,
    Vlan,
    Bond,
    Bridge,
    Wireguard,
    Pppoe,
    Tunnel,
}

impl Display for InterfaceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InterfaceKind::Physical => "physical",
            InterfaceKind::Vlan => "vlan",
            InterfaceKind::Bond => "bond",
            InterfaceKind::Bridge => "bridge",
            InterfaceKind::Wireguard => "wireguard",
            InterfaceKind::Pppoe => "pppoe",
            InterfaceKind::Tunnel => "tunnel",
        };
        write!(f, "{name}")
    }
}

/// Bond aggregation modes flywall knows how to realise.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BondMode {
    #[default]
    ActiveBackup,
    #[serde(rename = "802.3ad")]
    Lacp,
    BalanceXor,
    BalanceRr,
}

/// One `interface { … }` block. Names are raw strings here; the validator
/// enforces kernel naming rules and produces checked types.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterfaceConfig {
    pub name: String,
    pub kind: InterfaceKind,
    /// Explicit zone. Absent means an implicit zone named after the interface.
    pub zone: Option<String>,
    pub addresses: Vec<IpNet>,
    pub mtu: Option<u32>,
    #[serde(rename = "dhcp-client")]
    pub dhcp_client: bool,
    /// VLAN only: the carrier link.
    pub parent: Option<String>,
    /// VLAN only.
    pub vlan_id: Option<u16>,
    /// Bond/bridge only.
    pub members: Vec<String>,
    /// Bond only.
    pub bond_mode: Option<BondMode>,
    /// Bridge only: enable 802.1Q filtering on the bridge.
    pub vlan_filtering: bool,
    /// Policy-routing table for routes learned on this interface.
    pub table: Option<u32>,
    /// Administratively disabled interfaces are still realised, just down.
    pub disabled: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        InterfaceConfig {
            name: String::new(),
            kind: InterfaceKind::Physical,
            zone: None,
            addresses: Vec::new(),
            mtu: None,
            dhcp_client: false,
            parent: None,
            vlan_id: None,
            members: Vec::new(),
            bond_mode: None,
            vlan_filtering: false,
            table: None,
            disabled: false,
        }
    }
}

impl InterfaceConfig {
    /// The zone this interface belongs to after implicit-zone expansion.
    #[must_use]
    pub fn effective_zone(&self) -> &str {
        self.zone.as_deref().unwrap_or(&self.name)
    }
}
