// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The planned properties of the link set, derived from the validated model.

use config::{BondMode, InterfaceConfig, InterfaceKind, ValidModel};
use ipnet::IpNet;
use net::{AdminState, InterfaceName, Mtu, VlanId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Kind-specific desired properties.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LinkKind {
    /// Exists in hardware; flywall only adjusts it.
    Physical,
    Vlan {
        parent: InterfaceName,
        vlan_id: VlanId,
    },
    Bond {
        mode: BondMode,
        members: Vec<InterfaceName>,
    },
    Bridge {
        vlan_filtering: bool,
        members: Vec<InterfaceName>,
    },
    /// Created and keyed by the wireguard orchestrator; the link reconciler
    /// only orders and observes these.
    Wireguard,
    Pppoe,
    Tunnel,
}

impl LinkKind {
    /// Links this one cannot exist without.
    #[must_use]
    pub fn dependencies(&self) -> Vec<&InterfaceName> {
        match self {
            LinkKind::Vlan { parent, .. } => vec![parent],
            LinkKind::Bond { members, .. } | LinkKind::Bridge { members, .. } => {
                members.iter().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Whether flywall creates and deletes this link itself.
    #[must_use]
    pub fn managed(&self) -> bool {
        matches!(
            self,
            LinkKind::Vlan { .. } | LinkKind::Bond { .. } | LinkKind::Bridge { .. }
        )
    }
}

/// The intended state for one network interface.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub name: InterfaceName,
    pub kind: LinkKind,
    pub addresses: BTreeSet<IpNet>,
    pub mtu: Option<Mtu>,
    pub admin_state: AdminState,
}

/// The full desired link set, dependency-ordered.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DesiredLinks {
    by_name: BTreeMap<InterfaceName, LinkSpec>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    // The validator enforces naming and bounds; hitting these means a model
    // slipped past it.
    #[error("invalid name in validated model: {0}")]
    Name(#[from] net::IllegalInterfaceName),
    #[error("invalid vlan id in validated model: {0}")]
    Vlan(#[from] net::InvalidVlanId),
    #[error("invalid mtu in validated model: {0}")]
    Mtu(#[from] net::MtuError),
}

impl DesiredLinks {
    /// Project the validated model into link specs.
    pub fn from_model(model: &ValidModel) -> Result<DesiredLinks, SpecError> {
        let mut by_name = BTreeMap::new();
        for iface in &model.model().interfaces {
            let spec = LinkSpec::from_config(iface)?;
            by_name.insert(spec.name.clone(), spec);
        }
        // WireGuard tunnels appear as links too so ordering covers them.
        for tunnel in &model.model().vpn {
            let name = InterfaceName::try_from(tunnel.name.as_str())?;
            by_name.entry(name.clone()).or_insert(LinkSpec {
                name,
                kind: LinkKind::Wireguard,
                addresses: tunnel.addresses.iter().copied().collect(),
                mtu: None,
                admin_state: AdminState::Up,
            });
        }
        Ok(DesiredLinks { by_name })
    }

    #[must_use]
    pub fn get(&self, name: &InterfaceName) -> Option<&LinkSpec> {
        self.by_name.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LinkSpec> {
        self.by_name.values()
    }

    /// Names in creation order: dependencies before dependents. The validator
    /// guarantees acyclicity, so the traversal terminates.
    #[must_use]
    pub fn creation_order(&self) -> Vec<InterfaceName> {
        let mut order = Vec::with_capacity(self.by_name.len());
        let mut done: BTreeSet<&InterfaceName> = BTreeSet::new();
        fn visit<'a>(
            name: &'a InterfaceName,
            links: &'a BTreeMap<InterfaceName, LinkSpec>,
            done: &mut BTreeSet<&'a InterfaceName>,
            order: &mut Vec<InterfaceName>,
        ) {
            if done.contains(name) {
                return;
            }
            done.insert(name);
            if let Some(spec) = links.get(name) {
                for dep in spec.kind.dependencies() {
                    visit(dep, links, done, order);
                }
                order.push(name.clone());
            }
        }
        for name in self.by_name.keys() {
            visit(name, &self.by_name, &mut done, &mut order);
        }
        order
    }

    /// Removal order is the reverse: dependents go first.
    #[must_use]
    pub fn removal_order(&self) -> Vec<InterfaceName> {
        let mut order = self.creation_order();
        order.reverse();
        order
    }
}

impl LinkSpec {
    fn from_config(config: &InterfaceConfig) -> Result<LinkSpec, SpecError> {
        let name = InterfaceName::try_from(config.name.as_str())?;
        let kind = match config.kind {
            InterfaceKind::Physical => LinkKind::Physical,
            InterfaceKind::Vlan => LinkKind::Vlan {
                parent: InterfaceName::try_from(
                    config.parent.as_deref().unwrap_or_default(),
                )?,
                vlan_id: VlanId::try_from(config.vlan_id.unwrap_or_default())?,
            },
            InterfaceKind::Bond => LinkKind::Bond {
                mode: config.bond_mode.unwrap_or_default(),
                members: config
                    .members
                    .iter()
                    .map(|m| InterfaceName::try_from(m.as_str()))
                    .collect::<Result<_, _>>()?,
            },
            InterfaceKind::Bridge => LinkKind::Bridge {
                vlan_filtering: config.vlan_filtering,
                members: config
                    .members
                    .iter()
                    .map(|m| InterfaceName::try_from(m.as_str()))
                    .collect::<Result<_, _>>()?,
            },
            InterfaceKind::Wireguard => LinkKind::Wireguard,
            InterfaceKind::Pppoe => LinkKind::Pppoe,
            InterfaceKind::Tunnel => LinkKind::Tunnel,
        };
        let mtu = config.mtu.map(Mtu::try_from).transpose()?;
        Ok(LinkSpec {
            name,
            kind,
            addresses: config.addresses.iter().copied().collect(),
            mtu,
            admin_state: if config.disabled {
                AdminState::Down
            } else {
                AdminState::Up
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(text: &str) -> ValidModel {
        config::validate(config::from_yaml_str(text).unwrap()).unwrap()
    }

    #[test]
    fn creation_order_respects_dependencies() {
        let desired = DesiredLinks::from_model(&model(
            r"
interface:
  - name: br0
    kind: bridge
    members: [bond0]
  - name: bond0
    kind: bond
    members: [eth0, eth1]
  - name: eth0
    kind: physical
  - name: eth1
    kind: physical
  - name: bond0.30
    kind: vlan
    parent: bond0
    vlan_id: 30
",
        ))
        .unwrap();
        let order = desired.creation_order();
        let pos = |name: &str| {
            order
                .iter()
                .position(|n| n.as_ref() == name)
                .unwrap_or_else(|| panic!("{name} missing"))
        };
        assert!(pos("eth0") < pos("bond0"));
        assert!(pos("eth1") < pos("bond0"));
        assert!(pos("bond0") < pos("br0"));
        assert!(pos("bond0") < pos("bond0.30"));

        let removal = desired.removal_order();
        assert!(
            removal.iter().position(|n| n.as_ref() == "br0")
                < removal.iter().position(|n| n.as_ref() == "bond0")
        );
    }

    #[test]
    fn wireguard_tunnels_join_the_link_set() {
        let desired = DesiredLinks::from_model(&model(
            r"
vpn:
  - name: wg0
    private_key: 'YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE='
    listen_port: 51820
    addresses: [10.8.0.1/24]
",
        ))
        .unwrap();
        let wg = desired
            .get(&InterfaceName::try_from("wg0").unwrap())
            .unwrap();
        assert_eq!(wg.kind, LinkKind::Wireguard);
        assert!(!wg.kind.managed());
    }
}
