// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! One netlink dump of the links and addresses flywall cares about.

use crate::LinkError;
use futures::TryStreamExt;
use ipnet::IpNet;
use net::{InterfaceName, Mtu};
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::{InfoData, InfoKind, LinkAttribute, LinkFlags, LinkInfo};
use rtnetlink::Handle;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// What the kernel reports for one link.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObservedLink {
    pub index: u32,
    pub name: InterfaceName,
    pub kind: Option<ObservedKind>,
    pub mtu: Option<Mtu>,
    pub up: bool,
    /// Master device index (bond or bridge membership).
    pub controller: Option<u32>,
    pub addresses: BTreeSet<IpNet>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ObservedKind {
    Vlan { vlan_id: u16 },
    Bond { mode: Option<u8> },
    Bridge,
    Wireguard,
    Other(String),
}

/// The full observation, indexed both ways.
#[derive(Clone, Debug, Default)]
pub struct LinkObservation {
    pub by_name: BTreeMap<InterfaceName, ObservedLink>,
}

impl LinkObservation {
    #[must_use]
    pub fn get(&self, name: &InterfaceName) -> Option<&ObservedLink> {
        self.by_name.get(name)
    }

    #[must_use]
    pub fn by_index(&self, index: u32) -> Option<&ObservedLink> {
        self.by_name.values().find(|l| l.index == index)
    }

    /// Dump links and addresses. Interface names the kernel reports that are
    /// not valid by our rules (containers create odd ones) are skipped.
    pub async fn dump(handle: &Handle) -> Result<LinkObservation, LinkError> {
        let mut by_name: BTreeMap<InterfaceName, ObservedLink> = BTreeMap::new();
        let mut by_index: BTreeMap<u32, InterfaceName> = BTreeMap::new();

        let mut links = handle.link().get().execute();
        while let Some(message) = links.try_next().await? {
            let index = message.header.index;
            let up = message.header.flags.contains(LinkFlags::Up);
            let mut name = None;
            let mut mtu = None;
            let mut controller = None;
            let mut kind = None;
            for attribute in &message.attributes {
                match attribute {
                    LinkAttribute::IfName(n) => name = InterfaceName::try_from(n.as_str()).ok(),
                    LinkAttribute::Mtu(m) => mtu = Mtu::try_from(*m).ok(),
                    LinkAttribute::Controller(c) => controller = Some(*c),
                    LinkAttribute::LinkInfo(info) => kind = observed_kind(info),
                    _ => {}
                }
            }
            let Some(name) = name else { continue };
            by_index.insert(index, name.clone());
            by_name.insert(
                name.clone(),
                ObservedLink {
                    index,
                    name,
                    kind,
                    mtu,
                    up,
                    controller,
                    addresses: BTreeSet::new(),
                },
            );
        }

        let mut addresses = handle.address().get().execute();
        while let Some(message) = addresses.try_next().await? {
            let index = message.header.index;
            let prefix = message.header.prefix_len;
            let Some(name) = by_index.get(&index) else {
                continue;
            };
            for attribute in &message.attributes {
                if let AddressAttribute::Address(addr) = attribute {
                    if let Some(link) = by_name.get_mut(name) {
                        if let Ok(net) = cidr(*addr, prefix) {
                            link.addresses.insert(net);
                        }
                    }
                }
            }
        }

        Ok(LinkObservation { by_name })
    }
}

fn cidr(addr: IpAddr, prefix: u8) -> Result<IpNet, ipnet::PrefixLenError> {
    IpNet::new(addr, prefix)
}

fn observed_kind(info: &[LinkInfo]) -> Option<ObservedKind> {
    let mut kind = None;
    let mut vlan_id = None;
    let mut bond_mode = None;
    for entry in info {
        match entry {
            LinkInfo::Kind(k) => {
                kind = Some(match k {
                    InfoKind::Vlan => ObservedKind::Vlan { vlan_id: 0 },
                    InfoKind::Bond => ObservedKind::Bond { mode: None },
                    InfoKind::Bridge => ObservedKind::Bridge,
                    InfoKind::Wireguard => ObservedKind::Wireguard,
                    other => ObservedKind::Other(format!("{other:?}")),
                });
            }
            LinkInfo::Data(InfoData::Vlan(attrs)) => {
                use rtnetlink::packet_route::link::InfoVlan;
                for attr in attrs {
                    if let InfoVlan::Id(id) = attr {
                        vlan_id = Some(*id);
                    }
                }
            }
            LinkInfo::Data(InfoData::Bond(attrs)) => {
                use rtnetlink::packet_route::link::InfoBond;
                for attr in attrs {
                    if let InfoBond::Mode(mode) = attr {
                        bond_mode = Some(u8::from(*mode));
                    }
                }
            }
            _ => {}
        }
    }
    match kind {
        Some(ObservedKind::Vlan { .. }) => Some(ObservedKind::Vlan {
            vlan_id: vlan_id.unwrap_or_default(),
        }),
        Some(ObservedKind::Bond { .. }) => Some(ObservedKind::Bond { mode: bond_mode }),
        other => other,
    }
}
