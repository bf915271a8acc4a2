// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Diffing desired links against an observation into a minimal op plan.
//!
//! The plan carries its own reverse: every forward op is paired at diff time
//! with the op that undoes it, so the supervisor can unwind a failed apply
//! without re-observing.

use crate::observe::{LinkObservation, ObservedKind, ObservedLink};
use crate::spec::{DesiredLinks, LinkKind, LinkSpec};
use config::BondMode;
use ipnet::IpNet;
use net::{AdminState, InterfaceName, Mtu, VlanId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One kernel mutation. Names, not indexes: the applier resolves indexes at
/// execution time since creations change them.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LinkOp {
    Create(LinkSpec),
    Delete(InterfaceName),
    SetAdmin(InterfaceName, AdminState),
    SetMtu(InterfaceName, Mtu),
    AddAddress(InterfaceName, IpNet),
    DelAddress(InterfaceName, IpNet),
    /// Attach (`Some`) or detach (`None`) a member to a bond/bridge.
    SetController {
        member: InterfaceName,
        controller: Option<InterfaceName>,
    },
}

/// Ops for one interface, applied together so a failure isolates to it.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct InterfacePlan {
    pub name: String,
    pub forward: Vec<LinkOp>,
    pub reverse: Vec<LinkOp>,
    /// The diff documents destroy-and-recreate convergence explicitly.
    pub recreate: bool,
    /// Set for physical links the kernel does not have; nothing to do but
    /// report.
    pub missing: bool,
}

impl InterfacePlan {
    fn new(name: &InterfaceName) -> Self {
        InterfacePlan {
            name: name.to_string(),
            ..InterfacePlan::default()
        }
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.forward.is_empty() && !self.missing
    }
}

/// The whole diff, ordered for execution.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct LinkPlan {
    /// Managed links to remove first, dependents before dependencies.
    pub removals: Vec<InterfacePlan>,
    /// Creations and updates, dependencies before dependents.
    pub changes: Vec<InterfacePlan>,
}

impl LinkPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removals.iter().all(InterfacePlan::is_noop)
            && self.changes.iter().all(InterfacePlan::is_noop)
    }

    #[must_use]
    pub fn op_count(&self) -> usize {
        self.removals
            .iter()
            .chain(self.changes.iter())
            .map(|p| p.forward.len())
            .sum()
    }
}

/// Compute the plan. Pure: no kernel access.
#[must_use]
pub fn diff(desired: &DesiredLinks, observed: &LinkObservation) -> LinkPlan {
    let mut plan = LinkPlan::default();

    // Stale managed links: created by us (vlan/bond/bridge kinds) but no
    // longer desired. Dependents (higher in the stack) first.
    let mut stale: Vec<&ObservedLink> = observed
        .by_name
        .values()
        .filter(|link| desired.get(&link.name).is_none() && is_managed_kind(link))
        .collect();
    stale.sort_by_key(|link| std::cmp::Reverse(stack_height(link, observed)));
    for link in stale {
        let mut entry = InterfacePlan::new(&link.name);
        entry.forward.push(LinkOp::Delete(link.name.clone()));
        if let Some(spec) = reconstruct(link, observed) {
            entry.reverse.push(LinkOp::Create(spec));
        }
        plan.removals.push(entry);
    }

    for name in desired.creation_order() {
        let Some(spec) = desired.get(&name) else {
            continue;
        };
        plan.changes.push(diff_one(spec, observed));
    }
    plan
}

fn is_managed_kind(link: &ObservedLink) -> bool {
    matches!(
        link.kind,
        Some(ObservedKind::Vlan { .. }) | Some(ObservedKind::Bond { .. }) | Some(ObservedKind::Bridge)
    )
}

/// Rough stacking depth so bridges tear down before their bonds, bonds
/// before their members' vlans, and so on.
fn stack_height(link: &ObservedLink, observed: &LinkObservation) -> usize {
    match link.kind {
        Some(ObservedKind::Bridge) => 3,
        Some(ObservedKind::Bond { .. }) => 2,
        Some(ObservedKind::Vlan { .. }) => {
            // A vlan on a bond sits above the bond.
            if link
                .controller
                .and_then(|c| observed.by_index(c))
                .is_some()
            {
                2
            } else {
                1
            }
        }
        _ => 0,
    }
}

fn diff_one(spec: &LinkSpec, observed: &LinkObservation) -> InterfacePlan {
    let mut entry = InterfacePlan::new(&spec.name);
    match observed.get(&spec.name) {
        None => plan_create(spec, &mut entry),
        Some(link) => {
            if needs_recreate(spec, link) {
                entry.recreate = true;
                entry.forward.push(LinkOp::Delete(spec.name.clone()));
                plan_create(spec, &mut entry);
                // Undo: remove ours, restore what was there.
                entry.reverse.push(LinkOp::Delete(spec.name.clone()));
                if let Some(old) = reconstruct(link, observed) {
                    entry.reverse.push(LinkOp::Create(old));
                }
            } else {
                plan_converge(spec, link, observed, &mut entry);
            }
        }
    }
    entry
}

fn plan_create(spec: &LinkSpec, entry: &mut InterfacePlan) {
    match &spec.kind {
        LinkKind::Physical => {
            // Hardware we cannot conjure; surfaced as degraded.
            entry.missing = true;
            return;
        }
        // The wireguard orchestrator owns tunnel device lifecycle; pppoe and
        // gre-style tunnels come up through their own daemons.
        LinkKind::Wireguard | LinkKind::Pppoe | LinkKind::Tunnel => return,
        LinkKind::Vlan { .. } | LinkKind::Bond { .. } | LinkKind::Bridge { .. } => {}
    }

    entry.forward.push(LinkOp::Create(spec.clone()));
    entry.reverse.push(LinkOp::Delete(spec.name.clone()));
    if let LinkKind::Bond { members, .. } | LinkKind::Bridge { members, .. } = &spec.kind {
        for member in members {
            entry.forward.push(LinkOp::SetController {
                member: member.clone(),
                controller: Some(spec.name.clone()),
            });
            entry.reverse.push(LinkOp::SetController {
                member: member.clone(),
                controller: None,
            });
        }
    }
    for address in &spec.addresses {
        entry
            .forward
            .push(LinkOp::AddAddress(spec.name.clone(), *address));
    }
    if let Some(mtu) = spec.mtu {
        entry.forward.push(LinkOp::SetMtu(spec.name.clone(), mtu));
    }
    entry
        .forward
        .push(LinkOp::SetAdmin(spec.name.clone(), spec.admin_state));
}

fn needs_recreate(spec: &LinkSpec, link: &ObservedLink) -> bool {
    match (&spec.kind, &link.kind) {
        // A vlan id change is a different kernel object wearing the name.
        (LinkKind::Vlan { vlan_id, .. }, Some(ObservedKind::Vlan { vlan_id: observed })) => {
            vlan_id.to_u16() != *observed
        }
        // Bond mode cannot change on a live bond.
        (LinkKind::Bond { mode, .. }, Some(ObservedKind::Bond { mode: observed })) => {
            observed.is_some_and(|o| bond_mode_number(*mode) != o)
        }
        // Kind mismatch entirely (name collision with something else).
        (LinkKind::Vlan { .. }, Some(k)) => !matches!(k, ObservedKind::Vlan { .. }),
        (LinkKind::Bond { .. }, Some(k)) => !matches!(k, ObservedKind::Bond { .. }),
        (LinkKind::Bridge { .. }, Some(k)) => !matches!(k, ObservedKind::Bridge),
        _ => false,
    }
}

fn plan_converge(
    spec: &LinkSpec,
    link: &ObservedLink,
    observed: &LinkObservation,
    entry: &mut InterfacePlan,
) {
    for address in spec.addresses.difference(&link.addresses) {
        entry
            .forward
            .push(LinkOp::AddAddress(spec.name.clone(), *address));
        entry
            .reverse
            .push(LinkOp::DelAddress(spec.name.clone(), *address));
    }
    // Addresses the kernel has that we do not want. Dhcp-client interfaces
    // have an empty desired set and hold their kernel addresses: the model
    // never lists them, so only statically-addressed links prune.
    if !spec.addresses.is_empty() {
        for address in link.addresses.difference(&spec.addresses) {
            entry
                .forward
                .push(LinkOp::DelAddress(spec.name.clone(), *address));
            entry
                .reverse
                .push(LinkOp::AddAddress(spec.name.clone(), *address));
        }
    }

    if let Some(mtu) = spec.mtu {
        if link.mtu != Some(mtu) {
            entry.forward.push(LinkOp::SetMtu(spec.name.clone(), mtu));
            if let Some(old) = link.mtu {
                entry.reverse.push(LinkOp::SetMtu(spec.name.clone(), old));
            }
        }
    }

    let want_up = spec.admin_state == AdminState::Up;
    if link.up != want_up {
        entry
            .forward
            .push(LinkOp::SetAdmin(spec.name.clone(), spec.admin_state));
        entry.reverse.push(LinkOp::SetAdmin(
            spec.name.clone(),
            if link.up { AdminState::Up } else { AdminState::Down },
        ));
    }

    // Membership convergence for bonds and bridges.
    if let LinkKind::Bond { members, .. } | LinkKind::Bridge { members, .. } = &spec.kind {
        let desired_members: BTreeSet<&InterfaceName> = members.iter().collect();
        for member in members {
            let attached = observed
                .get(member)
                .and_then(|m| m.controller)
                .is_some_and(|c| c == link.index);
            if !attached {
                entry.forward.push(LinkOp::SetController {
                    member: member.clone(),
                    controller: Some(spec.name.clone()),
                });
                entry.reverse.push(LinkOp::SetController {
                    member: member.clone(),
                    controller: None,
                });
            }
        }
        // Detach members we no longer want.
        for other in observed.by_name.values() {
            if other.controller == Some(link.index) && !desired_members.contains(&other.name) {
                entry.forward.push(LinkOp::SetController {
                    member: other.name.clone(),
                    controller: None,
                });
                entry.reverse.push(LinkOp::SetController {
                    member: other.name.clone(),
                    controller: Some(spec.name.clone()),
                });
            }
        }
    }
}

/// Best-effort spec for an observed managed link, used for rollback of
/// deletions.
fn reconstruct(link: &ObservedLink, observed: &LinkObservation) -> Option<LinkSpec> {
    let kind = match &link.kind {
        Some(ObservedKind::Vlan { vlan_id }) => LinkKind::Vlan {
            parent: observed.by_index(link.controller?)?.name.clone(),
            vlan_id: VlanId::try_from(*vlan_id).ok()?,
        },
        Some(ObservedKind::Bond { mode }) => LinkKind::Bond {
            mode: mode.and_then(bond_mode_from_number).unwrap_or_default(),
            members: observed
                .by_name
                .values()
                .filter(|l| l.controller == Some(link.index))
                .map(|l| l.name.clone())
                .collect(),
        },
        Some(ObservedKind::Bridge) => LinkKind::Bridge {
            vlan_filtering: false,
            members: observed
                .by_name
                .values()
                .filter(|l| l.controller == Some(link.index))
                .map(|l| l.name.clone())
                .collect(),
        },
        _ => return None,
    };
    Some(LinkSpec {
        name: link.name.clone(),
        kind,
        addresses: link.addresses.clone(),
        mtu: link.mtu,
        admin_state: if link.up {
            AdminState::Up
        } else {
            AdminState::Down
        },
    })
}

/// Kernel bond mode numbers.
#[must_use]
pub fn bond_mode_number(mode: BondMode) -> u8 {
    match mode {
        BondMode::BalanceRr => 0,
        BondMode::ActiveBackup => 1,
        BondMode::BalanceXor => 2,
        BondMode::Lacp => 4,
    }
}

fn bond_mode_from_number(mode: u8) -> Option<BondMode> {
    match mode {
        0 => Some(BondMode::BalanceRr),
        1 => Some(BondMode::ActiveBackup),
        2 => Some(BondMode::BalanceXor),
        4 => Some(BondMode::Lacp),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn name(n: &str) -> InterfaceName {
        InterfaceName::try_from(n).unwrap()
    }

    fn observed(links: Vec<ObservedLink>) -> LinkObservation {
        LinkObservation {
            by_name: links.into_iter().map(|l| (l.name.clone(), l)).collect(),
        }
    }

    fn physical(n: &str, index: u32) -> ObservedLink {
        ObservedLink {
            index,
            name: name(n),
            kind: None,
            mtu: Some(Mtu::DEFAULT),
            up: true,
            controller: None,
            addresses: BTreeSet::new(),
        }
    }

    fn desired(text: &str) -> DesiredLinks {
        let model = config::validate(config::from_yaml_str(text).unwrap()).unwrap();
        DesiredLinks::from_model(&model).unwrap()
    }

    #[test]
    fn converged_state_diffs_to_nothing() {
        let desired = desired(
            r"
interface:
  - name: eth0
    kind: physical
    addresses: [192.168.1.1/24]
",
        );
        let mut eth0 = physical("eth0", 2);
        eth0.addresses.insert("192.168.1.1/24".parse().unwrap());
        let plan = diff(&desired, &observed(vec![eth0]));
        assert!(plan.is_empty(), "{plan:?}");
    }

    #[test]
    fn missing_vlan_is_created_with_reverse_delete() {
        let desired = desired(
            r"
interface:
  - name: eth0
    kind: physical
  - name: eth0.10
    kind: vlan
    parent: eth0
    vlan_id: 10
    addresses: [10.0.10.1/24]
",
        );
        let plan = diff(&desired, &observed(vec![physical("eth0", 2)]));
        let vlan = plan
            .changes
            .iter()
            .find(|p| p.name == "eth0.10")
            .unwrap();
        assert!(matches!(vlan.forward[0], LinkOp::Create(_)));
        assert_eq!(vlan.reverse[0], LinkOp::Delete(name("eth0.10")));
        assert!(
            vlan.forward
                .iter()
                .any(|op| matches!(op, LinkOp::AddAddress(_, _)))
        );
    }

    #[test]
    fn vlan_id_change_is_a_recreate() {
        let desired = desired(
            r"
interface:
  - name: eth0
    kind: physical
  - name: eth0.10
    kind: vlan
    parent: eth0
    vlan_id: 20
",
        );
        let mut vlan = physical("eth0.10", 3);
        vlan.kind = Some(ObservedKind::Vlan { vlan_id: 10 });
        vlan.controller = Some(2);
        let plan = diff(&desired, &observed(vec![physical("eth0", 2), vlan]));
        let entry = plan.changes.iter().find(|p| p.name == "eth0.10").unwrap();
        assert!(entry.recreate);
        assert!(matches!(entry.forward[0], LinkOp::Delete(_)));
    }

    #[test]
    fn missing_physical_reports_not_creates() {
        let desired = desired(
            r"
interface:
  - name: eth7
    kind: physical
",
        );
        let plan = diff(&desired, &observed(vec![]));
        let entry = &plan.changes[0];
        assert!(entry.missing);
        assert!(entry.forward.is_empty());
    }

    #[test]
    fn stale_managed_links_are_removed() {
        let desired = desired(
            r"
interface:
  - name: eth0
    kind: physical
",
        );
        let mut old_bridge = physical("br-old", 9);
        old_bridge.kind = Some(ObservedKind::Bridge);
        let plan = diff(&desired, &observed(vec![physical("eth0", 2), old_bridge]));
        assert_eq!(plan.removals.len(), 1);
        assert_eq!(plan.removals[0].forward[0], LinkOp::Delete(name("br-old")));
        // Reverse can restore it.
        assert!(matches!(plan.removals[0].reverse[0], LinkOp::Create(_)));
    }

    #[test]
    fn bridge_membership_converges_both_ways() {
        let desired = desired(
            r"
interface:
  - name: eth0
    kind: physical
  - name: eth1
    kind: physical
  - name: br0
    kind: bridge
    members: [eth0]
",
        );
        let mut br0 = physical("br0", 10);
        br0.kind = Some(ObservedKind::Bridge);
        let mut eth1 = physical("eth1", 3);
        eth1.controller = Some(10); // attached but unwanted
        let plan = diff(
            &desired,
            &observed(vec![physical("eth0", 2), eth1, br0]),
        );
        let entry = plan.changes.iter().find(|p| p.name == "br0").unwrap();
        assert!(entry.forward.contains(&LinkOp::SetController {
            member: name("eth0"),
            controller: Some(name("br0")),
        }));
        assert!(entry.forward.contains(&LinkOp::SetController {
            member: name("eth1"),
            controller: None,
        }));
    }

    #[test]
    fn dhcp_client_interface_keeps_kernel_addresses() {
        let desired = desired(
            r"
interface:
  - name: eth0
    kind: physical
    dhcp-client: true
",
        );
        let mut eth0 = physical("eth0", 2);
        eth0.addresses.insert("203.0.113.40/24".parse().unwrap());
        let plan = diff(&desired, &observed(vec![eth0]));
        assert!(plan.is_empty(), "{plan:?}");
    }
}
