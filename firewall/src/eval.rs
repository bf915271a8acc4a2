// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Interpretation of a [`Ruleset`] for the inline verdict path.
//!
//! The flow engine consults this instead of the kernel so first-packet
//! classification stays a bounded, synchronous function. Limit matches are
//! treated as always passing here; enforcement of rates is the kernel's job
//! and the inline path must never block on shared token buckets.

use crate::ruleset::{Action, Chain, Hook, Match, Rule, Ruleset};
use ipnet::IpNet;
use net::{FlowKey, Port};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;

/// The context a packet presents to the filter.
#[derive(Clone, Debug)]
pub struct PacketView {
    pub key: FlowKey,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
}

impl PacketView {
    #[must_use]
    pub fn forward(key: FlowKey, in_interface: &str, out_interface: &str) -> Self {
        PacketView {
            key,
            in_interface: Some(in_interface.to_string()),
            out_interface: Some(out_interface.to_string()),
        }
    }
}

/// Runtime membership state layered over the compiled ruleset: dynamic set
/// members and the active schedule set.
#[derive(Clone, Debug, Default)]
pub struct DynamicState {
    pub sets: HashMap<String, HashSet<IpNet>>,
    pub active_schedules: BTreeSet<String>,
}

impl DynamicState {
    fn set_contains(&self, ruleset: &Ruleset, set: &str, addr: IpAddr) -> bool {
        if let Some(members) = self.sets.get(set) {
            if members.iter().any(|net| net.contains(&addr)) {
                return true;
            }
        }
        ruleset
            .set(set)
            .is_some_and(|def| def.entries.iter().any(|net| net.contains(&addr)))
    }
}

/// The filter's answer for one packet.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FilterVerdict {
    Accept,
    Drop,
    Reject,
}

/// Evaluate a hook chain against a packet.
#[must_use]
pub fn evaluate(
    ruleset: &Ruleset,
    state: &DynamicState,
    hook: Hook,
    pkt: &PacketView,
) -> FilterVerdict {
    let Some(base) = ruleset
        .base_chains()
        .find(|c| matches!(c.hook, Some((h, _)) if h == hook))
    else {
        return FilterVerdict::Accept;
    };
    match walk(ruleset, state, base, pkt, 0) {
        Some(verdict) => verdict,
        None => match base.hook {
            Some((_, crate::ruleset::ChainPolicy::Accept)) => FilterVerdict::Accept,
            _ => FilterVerdict::Drop,
        },
    }
}

const MAX_DEPTH: usize = 16;

fn walk(
    ruleset: &Ruleset,
    state: &DynamicState,
    chain: &Chain,
    pkt: &PacketView,
    depth: usize,
) -> Option<FilterVerdict> {
    if depth > MAX_DEPTH {
        return Some(FilterVerdict::Drop);
    }
    for rule in &chain.rules {
        if !rule_matches(ruleset, state, rule, pkt) {
            continue;
        }
        match &rule.action {
            Action::Accept => return Some(FilterVerdict::Accept),
            Action::Drop => return Some(FilterVerdict::Drop),
            Action::Reject => return Some(FilterVerdict::Reject),
            Action::Return => return None,
            Action::Jump(target) => {
                if let Some(next) = ruleset.chain(target) {
                    if let Some(verdict) = walk(ruleset, state, next, pkt, depth + 1) {
                        return Some(verdict);
                    }
                }
            }
            // NAT statements do not decide accept/drop on this path.
            Action::Masquerade | Action::Snat { .. } | Action::Dnat { .. } => {}
        }
    }
    None
}

fn rule_matches(ruleset: &Ruleset, state: &DynamicState, rule: &Rule, pkt: &PacketView) -> bool {
    rule.matches.iter().all(|m| match m {
        Match::InInterface(name) => pkt
            .in_interface
            .as_deref()
            .is_some_and(|i| i == name.as_ref()),
        Match::OutInterface(name) => pkt
            .out_interface
            .as_deref()
            .is_some_and(|i| i == name.as_ref()),
        Match::Proto(proto) => pkt.key.proto == *proto,
        Match::SrcNet(net) => net.contains(&pkt.key.src_ip),
        Match::DstNet(net) => net.contains(&pkt.key.dst_ip),
        Match::SrcSet(set) => state.set_contains(ruleset, set, pkt.key.src_ip),
        Match::DstSet(set) => state.set_contains(ruleset, set, pkt.key.dst_ip),
        Match::SrcPorts(ranges) => port_in(ranges, pkt.key.src_port),
        Match::DstPorts(ranges) => port_in(ranges, pkt.key.dst_port),
        // The inline path only ever sees the first packet of a flow, which
        // is by definition not established.
        Match::CtEstablished => false,
        Match::CtInvalid => false,
        Match::TcpSyn => pkt.key.proto == net::Protocol::Tcp,
        Match::ScheduleActive(name) => state.active_schedules.contains(name),
        Match::Limit { .. } => true,
    })
}

fn port_in(ranges: &[net::PortRange], port: u16) -> bool {
    match Port::try_from(port) {
        Ok(port) => ranges.iter().any(|r| r.contains(port)),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;
    use net::Protocol;

    fn model(text: &str) -> config::ValidModel {
        config::validate(config::from_yaml_str(text).unwrap()).unwrap()
    }

    fn ruleset() -> Ruleset {
        compile(&model(
            r"
interface:
  - name: eth0
    kind: physical
    zone: lan
    addresses: [192.168.1.1/24]
  - name: eth1
    kind: physical
    zone: wan
zone:
  - name: lan
  - name: wan
    external: true
scheduler:
  - name: worktime
    days: [mon]
    start: '09:00'
    end: '17:00'
policy:
  - from: lan
    to: wan
    rules:
      - name: no-telnet
        action: drop
        proto: tcp
        dst_ports: ['23']
      - name: surf
        action: accept
        proto: tcp
        schedule: worktime
      - name: dns-out
        action: accept
        proto: udp
        dst_ports: ['53']
",
        ))
        .unwrap()
    }

    fn pkt(dst_port: u16, proto: Protocol) -> PacketView {
        PacketView::forward(
            FlowKey::new(
                "192.168.1.100".parse().unwrap(),
                "8.8.8.8".parse().unwrap(),
                40000,
                dst_port,
                proto,
            ),
            "eth0",
            "eth1",
        )
    }

    #[test]
    fn declared_order_wins() {
        let rs = ruleset();
        let state = DynamicState::default();
        assert_eq!(
            evaluate(&rs, &state, Hook::Forward, &pkt(23, Protocol::Tcp)),
            FilterVerdict::Drop
        );
        assert_eq!(
            evaluate(&rs, &state, Hook::Forward, &pkt(53, Protocol::Udp)),
            FilterVerdict::Accept
        );
    }

    #[test]
    fn default_policy_drop_applies() {
        let rs = ruleset();
        let state = DynamicState::default();
        // TCP 443 only matches the scheduled rule, which is inactive.
        assert_eq!(
            evaluate(&rs, &state, Hook::Forward, &pkt(443, Protocol::Tcp)),
            FilterVerdict::Drop
        );
    }

    #[test]
    fn schedule_membership_flips_the_verdict() {
        let rs = ruleset();
        let mut state = DynamicState::default();
        state.active_schedules.insert("worktime".to_string());
        assert_eq!(
            evaluate(&rs, &state, Hook::Forward, &pkt(443, Protocol::Tcp)),
            FilterVerdict::Accept
        );
        state.active_schedules.clear();
        assert_eq!(
            evaluate(&rs, &state, Hook::Forward, &pkt(443, Protocol::Tcp)),
            FilterVerdict::Drop
        );
    }

    #[test]
    fn dynamic_blocklist_membership_drops() {
        let rs = ruleset();
        let mut state = DynamicState::default();
        let verdict = evaluate(&rs, &state, Hook::Forward, &pkt(53, Protocol::Udp));
        assert_eq!(verdict, FilterVerdict::Accept);

        state
            .sets
            .entry(crate::BLOCKED_SET.to_string())
            .or_default()
            .insert("192.168.1.100/32".parse().unwrap());
        let verdict = evaluate(&rs, &state, Hook::Forward, &pkt(53, Protocol::Udp));
        assert_eq!(verdict, FilterVerdict::Drop);
    }

    #[test]
    fn unknown_interface_misses_zone_chains() {
        let rs = ruleset();
        let state = DynamicState::default();
        let mut packet = pkt(53, Protocol::Udp);
        packet.in_interface = Some("eth9".to_string());
        assert_eq!(
            evaluate(&rs, &state, Hook::Forward, &packet),
            FilterVerdict::Drop
        );
    }
}
