// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

use super::*;
use crate::frontend::from_yaml_str;
use crate::model::{EndpointMatch, RuleAction};
use pretty_assertions::assert_eq;

fn base_config() -> &'static str {
    r"
system:
  timezone: Europe/Berlin
interface:
  - name: eth0
    kind: physical
    zone: lan
    addresses: [192.168.1.1/24]
  - name: eth1
    kind: physical
    zone: wan
    dhcp-client: true
zone:
  - name: lan
    management: [web, ssh, dns, dhcp]
  - name: wan
    external: true
policy:
  - from: lan
    to: wan
    rules:
      - name: allow-web
        action: accept
        service: web
      - name: allow-all
        action: accept
nat:
  - name: outbound
    kind: masquerade
    out_interface: eth1
"
}

fn validate_str(text: &str) -> Result<ValidModel, ValidationErrors> {
    validate(from_yaml_str(text).expect("parse"))
}

#[test]
fn base_config_validates() {
    let valid = validate_str(base_config()).unwrap();
    assert_eq!(valid.zones().len(), 2);
    assert!(valid.zone("lan").is_some());
    assert!(valid.interface("eth0").is_some());
}

#[test]
fn service_alias_expands_into_leg_rules() {
    let valid = validate_str(base_config()).unwrap();
    let policy = &valid.model().policies[0];
    // `web` expands to a single tcp leg with 80 and 443.
    let web: Vec<_> = policy.rules.iter().filter(|r| r.name == "allow-web").collect();
    assert_eq!(web.len(), 1);
    assert_eq!(web[0].proto, Some(net::Protocol::Tcp));
    assert_eq!(web[0].dst_ports.len(), 2);
    assert!(web[0].service.is_none());
}

#[test]
fn implicit_zone_materializes() {
    let valid = validate_str(
        r"
interface:
  - name: dmz0
    kind: physical
    addresses: [10.9.9.1/24]
",
    )
    .unwrap();
    assert!(valid.zone("dmz0").is_some());
}

#[test]
fn cross_reference_failures_carry_paths() {
    let errors = validate_str(
        r"
interface:
  - name: eth0
    kind: physical
    zone: lan
policy:
  - from: lan
    to: nowhere
    rules:
      - name: r1
        action: accept
        src: '@missing-set'
",
    )
    .unwrap_err();
    let paths: Vec<&str> = errors.0.iter().map(|e| e.path.as_str()).collect();
    assert!(paths.contains(&"policy[lan->nowhere].to"));
    assert!(paths.contains(&"policy[lan->nowhere].rule[r1].src"));
}

#[test]
fn bad_ipset_name_rejected() {
    let errors = validate_str(
        r"
ipset:
  - name: 'bad;name'
    entries: [203.0.113.0/24]
",
    )
    .unwrap_err();
    assert!(errors.0.iter().any(|e| e.path == "ipset[bad;name]"));
}

#[test]
fn vlan_requires_parent_and_valid_id() {
    let errors = validate_str(
        r"
interface:
  - name: eth0
    kind: physical
  - name: vlan99
    kind: vlan
    parent: eth0
    vlan_id: 4095
  - name: orphan
    kind: vlan
    vlan_id: 10
",
    )
    .unwrap_err();
    assert!(errors.0.iter().any(|e| e.path == "interface[vlan99].vlan_id"));
    assert!(errors.0.iter().any(|e| e.path == "interface[orphan].parent"));
}

#[test]
fn bond_member_claimed_once() {
    let errors = validate_str(
        r"
interface:
  - name: eth0
    kind: physical
  - name: eth1
    kind: physical
  - name: bond0
    kind: bond
    members: [eth0, eth1]
  - name: br0
    kind: bridge
    members: [eth0]
",
    )
    .unwrap_err();
    assert!(
        errors
            .0
            .iter()
            .any(|e| e.path == "interface[br0].members" && e.reason.contains("bond0"))
    );
}

#[test]
fn duplicate_dhcp_scope_rejected() {
    let errors = validate_str(
        r"
interface:
  - name: eth0
    kind: physical
    addresses: [192.168.1.1/24]
dhcp:
  - interface: eth0
    range_start: 192.168.1.100
    range_end: 192.168.1.200
  - interface: eth0
    range_start: 192.168.1.10
    range_end: 192.168.1.20
",
    )
    .unwrap_err();
    assert!(errors.0.iter().any(|e| e.reason.contains("one dhcp scope")));
}

#[test]
fn dhcp_range_must_sit_in_subnet() {
    let errors = validate_str(
        r"
interface:
  - name: eth0
    kind: physical
    addresses: [192.168.1.1/24]
dhcp:
  - interface: eth0
    range_start: 10.0.0.10
    range_end: 10.0.0.20
",
    )
    .unwrap_err();
    assert!(errors.0.iter().any(|e| e.reason.contains("subnet")));
}

#[test]
fn wireguard_ports_unique() {
    let errors = validate_str(
        r"
vpn:
  - name: wg0
    private_key: 'YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE='
    listen_port: 51820
  - name: wg1
    private_key: 'YmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmJiYmI='
    listen_port: 51820
",
    )
    .unwrap_err();
    assert!(errors.0.iter().any(|e| e.path == "vpn[wg1].listen_port"));
}

#[test]
fn legacy_dns_blocklist_is_rejected() {
    let errors = validate_str(
        r"
features:
  dns_blocklist: { enabled: true }
",
    )
    .unwrap_err();
    assert_eq!(errors.0.len(), 1);
    assert_eq!(errors.0[0].path, "features.dns_blocklist");
}

#[test]
fn zone_references_are_lowercased() {
    let valid = validate_str(
        r"
interface:
  - name: eth0
    kind: physical
    zone: LAN
  - name: eth1
    kind: physical
    zone: wan
zone:
  - name: LAN
  - name: wan
policy:
  - from: LAN
    to: wan
    rules:
      - name: out
        action: accept
",
    )
    .unwrap();
    assert!(valid.zone("lan").is_some());
    assert_eq!(valid.model().policies[0].from, "lan");
    assert_eq!(
        valid.model().policies[0].rules[0].action,
        Some(RuleAction::Accept)
    );
}

#[test]
fn validated_model_is_idempotent_under_revalidation() {
    let first = validate_str(base_config()).unwrap();
    let second = validate(first.model().clone()).unwrap();
    assert_eq!(first.model(), second.model());
}

#[test]
fn endpoint_set_reference_resolves() {
    let valid = validate_str(
        r"
interface:
  - name: eth0
    kind: physical
    zone: lan
  - name: eth1
    kind: physical
    zone: wan
ipset:
  - name: bogons
    entries: [198.51.100.0/24]
policy:
  - from: wan
    to: lan
    rules:
      - name: drop-bogons
        action: drop
        src: '@bogons'
",
    )
    .unwrap();
    let rule = &valid.model().policies[0].rules[0];
    assert_eq!(rule.src, Some(EndpointMatch::Set("bogons".into())));
}

#[test]
fn reserved_host_zone_cannot_be_declared() {
    let errors = validate_str(
        r"
zone:
  - name: flywall
",
    )
    .unwrap_err();
    assert!(errors.0.iter().any(|e| e.path == "zone[flywall]"));
}
