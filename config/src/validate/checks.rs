// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The individual validation passes. Each takes the (already normalized)
//! model and appends to the shared error list; none of them mutate.

use super::error::ValidationErrors;
use crate::model::{
    DhcpScopeConfig, InterfaceConfig, InterfaceKind, Model, NatKind, RuleConfig, ZoneConfig,
    HOST_ZONE,
};
use crate::catalog;
use ipnet::IpNet;
use net::{InterfaceName, MacAddr, Mtu, VlanId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;

const MAX_IDENT_LEN: usize = 32;

/// Zone, ipset, rule and schedule names: `[a-z0-9_-]`, 1..=32 chars.
fn valid_ident(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_IDENT_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

pub(super) fn check_system(model: &Model, errors: &mut ValidationErrors) {
    if model.system.timezone.parse::<chrono_tz::Tz>().is_err() {
        errors.push(
            "system.timezone",
            format!("unknown timezone {}", model.system.timezone),
        );
    }
    if model.api.listen.parse::<std::net::SocketAddr>().is_err() {
        errors.push("api.listen", "not an ip:port listen address");
    }
}

pub(super) fn check_features(model: &Model, errors: &mut ValidationErrors) {
    // The legacy blocklist knob overlaps the dns section; dns is authoritative.
    if model.features.dns_blocklist.is_some() {
        errors.push(
            "features.dns_blocklist",
            "superseded by the top-level dns section; move blocklists there",
        );
    }
    if model.features.packet_window == 0 {
        errors.push("features.packet_window", "must be at least 1");
    }
}

pub(super) fn check_zones(zones: &BTreeMap<String, ZoneConfig>, errors: &mut ValidationErrors) {
    for (name, zone) in zones {
        if name == HOST_ZONE {
            errors.push(
                format!("zone[{name}]"),
                "reserved for the host itself; grant management on the peer zone instead",
            );
            continue;
        }
        if !valid_ident(name) {
            errors.push(
                format!("zone[{name}]"),
                "zone names are lowercase alphanumerics, _ and -, at most 32 chars",
            );
        }
        for service in &zone.services {
            if !valid_ident(&service.name) {
                errors.push(
                    format!("zone[{name}].service[{}]", service.name),
                    "invalid service name",
                );
            }
            if service.proto.has_ports() && service.ports.is_empty() {
                errors.push(
                    format!("zone[{name}].service[{}]", service.name),
                    "tcp/udp service exposures need ports",
                );
            }
        }
    }
}

pub(super) fn check_interfaces(
    model: &Model,
    zones: &BTreeMap<String, ZoneConfig>,
    errors: &mut ValidationErrors,
) {
    let mut seen: HashSet<&str> = HashSet::new();
    let by_name: HashMap<&str, &InterfaceConfig> = model
        .interfaces
        .iter()
        .map(|i| (i.name.as_str(), i))
        .collect();
    let mut member_claims: HashMap<&str, &str> = HashMap::new();

    for iface in &model.interfaces {
        let path = format!("interface[{}]", iface.name);
        if InterfaceName::try_from(iface.name.as_str()).is_err() {
            errors.push(
                &path,
                "interface names are at most 15 ascii chars of [A-Za-z0-9._-]",
            );
        }
        if !seen.insert(iface.name.as_str()) {
            errors.push(&path, "duplicate interface name");
        }
        if let Some(zone) = &iface.zone {
            if !zones.contains_key(zone) && zone != HOST_ZONE {
                errors.push(format!("{path}.zone"), format!("unknown zone {zone}"));
            }
            if zone == HOST_ZONE {
                errors.push(format!("{path}.zone"), "interfaces cannot join the host zone");
            }
        }
        if let Some(mtu) = iface.mtu {
            if Mtu::try_from(mtu).is_err() {
                errors.push(format!("{path}.mtu"), format!("mtu {mtu} out of range"));
            }
        }
        if iface.dhcp_client && !iface.addresses.is_empty() {
            errors.push(
                format!("{path}.addresses"),
                "static addresses and dhcp-client are mutually exclusive",
            );
        }

        match iface.kind {
            InterfaceKind::Vlan => {
                match iface.vlan_id {
                    None => errors.push(format!("{path}.vlan_id"), "vlan interfaces need a vlan id"),
                    Some(id) => {
                        if VlanId::try_from(id).is_err() {
                            errors.push(
                                format!("{path}.vlan_id"),
                                format!("vlan id {id} outside [1, 4094]"),
                            );
                        }
                    }
                }
                match &iface.parent {
                    None => errors.push(format!("{path}.parent"), "vlan interfaces need a parent"),
                    Some(parent) => match by_name.get(parent.as_str()) {
                        None => errors.push(
                            format!("{path}.parent"),
                            format!("unknown parent interface {parent}"),
                        ),
                        Some(parent_cfg) => {
                            if !matches!(
                                parent_cfg.kind,
                                InterfaceKind::Physical | InterfaceKind::Bond | InterfaceKind::Bridge
                            ) {
                                errors.push(
                                    format!("{path}.parent"),
                                    format!("cannot stack a vlan on a {} link", parent_cfg.kind),
                                );
                            }
                        }
                    },
                }
            }
            InterfaceKind::Bond | InterfaceKind::Bridge => {
                if iface.members.is_empty() {
                    errors.push(format!("{path}.members"), "needs at least one member");
                }
                for member in &iface.members {
                    match by_name.get(member.as_str()) {
                        None => errors.push(
                            format!("{path}.members"),
                            format!("unknown member interface {member}"),
                        ),
                        Some(member_cfg) => {
                            if iface.kind == InterfaceKind::Bond
                                && !matches!(
                                    member_cfg.kind,
                                    InterfaceKind::Physical | InterfaceKind::Vlan
                                )
                            {
                                errors.push(
                                    format!("{path}.members"),
                                    format!(
                                        "bond members must be physical or vlan, {member} is {}",
                                        member_cfg.kind
                                    ),
                                );
                            }
                            if let Some(owner) =
                                member_claims.insert(member.as_str(), iface.name.as_str())
                            {
                                errors.push(
                                    format!("{path}.members"),
                                    format!("{member} is already a member of {owner}"),
                                );
                            }
                        }
                    }
                }
            }
            InterfaceKind::Physical
            | InterfaceKind::Wireguard
            | InterfaceKind::Pppoe
            | InterfaceKind::Tunnel => {
                if !iface.members.is_empty() {
                    errors.push(format!("{path}.members"), "only bonds and bridges have members");
                }
                if iface.parent.is_some() {
                    errors.push(format!("{path}.parent"), "only vlans have a parent");
                }
            }
        }
    }

    check_interface_cycles(model, errors);
}

/// The parent/member graph must be a DAG (it is, unless someone writes a
/// vlan-of-vlan loop through bridges and bonds).
fn check_interface_cycles(model: &Model, errors: &mut ValidationErrors) {
    let index: HashMap<&str, &InterfaceConfig> = model
        .interfaces
        .iter()
        .map(|i| (i.name.as_str(), i))
        .collect();

    fn depends<'a>(iface: &'a InterfaceConfig) -> impl Iterator<Item = &'a str> {
        iface
            .parent
            .as_deref()
            .into_iter()
            .chain(iface.members.iter().map(String::as_str))
    }

    // Colors: 0 unvisited, 1 in progress, 2 done.
    fn visit<'a>(
        name: &'a str,
        index: &HashMap<&'a str, &'a InterfaceConfig>,
        color: &mut HashMap<&'a str, u8>,
    ) -> bool {
        match color.get(name).copied().unwrap_or(0) {
            1 => return false,
            2 => return true,
            _ => {}
        }
        color.insert(name, 1);
        if let Some(iface) = index.get(name) {
            for dep in depends(iface) {
                if !visit(dep, index, color) {
                    return false;
                }
            }
        }
        color.insert(name, 2);
        true
    }

    let mut color = HashMap::new();
    for iface in &model.interfaces {
        if !visit(iface.name.as_str(), &index, &mut color) {
            errors.push(
                format!("interface[{}]", iface.name),
                "interface dependency cycle",
            );
            return;
        }
    }
}

fn check_rule(
    rule: &RuleConfig,
    path: &str,
    model: &Model,
    zones: &BTreeMap<String, ZoneConfig>,
    errors: &mut ValidationErrors,
) {
    let _ = zones;
    if !rule.name.is_empty() && !valid_ident(&rule.name) {
        errors.push(format!("{path}.name"), "invalid rule name");
    }
    if rule.action.is_none() {
        errors.push(format!("{path}.action"), "rules need an action");
    }
    let ports_requested = !rule.src_ports.is_empty() || !rule.dst_ports.is_empty();
    match rule.proto {
        Some(proto) if ports_requested && !proto.has_ports() => {
            errors.push(
                format!("{path}.proto"),
                format!("{proto} rules cannot match ports"),
            );
        }
        None if ports_requested => {
            errors.push(format!("{path}.proto"), "port matches need tcp or udp");
        }
        _ => {}
    }
    for (field, endpoint) in [("src", &rule.src), ("dst", &rule.dst)] {
        if let Some(crate::model::EndpointMatch::Set(set)) = endpoint {
            if model.ipsets.iter().all(|s| &s.name != set) {
                errors.push(
                    format!("{path}.{field}"),
                    format!("unknown ipset {set}"),
                );
            }
        }
    }
    if let Some(cc) = &rule.source_country {
        if cc.len() != 2 || !cc.chars().all(|c| c.is_ascii_alphabetic()) {
            errors.push(
                format!("{path}.source_country"),
                "expected an ISO-3166 alpha-2 code",
            );
        } else if model.protection.geoip_url.is_none() {
            errors.push(
                format!("{path}.source_country"),
                "country matching needs protection.geoip_url",
            );
        }
    }
    if let Some(schedule) = &rule.schedule {
        if model.schedules.iter().all(|s| &s.name != schedule) {
            errors.push(
                format!("{path}.schedule"),
                format!("unknown schedule {schedule}"),
            );
        }
    }
    if let Some(limit) = &rule.rate_limit {
        if limit.rate == 0 {
            errors.push(format!("{path}.rate_limit"), "rate must be positive");
        }
        if !matches!(limit.per.as_str(), "second" | "minute" | "hour") {
            errors.push(
                format!("{path}.rate_limit.per"),
                "must be second, minute or hour",
            );
        }
    }
}

pub(super) fn check_policies(
    model: &Model,
    zones: &BTreeMap<String, ZoneConfig>,
    errors: &mut ValidationErrors,
) {
    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    for policy in &model.policies {
        let path = format!("policy[{}->{}]", policy.from, policy.to);
        for (field, zone) in [("from", &policy.from), ("to", &policy.to)] {
            if zone != HOST_ZONE && !zones.contains_key(zone.as_str()) {
                errors.push(format!("{path}.{field}"), format!("unknown zone {zone}"));
            }
        }
        if policy.from == policy.to {
            errors.push(&path, "intra-zone traffic is not policed");
        }
        if !seen.insert((policy.from.as_str(), policy.to.as_str())) {
            errors.push(&path, "duplicate policy for this zone pair");
        }
        for rule in &policy.rules {
            check_rule(rule, &format!("{path}.rule[{}]", rule.name), model, zones, errors);
        }
    }
    for scheduled in &model.scheduled_rules {
        let path = format!("scheduled_rule[{}->{}]", scheduled.from, scheduled.to);
        for (field, zone) in [("from", &scheduled.from), ("to", &scheduled.to)] {
            if zone != HOST_ZONE && !zones.contains_key(zone.as_str()) {
                errors.push(format!("{path}.{field}"), format!("unknown zone {zone}"));
            }
        }
        if model.schedules.iter().all(|s| s.name != scheduled.schedule) {
            errors.push(
                format!("{path}.schedule"),
                format!("unknown schedule {}", scheduled.schedule),
            );
        }
        check_rule(
            &scheduled.rule,
            &format!("{path}.rule[{}]", scheduled.rule.name),
            model,
            zones,
            errors,
        );
    }
}

pub(super) fn check_nat(model: &Model, errors: &mut ValidationErrors) {
    let known: HashSet<&str> = model.interfaces.iter().map(|i| i.name.as_str()).collect();
    for nat in &model.nat {
        let path = format!("nat[{}]", nat.name);
        for (field, iface) in [
            ("in_interface", &nat.in_interface),
            ("out_interface", &nat.out_interface),
        ] {
            if let Some(name) = iface {
                if !known.contains(name.as_str()) {
                    errors.push(
                        format!("{path}.{field}"),
                        format!("unknown interface {name}"),
                    );
                }
            }
        }
        match nat.kind {
            NatKind::Masquerade => {
                if nat.out_interface.is_none() {
                    errors.push(
                        format!("{path}.out_interface"),
                        "masquerade needs an egress interface",
                    );
                }
            }
            NatKind::Snat => {
                if nat.to_address.is_none() {
                    errors.push(format!("{path}.to_address"), "snat needs a source address");
                }
            }
            NatKind::Dnat => {
                if nat.to_address.is_none() {
                    errors.push(format!("{path}.to_address"), "dnat needs a target address");
                }
                if nat.in_interface.is_none() {
                    errors.push(
                        format!("{path}.in_interface"),
                        "dnat needs an ingress interface",
                    );
                }
            }
        }
        if nat.hairpin && nat.kind != NatKind::Dnat {
            errors.push(format!("{path}.hairpin"), "hairpin only applies to dnat");
        }
        if nat.to_port.is_some() && !matches!(nat.proto, Some(p) if p.has_ports()) {
            errors.push(format!("{path}.to_port"), "port rewrite needs tcp or udp");
        }
    }
}

pub(super) fn check_ipsets(model: &Model, errors: &mut ValidationErrors) {
    let mut seen = HashSet::new();
    for set in &model.ipsets {
        let path = format!("ipset[{}]", set.name);
        if !valid_ident(&set.name) {
            errors.push(&path, "invalid ipset name");
        }
        if !seen.insert(set.name.as_str()) {
            errors.push(&path, "duplicate ipset name");
        }
        if set.name == "blocked_ips" || set.name == "active_schedules" {
            errors.push(&path, "reserved set name");
        }
        if set.url.is_some() && set.file.is_some() {
            errors.push(&path, "url and file sources are mutually exclusive");
        }
        if let Some(url) = &set.url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(format!("{path}.url"), "expected an http(s) url");
            }
        }
        if set.refresh_interval == 0 {
            errors.push(format!("{path}.refresh_interval"), "must be positive");
        }
    }
}

fn scope_subnets(model: &Model, scope: &DhcpScopeConfig) -> Vec<IpNet> {
    model
        .interfaces
        .iter()
        .find(|i| i.name == scope.interface)
        .map(|i| i.addresses.clone())
        .unwrap_or_default()
}

pub(super) fn check_dhcp(model: &Model, errors: &mut ValidationErrors) {
    let known: HashSet<&str> = model.interfaces.iter().map(|i| i.name.as_str()).collect();
    let mut per_iface: HashSet<&str> = HashSet::new();
    for scope in &model.dhcp {
        let path = format!("dhcp[{}]", scope.interface);
        if !known.contains(scope.interface.as_str()) {
            errors.push(
                format!("{path}.interface"),
                format!("unknown interface {}", scope.interface),
            );
        }
        if !per_iface.insert(scope.interface.as_str()) {
            errors.push(&path, "at most one dhcp scope per interface");
        }
        if u32::from(scope.range_start) > u32::from(scope.range_end) {
            errors.push(
                format!("{path}.range_start"),
                "range start is above range end",
            );
        }
        if scope.lease_time == 0 {
            errors.push(format!("{path}.lease_time"), "must be positive");
        }
        let subnets = scope_subnets(model, scope);
        if !subnets.is_empty() {
            let inside = |ip: IpAddr| subnets.iter().any(|net| net.contains(&ip));
            if !inside(IpAddr::V4(scope.range_start)) || !inside(IpAddr::V4(scope.range_end)) {
                errors.push(&path, "range lies outside the interface subnets");
            }
        }
        for reservation in &scope.reservations {
            let rpath = format!("{path}.reservation[{}]", reservation.mac);
            if reservation.mac.parse::<MacAddr>().is_err() {
                errors.push(format!("{rpath}.mac"), "malformed mac address");
            }
        }
        for (name, _value) in &scope.options {
            if catalog::dhcp_option_code(name).is_none() {
                errors.push(
                    format!("{path}.options[{name}]"),
                    "unknown dhcp option name",
                );
            }
        }
        for vendor in &scope.vendor_classes {
            let vpath = format!("{path}.vendor_class[{}]", vendor.identifier);
            if vendor.identifier.is_empty() {
                errors.push(&vpath, "empty vendor identifier");
            }
            for (name, _value) in &vendor.options {
                if catalog::dhcp_option_code(name).is_none() {
                    errors.push(
                        format!("{vpath}.options[{name}]"),
                        "unknown dhcp option name",
                    );
                }
            }
        }
    }
}

pub(super) fn check_vpn(model: &Model, errors: &mut ValidationErrors) {
    let mut ports: BTreeSet<u16> = BTreeSet::new();
    let mut names: HashSet<&str> = HashSet::new();
    for tunnel in &model.vpn {
        let path = format!("vpn[{}]", tunnel.name);
        if InterfaceName::try_from(tunnel.name.as_str()).is_err() {
            errors.push(format!("{path}.name"), "invalid tunnel interface name");
        }
        if !names.insert(tunnel.name.as_str()) {
            errors.push(&path, "duplicate tunnel name");
        }
        if tunnel.listen_port == 0 {
            errors.push(format!("{path}.listen_port"), "listen port required");
        } else if !ports.insert(tunnel.listen_port) {
            errors.push(
                format!("{path}.listen_port"),
                "listen ports must be unique across tunnels",
            );
        }
        if !looks_like_wg_key(&tunnel.private_key) {
            errors.push(format!("{path}.private_key"), "not a base64 wireguard key");
        }
        for peer in &tunnel.peers {
            let ppath = format!("{path}.peer[{}]", &peer.public_key);
            if !looks_like_wg_key(&peer.public_key) {
                errors.push(format!("{ppath}.public_key"), "not a base64 wireguard key");
            }
            if let Some(psk) = &peer.preshared_key {
                if !looks_like_wg_key(psk) {
                    errors.push(format!("{ppath}.preshared_key"), "not a base64 wireguard key");
                }
            }
            if peer.allowed_ips.is_empty() {
                errors.push(format!("{ppath}.allowed_ips"), "peers need allowed-ips");
            }
        }
    }
}

/// 32 bytes base64-encoded is 44 chars ending in `=`.
fn looks_like_wg_key(key: &str) -> bool {
    key.len() == 44
        && key.ends_with('=')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
}

pub(super) fn check_uplinks(model: &Model, errors: &mut ValidationErrors) {
    let known: HashSet<&str> = model.interfaces.iter().map(|i| i.name.as_str()).collect();
    let mut names = HashSet::new();
    for group in &model.uplink_groups {
        let path = format!("uplink_group[{}]", group.name);
        if !valid_ident(&group.name) {
            errors.push(&path, "invalid group name");
        }
        if !names.insert(group.name.as_str()) {
            errors.push(&path, "duplicate group name");
        }
        if group.members.is_empty() {
            errors.push(format!("{path}.members"), "needs at least one member");
        }
        for member in &group.members {
            if !known.contains(member.interface.as_str()) {
                errors.push(
                    format!("{path}.members[{}]", member.interface),
                    "unknown interface",
                );
            }
        }
        if group.health.interval == 0 {
            errors.push(format!("{path}.health.interval"), "must be positive");
        }
    }
}

pub(super) fn check_schedules(model: &Model, errors: &mut ValidationErrors) {
    const DAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];
    let mut names = HashSet::new();
    for schedule in &model.schedules {
        let path = format!("scheduler[{}]", schedule.name);
        if !valid_ident(&schedule.name) {
            errors.push(&path, "invalid schedule name");
        }
        if !names.insert(schedule.name.as_str()) {
            errors.push(&path, "duplicate schedule name");
        }
        if schedule.days.is_empty() {
            errors.push(format!("{path}.days"), "needs at least one day");
        }
        for day in &schedule.days {
            if !DAYS.contains(&day.to_lowercase().as_str()) {
                errors.push(format!("{path}.days"), format!("unknown day {day}"));
            }
        }
        for (field, value) in [("start", &schedule.start), ("end", &schedule.end)] {
            if parse_hm(value).is_none() {
                errors.push(
                    format!("{path}.{field}"),
                    format!("expected HH:MM, got {value}"),
                );
            }
        }
        if let Some(tz) = &schedule.timezone {
            if tz.parse::<chrono_tz::Tz>().is_err() {
                errors.push(format!("{path}.timezone"), format!("unknown timezone {tz}"));
            }
        }
    }
}

/// `HH:MM` on a 24h clock; `24:00` is permitted as an end-of-day marker.
#[must_use]
pub fn parse_hm(value: &str) -> Option<(u8, u8)> {
    let (h, m) = value.split_once(':')?;
    let h: u8 = h.parse().ok()?;
    let m: u8 = m.parse().ok()?;
    if (h < 24 && m < 60) || (h == 24 && m == 0) {
        Some((h, m))
    } else {
        None
    }
}

pub(super) fn check_replication(model: &Model, errors: &mut ValidationErrors) {
    let Some(replication) = &model.replication else {
        return;
    };
    let path = "replication";
    if replication.priority == 0 {
        errors.push(format!("{path}.priority"), "priority lies in [1, 255]");
    }
    if replication.secret.is_empty() {
        errors.push(format!("{path}.secret"), "heartbeat secret required");
    }
    if replication.heartbeat_interval == 0 {
        errors.push(format!("{path}.heartbeat_interval"), "must be positive");
    }
    if replication.failure_threshold == 0 {
        errors.push(format!("{path}.failure_threshold"), "must be positive");
    }
    if model
        .interfaces
        .iter()
        .all(|i| i.name != replication.vip_interface)
    {
        errors.push(
            format!("{path}.vip_interface"),
            format!("unknown interface {}", replication.vip_interface),
        );
    }
}
