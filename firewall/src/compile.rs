// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Projection of the validated model into a [`Ruleset`].
//!
//! The output is deterministic for a given model: zone iteration follows the
//! zone map's ordering and rules keep their declared order, so applying the
//! same model twice yields a byte-identical rendering.

use crate::ruleset::{
    Action, Chain, ChainPolicy, Hook, LimitUnit, Match, Rule, Ruleset, SetDef,
};
use crate::{BLOCKED_SET, TABLE_NAME};
use config::catalog;
use config::{
    Capability, EndpointMatch, NatKind, PolicyConfig, RuleAction, RuleConfig, ValidModel,
};
use ipnet::IpNet;
use net::{IllegalInterfaceName, InterfaceName, Protocol};
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    // Both variants mean a raw model bypassed the validator.
    #[error("interface name escaped validation: {0}")]
    Name(#[from] IllegalInterfaceName),
    #[error("nat rule {0} has no translation address")]
    MissingNatTarget(String),
}

/// Compile `model` into the full desired ruleset for table `flywall`.
pub fn compile(model: &ValidModel) -> Result<Ruleset, CompileError> {
    let mut ruleset = Ruleset::default();

    compile_sets(model, &mut ruleset);
    compile_input(model, &mut ruleset)?;
    compile_forward(model, &mut ruleset)?;
    compile_nat(model, &mut ruleset)?;

    for chain in &ruleset.chains {
        for rule in &chain.rules {
            if let Some(schedule) = rule.schedule() {
                ruleset.schedules.insert(schedule.to_string());
            }
        }
    }

    debug!(
        table = TABLE_NAME,
        chains = ruleset.chains.len(),
        rules = ruleset.rule_count(),
        sets = ruleset.sets.len(),
        "compiled ruleset"
    );
    Ok(ruleset)
}

fn compile_sets(model: &ValidModel, out: &mut Ruleset) {
    // The fail2ban set exists unconditionally; bans age out in the kernel.
    out.sets.push(SetDef {
        name: BLOCKED_SET.to_string(),
        entries: BTreeSet::new(),
        dynamic: true,
        timeout_secs: Some(model.model().protection.fail2ban.ban_time.max(60)),
    });

    for set in &model.model().ipsets {
        let dynamic = set.url.is_some() || set.file.is_some() || !set.domains.is_empty();
        out.sets.push(SetDef {
            name: set.name.clone(),
            entries: set.entries.iter().copied().collect(),
            dynamic,
            timeout_secs: None,
        });
    }

    // Country predicates get auto-managed sets fed by the same fetcher.
    let mut countries: BTreeSet<String> = BTreeSet::new();
    let all_rules = model
        .model()
        .policies
        .iter()
        .flat_map(|p| p.rules.iter())
        .chain(model.model().scheduled_rules.iter().map(|s| &s.rule));
    for rule in all_rules {
        if let Some(cc) = &rule.source_country {
            countries.insert(cc.to_lowercase());
        }
    }
    for cc in countries {
        out.sets.push(SetDef {
            name: format!("country_{cc}"),
            entries: BTreeSet::new(),
            dynamic: true,
            timeout_secs: None,
        });
    }
}

fn compile_input(model: &ValidModel, out: &mut Ruleset) -> Result<(), CompileError> {
    let mut input = Chain::base("input", Hook::Input, ChainPolicy::Drop);
    input.rules.push(
        Rule::new(
            vec![Match::InInterface(InterfaceName::try_from("lo")?)],
            Action::Accept,
        )
        .comment("loopback"),
    );
    input
        .rules
        .push(Rule::new(vec![Match::CtEstablished], Action::Accept));
    input
        .rules
        .push(Rule::new(vec![Match::CtInvalid], Action::Drop));
    input.rules.push(
        Rule::new(vec![Match::SrcSet(BLOCKED_SET.to_string())], Action::Drop)
            .comment("fail2ban"),
    );

    let protection = &model.model().protection;
    if let Some(rate) = protection.syn_flood_rate {
        // Over-rate SYNs fall through the limit match into the drop.
        input.rules.push(
            Rule::new(
                vec![
                    Match::TcpSyn,
                    Match::Limit {
                        rate,
                        per: LimitUnit::Second,
                        burst: Some(rate.saturating_mul(2)),
                    },
                ],
                Action::Accept,
            )
            .comment("syn budget"),
        );
        input
            .rules
            .push(Rule::new(vec![Match::TcpSyn], Action::Drop).comment("syn flood"));
    }
    if let Some(rate) = protection.icmp_rate {
        input.rules.push(Rule::new(
            vec![
                Match::Proto(Protocol::Icmp),
                Match::Limit {
                    rate,
                    per: LimitUnit::Second,
                    burst: None,
                },
            ],
            Action::Accept,
        ));
        input
            .rules
            .push(Rule::new(vec![Match::Proto(Protocol::Icmp)], Action::Drop));
    }

    let mut zone_chains = Vec::new();
    for (zone_name, zone) in model.zones() {
        let chain_name = format!("input_{zone_name}");
        let mut members = model.zone_interfaces(zone_name).peekable();
        if members.peek().is_none() {
            continue;
        }
        for iface in members {
            input.rules.push(Rule::new(
                vec![Match::InInterface(InterfaceName::try_from(
                    iface.name.as_str(),
                )?)],
                Action::Jump(chain_name.clone()),
            ));
        }

        let mut chain = Chain::regular(chain_name);
        // Management capabilities outrank policy rules.
        for capability in zone.management.iter().copied() {
            push_capability_rules(&mut chain, capability);
        }
        for service in &zone.services {
            let mut matches = vec![Match::Proto(service.proto)];
            if !service.ports.is_empty() {
                matches.push(Match::DstPorts(service.ports.clone()));
            }
            chain
                .rules
                .push(Rule::new(matches, Action::Accept).comment(service.name.clone()));
        }
        // Explicit (zone -> flywall) policy rules, declared order.
        for policy in model.host_policies().filter(|p| &p.from == zone_name) {
            push_policy_rules(&mut chain, policy);
        }
        zone_chains.push(chain);
    }

    out.chains.push(input);
    out.chains.extend(zone_chains);
    Ok(())
}

fn push_capability_rules(chain: &mut Chain, capability: Capability) {
    for leg in catalog::capability_ports(capability) {
        let mut matches = vec![Match::Proto(leg.proto)];
        if !leg.ports.is_empty() {
            matches.push(Match::DstPorts(leg.ports));
        }
        chain
            .rules
            .push(Rule::new(matches, Action::Accept).comment(format!("mgmt {capability}")));
    }
}

fn compile_forward(model: &ValidModel, out: &mut Ruleset) -> Result<(), CompileError> {
    let mut forward = Chain::base("forward", Hook::Forward, ChainPolicy::Drop);
    forward
        .rules
        .push(Rule::new(vec![Match::CtEstablished], Action::Accept));
    forward
        .rules
        .push(Rule::new(vec![Match::CtInvalid], Action::Drop));
    forward.rules.push(
        Rule::new(vec![Match::SrcSet(BLOCKED_SET.to_string())], Action::Drop)
            .comment("fail2ban"),
    );

    // Safe mode: the forward path stays closed, management input untouched.
    if model.model().features.safe_mode {
        out.chains.push(forward);
        return Ok(());
    }

    let mut pair_chains = Vec::new();
    for policy in model.forward_policies() {
        let chain_name = format!("fwd_{}_{}", policy.from, policy.to);
        for from_iface in model.zone_interfaces(&policy.from) {
            for to_iface in model.zone_interfaces(&policy.to) {
                forward.rules.push(Rule::new(
                    vec![
                        Match::InInterface(InterfaceName::try_from(from_iface.name.as_str())?),
                        Match::OutInterface(InterfaceName::try_from(to_iface.name.as_str())?),
                    ],
                    Action::Jump(chain_name.clone()),
                ));
            }
        }

        let mut chain = Chain::regular(chain_name.clone());
        push_policy_rules(&mut chain, policy);
        for scheduled in model
            .model()
            .scheduled_rules
            .iter()
            .filter(|s| s.from == policy.from && s.to == policy.to)
        {
            let mut rule = translate_rule(&scheduled.rule);
            rule.matches
                .push(Match::ScheduleActive(scheduled.schedule.clone()));
            chain.rules.push(rule);
        }
        if let Some(action) = policy.default_action {
            chain
                .rules
                .push(Rule::new(Vec::new(), translate_action(action)).comment("policy default"));
        }
        pair_chains.push(chain);
    }

    out.chains.push(forward);
    out.chains.extend(pair_chains);
    Ok(())
}

fn push_policy_rules(chain: &mut Chain, policy: &PolicyConfig) {
    for rule in &policy.rules {
        chain.rules.push(translate_rule(rule));
    }
}

fn translate_action(action: RuleAction) -> Action {
    match action {
        RuleAction::Accept => Action::Accept,
        RuleAction::Drop => Action::Drop,
        RuleAction::Reject => Action::Reject,
    }
}

fn translate_rule(rule: &RuleConfig) -> Rule {
    let mut matches = Vec::new();
    if let Some(proto) = rule.proto {
        if proto != Protocol::Any {
            matches.push(Match::Proto(proto));
        }
    }
    match &rule.src {
        Some(EndpointMatch::Cidr(net)) => matches.push(Match::SrcNet(*net)),
        Some(EndpointMatch::Set(set)) => matches.push(Match::SrcSet(set.clone())),
        None => {}
    }
    match &rule.dst {
        Some(EndpointMatch::Cidr(net)) => matches.push(Match::DstNet(*net)),
        Some(EndpointMatch::Set(set)) => matches.push(Match::DstSet(set.clone())),
        None => {}
    }
    if !rule.src_ports.is_empty() {
        matches.push(Match::SrcPorts(rule.src_ports.clone()));
    }
    if !rule.dst_ports.is_empty() {
        matches.push(Match::DstPorts(rule.dst_ports.clone()));
    }
    if let Some(cc) = &rule.source_country {
        matches.push(Match::SrcSet(format!("country_{}", cc.to_lowercase())));
    }
    if let Some(schedule) = &rule.schedule {
        matches.push(Match::ScheduleActive(schedule.clone()));
    }
    if let Some(limit) = &rule.rate_limit {
        let per = match limit.per.as_str() {
            "minute" => LimitUnit::Minute,
            "hour" => LimitUnit::Hour,
            _ => LimitUnit::Second,
        };
        matches.push(Match::Limit {
            rate: limit.rate,
            per,
            burst: limit.burst,
        });
    }

    // The validator requires an action; drop is the conservative stand-in
    // should a raw model ever bypass it.
    let action = translate_action(rule.action.unwrap_or(RuleAction::Drop));
    let mut out = Rule::new(matches, action).log(rule.log.clone());
    if !rule.name.is_empty() {
        out = out.comment(rule.name.clone());
    }
    out
}

fn compile_nat(model: &ValidModel, out: &mut Ruleset) -> Result<(), CompileError> {
    let mut prerouting = Chain::base("prerouting", Hook::Prerouting, ChainPolicy::Accept);
    let mut postrouting = Chain::base("postrouting", Hook::Postrouting, ChainPolicy::Accept);

    for nat in &model.model().nat {
        let mut matches = Vec::new();
        if let Some(proto) = nat.proto {
            if proto != Protocol::Any {
                matches.push(Match::Proto(proto));
            }
        }
        match &nat.src {
            Some(EndpointMatch::Cidr(net)) => matches.push(Match::SrcNet(*net)),
            Some(EndpointMatch::Set(set)) => matches.push(Match::SrcSet(set.clone())),
            None => {}
        }
        match &nat.dst {
            Some(EndpointMatch::Cidr(net)) => matches.push(Match::DstNet(*net)),
            Some(EndpointMatch::Set(set)) => matches.push(Match::DstSet(set.clone())),
            None => {}
        }
        if !nat.dst_ports.is_empty() {
            matches.push(Match::DstPorts(nat.dst_ports.clone()));
        }

        match nat.kind {
            NatKind::Masquerade => {
                if let Some(out_iface) = &nat.out_interface {
                    matches.push(Match::OutInterface(InterfaceName::try_from(
                        out_iface.as_str(),
                    )?));
                }
                postrouting
                    .rules
                    .push(Rule::new(matches, Action::Masquerade).comment(nat.name.clone()));
            }
            NatKind::Snat => {
                if let Some(out_iface) = &nat.out_interface {
                    matches.push(Match::OutInterface(InterfaceName::try_from(
                        out_iface.as_str(),
                    )?));
                }
                let addr = nat
                    .to_address
                    .ok_or_else(|| CompileError::MissingNatTarget(nat.name.clone()))?;
                postrouting.rules.push(
                    Rule::new(
                        matches,
                        Action::Snat {
                            addr,
                            port: nat.to_port.map(|p| p.to_u16()),
                        },
                    )
                    .comment(nat.name.clone()),
                );
            }
            NatKind::Dnat => {
                let addr = nat
                    .to_address
                    .ok_or_else(|| CompileError::MissingNatTarget(nat.name.clone()))?;
                if let Some(in_iface) = &nat.in_interface {
                    matches.push(Match::InInterface(InterfaceName::try_from(
                        in_iface.as_str(),
                    )?));
                }
                prerouting.rules.push(
                    Rule::new(
                        matches,
                        Action::Dnat {
                            addr,
                            port: nat.to_port.map(|p| p.to_u16()),
                        },
                    )
                    .comment(nat.name.clone()),
                );
                if nat.hairpin {
                    // Inside hosts reaching the published address come back
                    // out the interface they arrived on; masquerade so the
                    // target replies through us.
                    if let Some(in_iface) = &nat.in_interface {
                        postrouting.rules.push(
                            Rule::new(
                                vec![
                                    Match::OutInterface(InterfaceName::try_from(
                                        in_iface.as_str(),
                                    )?),
                                    Match::DstNet(IpNet::from(addr)),
                                ],
                                Action::Masquerade,
                            )
                            .comment(format!("{} hairpin", nat.name)),
                        );
                    }
                }
            }
        }
    }

    out.chains.push(prerouting);
    out.chains.push(postrouting);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn model(text: &str) -> ValidModel {
        config::validate(config::from_yaml_str(text).unwrap()).unwrap()
    }

    fn lan_wan() -> ValidModel {
        model(
            r"
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
    management: [ssh]
  - name: wan
    external: true
policy:
  - from: lan
    to: wan
    rules:
      - name: allow-all
        action: accept
nat:
  - name: outbound
    kind: masquerade
    out_interface: eth1
",
        )
    }

    #[test]
    fn compiles_expected_chains() {
        let ruleset = compile(&lan_wan()).unwrap();
        for chain in ["input", "forward", "prerouting", "postrouting", "input_lan", "fwd_lan_wan"] {
            assert!(ruleset.chain(chain).is_some(), "missing chain {chain}");
        }
        // blocked_ips always exists and is dynamic.
        let blocked = ruleset.set(BLOCKED_SET).unwrap();
        assert!(blocked.dynamic);
    }

    #[test]
    fn compile_is_deterministic() {
        let a = compile(&lan_wan()).unwrap();
        let b = compile(&lan_wan()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn system_defaults_precede_zone_jumps() {
        let ruleset = compile(&lan_wan()).unwrap();
        let input = ruleset.chain("input").unwrap();
        assert!(matches!(input.rules[0].matches[0], Match::InInterface(_)));
        assert_eq!(input.rules[1].matches, vec![Match::CtEstablished]);
        // Zone jump comes after the defaults.
        let jump_at = input
            .rules
            .iter()
            .position(|r| matches!(r.action, Action::Jump(_)))
            .unwrap();
        assert!(jump_at >= 4);
    }

    #[test]
    fn management_rules_lead_zone_chain() {
        let ruleset = compile(&lan_wan()).unwrap();
        let lan = ruleset.chain("input_lan").unwrap();
        assert_eq!(
            lan.rules[0].comment.as_deref(),
            Some("mgmt ssh"),
            "capability accepts come first"
        );
    }

    #[test]
    fn scheduled_rule_is_emitted_unconditionally_with_gate() {
        let ruleset = compile(&model(
            r"
interface:
  - name: eth0
    kind: physical
    zone: lan
  - name: eth1
    kind: physical
    zone: wan
scheduler:
  - name: worktime
    days: [mon, tue, wed, thu, fri]
    start: '09:00'
    end: '17:00'
    timezone: Europe/Berlin
policy:
  - from: lan
    to: wan
    rules: []
scheduled_rule:
  - from: lan
    to: wan
    schedule: worktime
    name: kids-offline
    action: drop
",
        ))
        .unwrap();
        let chain = ruleset.chain("fwd_lan_wan").unwrap();
        let gated = chain
            .rules
            .iter()
            .find(|r| r.schedule().is_some())
            .expect("scheduled rule present");
        assert_eq!(gated.schedule(), Some("worktime"));
        assert!(ruleset.schedules.contains("worktime"));
    }

    #[test]
    fn hairpin_dnat_adds_ingress_masquerade() {
        let ruleset = compile(&model(
            r"
interface:
  - name: eth0
    kind: physical
    zone: lan
    addresses: [192.168.1.1/24]
  - name: eth1
    kind: physical
    zone: wan
nat:
  - name: web-in
    kind: dnat
    in_interface: eth1
    proto: tcp
    dst_ports: ['443']
    to_address: 192.168.1.10
    hairpin: true
",
        ))
        .unwrap();
        let postrouting = ruleset.chain("postrouting").unwrap();
        let hairpin = postrouting
            .rules
            .iter()
            .find(|r| r.comment.as_deref() == Some("web-in hairpin"))
            .expect("hairpin snat emitted");
        assert_eq!(hairpin.action, Action::Masquerade);
    }

    #[test]
    fn safe_mode_closes_forwarding_keeps_management() {
        let ruleset = compile(&model(
            r"
features:
  safe_mode: true
interface:
  - name: eth0
    kind: physical
    zone: lan
  - name: eth1
    kind: physical
    zone: wan
zone:
  - name: lan
    management: [ssh, web]
  - name: wan
    external: true
policy:
  - from: lan
    to: wan
    rules:
      - name: out
        action: accept
",
        ))
        .unwrap();
        let forward = ruleset.chain("forward").unwrap();
        assert!(
            forward
                .rules
                .iter()
                .all(|r| !matches!(r.action, Action::Jump(_))),
            "no forwarding jumps in safe mode"
        );
        // Management path survives.
        assert!(ruleset.chain("input_lan").is_some());
    }

    #[test]
    fn country_predicate_creates_set() {
        let ruleset = compile(&model(
            r"
protection:
  geoip_url: 'https://geo.example.com/{cc}.txt'
interface:
  - name: eth0
    kind: physical
    zone: wan
policy:
  - from: wan
    to: flywall
    rules:
      - name: no-kp
        action: drop
        source_country: KP
",
        ))
        .unwrap();
        assert!(ruleset.set("country_kp").is_some());
        let chain = ruleset.chain("input_wan").unwrap();
        assert!(
            chain
                .rules
                .iter()
                .any(|r| r.matches.contains(&Match::SrcSet("country_kp".into())))
        );
    }
}
