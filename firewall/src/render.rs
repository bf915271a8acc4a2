// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Lowering of a [`Ruleset`] to nft script text.
//!
//! The output is one transaction: create-if-absent, flush, redeclare. nft
//! applies the file atomically, so a failed commit leaves the previous table
//! intact, which is the whole apply contract of the compiler.

use crate::ruleset::{Action, Chain, ChainPolicy, Hook, Match, Rule, Ruleset, SetDef};
use crate::TABLE_NAME;
use ipnet::IpNet;
use net::PortRange;
use std::collections::BTreeSet;
use std::fmt::Write;

/// Render the full atomic transaction script.
#[must_use]
pub fn nft(ruleset: &Ruleset) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "table inet {TABLE_NAME} {{}}");
    let _ = writeln!(out, "flush table inet {TABLE_NAME}");
    let _ = writeln!(out, "table inet {TABLE_NAME} {{");

    for set in &ruleset.sets {
        render_set(&mut out, set);
    }
    let mut gates = GateIndex::default();
    for chain in &ruleset.chains {
        render_chain(&mut out, chain, &ruleset.schedules, &mut gates);
    }
    // Gate chains: inactive (lone return) until the scheduler reconciles.
    for (name, _) in gate_chains(ruleset) {
        let _ = writeln!(out, "    chain {name} {{");
        let _ = writeln!(out, "        return");
        let _ = writeln!(out, "    }}");
    }

    out.push_str("}\n");
    out
}

/// Deterministic walk of every gated rule, pairing each with its gate chain
/// name. The renderer and the gate updater both rely on this ordering.
fn gate_chains(ruleset: &Ruleset) -> Vec<(String, &Rule)> {
    let mut out = Vec::new();
    let mut counter = 0usize;
    for chain in &ruleset.chains {
        for rule in &chain.rules {
            if let Some(schedule) = rule.schedule() {
                if ruleset.schedules.contains(schedule) {
                    out.push((format!("{}_{counter}", gate_chain(schedule)), rule));
                    counter += 1;
                }
            }
        }
    }
    out
}

/// A short human summary for `show --summary`.
#[must_use]
pub fn summary(ruleset: &Ruleset) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "table inet {TABLE_NAME}: {} chains, {} rules, {} sets",
        ruleset.chains.len(),
        ruleset.rule_count(),
        ruleset.sets.len()
    );
    for chain in &ruleset.chains {
        let kind = match chain.hook {
            Some((hook, _)) => format!("{:?} hook", hook).to_lowercase(),
            None => "regular".to_string(),
        };
        let _ = writeln!(out, "  {} ({kind}): {} rules", chain.name, chain.rules.len());
    }
    out
}

/// Base name of the kernel chains gating one schedule's rules. Each gated
/// rule gets its own numbered gate so rules sharing a schedule keep their
/// own terminal actions; every gate holds a lone `return` while inactive.
#[must_use]
pub fn gate_chain(schedule: &str) -> String {
    format!("sched_{schedule}")
}

/// Per-rule gate tracking during a render pass.
#[derive(Default)]
struct GateIndex {
    counter: usize,
}

fn family_split(entries: &BTreeSet<IpNet>) -> (Vec<&IpNet>, Vec<&IpNet>) {
    entries.iter().partition(|net| matches!(net, IpNet::V4(_)))
}

fn render_set(out: &mut String, set: &SetDef) {
    let (v4, v6) = family_split(&set.entries);
    for (suffix, kind, members) in [("_v4", "ipv4_addr", v4), ("_v6", "ipv6_addr", v6)] {
        let _ = writeln!(out, "    set {}{suffix} {{", set.name);
        let _ = writeln!(out, "        type {kind};");
        let mut flags = vec!["interval"];
        if set.timeout_secs.is_some() {
            flags.push("timeout");
        }
        let _ = writeln!(out, "        flags {};", flags.join(", "));
        if let Some(timeout) = set.timeout_secs {
            let _ = writeln!(out, "        timeout {timeout}s;");
        }
        if !members.is_empty() {
            let rendered: Vec<String> = members.iter().map(|net| net.to_string()).collect();
            let _ = writeln!(out, "        elements = {{ {} }};", rendered.join(", "));
        }
        let _ = writeln!(out, "    }}");
    }
}

fn render_chain(
    out: &mut String,
    chain: &Chain,
    schedules: &BTreeSet<String>,
    gates: &mut GateIndex,
) {
    let _ = writeln!(out, "    chain {} {{", chain.name);
    if let Some((hook, policy)) = chain.hook {
        let (kind, hook_name, priority) = hook.nft_spec();
        let policy = match policy {
            ChainPolicy::Accept => "accept",
            ChainPolicy::Drop => "drop",
        };
        let _ = writeln!(
            out,
            "        type {kind} hook {hook_name} priority {priority}; policy {policy};"
        );
    }
    for rule in &chain.rules {
        // Scheduled rules divert through their own gate chain; the terminal
        // action lives inside the gate so the scheduler can toggle it
        // without touching this chain.
        if let Some(schedule) = rule.schedule() {
            if schedules.contains(schedule) {
                let gate = format!("{}_{}", gate_chain(schedule), gates.counter);
                gates.counter += 1;
                let mut stripped = rule.clone();
                stripped
                    .matches
                    .retain(|m| !matches!(m, Match::ScheduleActive(_)));
                stripped.action = Action::Jump(gate);
                for line in render_rule(&stripped) {
                    let _ = writeln!(out, "        {line}");
                }
                continue;
            }
        }
        for line in render_rule(rule) {
            let _ = writeln!(out, "        {line}");
        }
    }
    let _ = writeln!(out, "    }}");
}

/// One logical rule can lower to two kernel rules when a set match has both
/// address families.
fn render_rule(rule: &Rule) -> Vec<String> {

    let mut families = vec![None];
    if rule
        .matches
        .iter()
        .any(|m| matches!(m, Match::SrcSet(_) | Match::DstSet(_)))
    {
        families = vec![Some("ip"), Some("ip6")];
    }

    families
        .into_iter()
        .map(|family| {
            let mut parts: Vec<String> = Vec::new();
            for m in &rule.matches {
                if let Some(text) = render_match(m, family) {
                    parts.push(text);
                }
            }
            if rule.counter {
                parts.push("counter".to_string());
            }
            if let Some(prefix) = &rule.log_prefix {
                parts.push(format!("log prefix \"{prefix}: \""));
            }
            parts.push(render_action(&rule.action));
            if let Some(comment) = &rule.comment {
                parts.push(format!("comment \"{comment}\""));
            }
            parts.join(" ")
        })
        .collect()
}

fn render_ports(ranges: &[PortRange]) -> String {
    let rendered: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
    if rendered.len() == 1 && !rendered[0].contains('-') {
        rendered.into_iter().next().unwrap_or_default()
    } else {
        format!("{{ {} }}", rendered.join(", "))
    }
}

fn render_match(m: &Match, family: Option<&str>) -> Option<String> {
    let text = match m {
        Match::InInterface(name) => format!("iifname \"{name}\""),
        Match::OutInterface(name) => format!("oifname \"{name}\""),
        Match::Proto(proto) => format!("meta l4proto {proto}"),
        Match::SrcNet(net) => match net {
            IpNet::V4(net) => format!("ip saddr {net}"),
            IpNet::V6(net) => format!("ip6 saddr {net}"),
        },
        Match::DstNet(net) => match net {
            IpNet::V4(net) => format!("ip daddr {net}"),
            IpNet::V6(net) => format!("ip6 daddr {net}"),
        },
        Match::SrcSet(set) => {
            let family = family.unwrap_or("ip");
            let suffix = if family == "ip" { "_v4" } else { "_v6" };
            format!("{family} saddr @{set}{suffix}")
        }
        Match::DstSet(set) => {
            let family = family.unwrap_or("ip");
            let suffix = if family == "ip" { "_v4" } else { "_v6" };
            format!("{family} daddr @{set}{suffix}")
        }
        Match::SrcPorts(ranges) => format!("th sport {}", render_ports(ranges)),
        Match::DstPorts(ranges) => format!("th dport {}", render_ports(ranges)),
        Match::CtEstablished => "ct state established,related".to_string(),
        Match::CtInvalid => "ct state invalid".to_string(),
        Match::TcpSyn => "tcp flags & (fin|syn|rst|ack) == syn".to_string(),
        // Lowered to a gate-chain jump before we get here.
        Match::ScheduleActive(_) => return None,
        Match::Limit { rate, per, burst } => {
            let mut text = format!("limit rate {rate}/{}", per.nft());
            if let Some(burst) = burst {
                let _ = write!(text, " burst {burst} packets");
            }
            text
        }
    };
    Some(text)
}

fn render_action(action: &Action) -> String {
    match action {
        Action::Accept => "accept".to_string(),
        Action::Drop => "drop".to_string(),
        Action::Reject => "reject".to_string(),
        Action::Return => "return".to_string(),
        Action::Jump(chain) => format!("jump {chain}"),
        Action::Masquerade => "masquerade".to_string(),
        Action::Snat { addr, port } => match port {
            Some(port) => format!("snat to {addr}:{port}"),
            None => format!("snat to {addr}"),
        },
        Action::Dnat { addr, port } => match port {
            Some(port) => format!("dnat to {addr}:{port}"),
            None => format!("dnat to {addr}"),
        },
    }
}

/// The gate script the scheduler applies when a window opens or closes.
/// Flushing and refilling one-rule chains is the minimal kernel churn that
/// still happens inside a transaction.
#[must_use]
pub fn gate_update(ruleset: &Ruleset, schedule: &str, active: bool) -> String {
    let prefix = format!("{}_", gate_chain(schedule));
    let mut out = String::new();
    for (gate, rule) in gate_chains(ruleset) {
        if !gate.starts_with(&prefix) {
            continue;
        }
        let _ = writeln!(out, "flush chain inet {TABLE_NAME} {gate}");
        if active {
            // Matches were already consumed by the jump; only the action
            // (and its counter) belong in the gate.
            let body = Rule {
                matches: Vec::new(),
                action: rule.action.clone(),
                counter: true,
                log_prefix: rule.log_prefix.clone(),
                comment: rule.comment.clone(),
            };
            for line in render_rule(&body) {
                let _ = writeln!(out, "add rule inet {TABLE_NAME} {gate} {line}");
            }
        } else {
            let _ = writeln!(out, "add rule inet {TABLE_NAME} {gate} return");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;
    use pretty_assertions::assert_eq;

    fn model(text: &str) -> config::ValidModel {
        config::validate(config::from_yaml_str(text).unwrap()).unwrap()
    }

    fn sample() -> Ruleset {
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
    management: [ssh]
  - name: wan
    external: true
policy:
  - from: lan
    to: wan
    rules:
      - name: allow-web
        action: accept
        service: web
nat:
  - name: outbound
    kind: masquerade
    out_interface: eth1
",
        ))
        .unwrap()
    }

    #[test]
    fn script_is_one_atomic_transaction() {
        let script = nft(&sample());
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "table inet flywall {}");
        assert_eq!(lines[1], "flush table inet flywall");
        assert_eq!(lines[2], "table inet flywall {");
        assert_eq!(*lines.last().unwrap(), "}");
    }

    #[test]
    fn renders_expected_fragments() {
        let script = nft(&sample());
        assert!(script.contains("type filter hook input priority 0; policy drop;"));
        assert!(script.contains("iifname \"lo\""));
        assert!(script.contains("ct state established,related"));
        assert!(script.contains("ip saddr @blocked_ips_v4"));
        assert!(script.contains("ip6 saddr @blocked_ips_v6"));
        assert!(script.contains("th dport { 80, 443 }"));
        assert!(script.contains("oifname \"eth1\" counter masquerade"));
    }

    #[test]
    fn rendering_is_deterministic() {
        assert_eq!(nft(&sample()), nft(&sample()));
    }

    #[test]
    fn scheduled_rule_lowers_to_gate_jump() {
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
  - name: nighttime
    days: [mon]
    start: '22:00'
    end: '06:00'
policy:
  - from: lan
    to: wan
    rules:
      - name: block-late
        action: drop
        schedule: nighttime
",
        ))
        .unwrap();
        let script = nft(&ruleset);
        assert!(script.contains("jump sched_nighttime_0"));
        assert!(script.contains("chain sched_nighttime_0 {"));

        let open = gate_update(&ruleset, "nighttime", true);
        assert!(open.contains("flush chain inet flywall sched_nighttime_0"));
        assert!(open.contains("drop"));
        let closed = gate_update(&ruleset, "nighttime", false);
        assert!(closed.contains("return"));
    }

    #[test]
    fn rules_sharing_a_schedule_keep_their_own_gates() {
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
    days: [mon]
    start: '09:00'
    end: '17:00'
policy:
  - from: lan
    to: wan
    rules:
      - name: drop-games
        action: drop
        proto: tcp
        dst_ports: ['27015']
        schedule: worktime
      - name: allow-web
        action: accept
        proto: tcp
        dst_ports: ['443']
        schedule: worktime
",
        ))
        .unwrap();
        let script = nft(&ruleset);
        assert!(script.contains("jump sched_worktime_0"));
        assert!(script.contains("jump sched_worktime_1"));

        let open = gate_update(&ruleset, "worktime", true);
        // Each gate refills with its own action.
        assert!(open.contains("sched_worktime_0 counter drop"));
        assert!(open.contains("sched_worktime_1 counter accept"));
    }
}
