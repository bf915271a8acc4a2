// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

use ipnet::IpNet;
use net::{Port, PortRange, Protocol};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use std::str::FromStr;

/// Terminal action of a policy rule.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Accept,
    Drop,
    Reject,
}

impl Display for RuleAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleAction::Accept => write!(f, "accept"),
            RuleAction::Drop => write!(f, "drop"),
            RuleAction::Reject => write!(f, "reject"),
        }
    }
}

/// A source/destination predicate: a literal CIDR or a named IPSet
/// (`@setname` in the declarative form).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EndpointMatch {
    Cidr(IpNet),
    Set(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("endpoint match {0} is neither a CIDR nor an @set reference")]
pub struct InvalidEndpointMatch(String);

impl FromStr for EndpointMatch {
    type Err = InvalidEndpointMatch;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if let Some(set) = value.strip_prefix('@') {
            if set.is_empty() {
                return Err(InvalidEndpointMatch(value.to_string()));
            }
            return Ok(EndpointMatch::Set(set.to_string()));
        }
        // Accept bare addresses as host CIDRs.
        if let Ok(addr) = value.parse::<IpAddr>() {
            return Ok(EndpointMatch::Cidr(IpNet::from(addr)));
        }
        value
            .parse::<IpNet>()
            .map(EndpointMatch::Cidr)
            .map_err(|_| InvalidEndpointMatch(value.to_string()))
    }
}

impl TryFrom<String> for EndpointMatch {
    type Error = InvalidEndpointMatch;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EndpointMatch> for String {
    fn from(value: EndpointMatch) -> Self {
        match value {
            EndpointMatch::Cidr(net) => net.to_string(),
            EndpointMatch::Set(name) => format!("@{name}"),
        }
    }
}

/// Token-bucket rate limit attached to a rule.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RateLimit {
    /// Packets per `per`.
    pub rate: u32,
    /// One of `second`, `minute`, `hour`.
    #[serde(default = "RateLimit::default_per")]
    pub per: String,
    #[serde(default)]
    pub burst: Option<u32>,
}

impl RateLimit {
    fn default_per() -> String {
        "second".to_string()
    }
}

/// One rule inside a policy, in declared order.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuleConfig {
    pub name: String,
    pub action: Option<RuleAction>,
    pub proto: Option<Protocol>,
    pub src: Option<EndpointMatch>,
    pub dst: Option<EndpointMatch>,
    pub src_ports: Vec<PortRange>,
    pub dst_ports: Vec<PortRange>,
    /// Service alias expanded against the built-in catalog (`web`, `dns`, …).
    pub service: Option<String>,
    /// ISO-3166 alpha-2; compiles to membership of an auto-managed set.
    pub source_country: Option<String>,
    /// Names a `scheduler` window; the rule only matches while it is active.
    pub schedule: Option<String>,
    /// Log prefix; presence enables logging for this rule.
    pub log: Option<String>,
    pub rate_limit: Option<RateLimit>,
}

/// Directed (from-zone, to-zone) ordered rule list.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    pub from: String,
    pub to: String,
    pub rules: Vec<RuleConfig>,
    /// Applied after every rule missed. Defaults to the global drop.
    pub default_action: Option<RuleAction>,
}

/// NAT flavours.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatKind {
    Masquerade,
    Snat,
    Dnat,
}

/// One `nat { … }` rule.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NatRuleConfig {
    pub name: String,
    pub kind: NatKind,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub proto: Option<Protocol>,
    pub src: Option<EndpointMatch>,
    pub dst: Option<EndpointMatch>,
    pub dst_ports: Vec<PortRange>,
    pub to_address: Option<IpAddr>,
    pub to_port: Option<Port>,
    /// DNAT only: also emit the SNAT that lets inside hosts reach the
    /// published address.
    pub hairpin: bool,
}

impl Default for NatRuleConfig {
    fn default() -> Self {
        NatRuleConfig {
            name: String::new(),
            kind: NatKind::Masquerade,
            in_interface: None,
            out_interface: None,
            proto: None,
            src: None,
            dst: None,
            dst_ports: Vec::new(),
            to_address: None,
            to_port: None,
            hairpin: false,
        }
    }
}

/// A standalone scheduled rule: a policy rule bound to a schedule window,
/// declared outside any policy block.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduledRuleConfig {
    pub from: String,
    pub to: String,
    pub schedule: String,
    #[serde(flatten)]
    pub rule: RuleConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_match_forms() {
        assert_eq!(
            "@bogons".parse::<EndpointMatch>().unwrap(),
            EndpointMatch::Set("bogons".into())
        );
        assert!(matches!(
            "10.0.0.0/8".parse::<EndpointMatch>().unwrap(),
            EndpointMatch::Cidr(_)
        ));
        // Bare host address becomes a /32.
        match "192.0.2.7".parse::<EndpointMatch>().unwrap() {
            EndpointMatch::Cidr(net) => assert_eq!(net.prefix_len(), 32),
            other => panic!("unexpected {other:?}"),
        }
        assert!("@".parse::<EndpointMatch>().is_err());
        assert!("lan".parse::<EndpointMatch>().is_err());
    }
}
