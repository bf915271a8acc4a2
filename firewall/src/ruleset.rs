// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The compiled packet-filter model. Everything here is plain data: the
//! compiler produces it, the renderer lowers it to nft syntax, the evaluator
//! interprets it for the inline verdict path.

use ipnet::IpNet;
use net::{InterfaceName, PortRange, Protocol};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Netfilter hooks flywall attaches to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Hook {
    Input,
    Forward,
    Prerouting,
    Postrouting,
}

impl Hook {
    /// nft hook name and the conventional priority for that hook's role.
    #[must_use]
    pub fn nft_spec(&self) -> (&'static str, &'static str, i32) {
        match self {
            Hook::Input => ("filter", "input", 0),
            Hook::Forward => ("filter", "forward", 0),
            Hook::Prerouting => ("nat", "prerouting", -100),
            Hook::Postrouting => ("nat", "postrouting", 100),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ChainPolicy {
    Accept,
    Drop,
}

/// A rule's terminal statement.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Action {
    Accept,
    Drop,
    Reject,
    Jump(String),
    Return,
    Masquerade,
    Snat {
        addr: IpAddr,
        port: Option<u16>,
    },
    Dnat {
        addr: IpAddr,
        port: Option<u16>,
    },
}

/// One match predicate. A rule matches when every predicate holds.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Match {
    InInterface(InterfaceName),
    OutInterface(InterfaceName),
    Proto(Protocol),
    SrcNet(IpNet),
    DstNet(IpNet),
    /// Logical set name; the renderer picks the per-family kernel set.
    SrcSet(String),
    DstSet(String),
    SrcPorts(Vec<PortRange>),
    DstPorts(Vec<PortRange>),
    /// Established/related conntrack state.
    CtEstablished,
    CtInvalid,
    /// TCP SYN (new connection attempts), used by the syn-flood guard.
    TcpSyn,
    /// Membership of the named schedule in the active set, maintained by the
    /// scheduler without re-applying the ruleset.
    ScheduleActive(String),
    /// Token-bucket limit; packets over the rate do not match.
    Limit {
        rate: u32,
        per: LimitUnit,
        burst: Option<u32>,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LimitUnit {
    Second,
    Minute,
    Hour,
}

impl LimitUnit {
    #[must_use]
    pub fn nft(&self) -> &'static str {
        match self {
            LimitUnit::Second => "second",
            LimitUnit::Minute => "minute",
            LimitUnit::Hour => "hour",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub matches: Vec<Match>,
    pub action: Action,
    /// Every rule carries a counter for telemetry.
    pub counter: bool,
    pub log_prefix: Option<String>,
    pub comment: Option<String>,
}

impl Rule {
    #[must_use]
    pub fn new(matches: Vec<Match>, action: Action) -> Self {
        Rule {
            matches,
            action,
            counter: true,
            log_prefix: None,
            comment: None,
        }
    }

    #[must_use]
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    #[must_use]
    pub fn log(mut self, prefix: Option<String>) -> Self {
        self.log_prefix = prefix;
        self
    }

    /// The schedule gating this rule, when any.
    #[must_use]
    pub fn schedule(&self) -> Option<&str> {
        self.matches.iter().find_map(|m| match m {
            Match::ScheduleActive(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub name: String,
    /// Base chains carry a hook and policy; regular chains are jump targets.
    pub hook: Option<(Hook, ChainPolicy)>,
    pub rules: Vec<Rule>,
}

impl Chain {
    #[must_use]
    pub fn base(name: impl Into<String>, hook: Hook, policy: ChainPolicy) -> Self {
        Chain {
            name: name.into(),
            hook: Some((hook, policy)),
            rules: Vec::new(),
        }
    }

    #[must_use]
    pub fn regular(name: impl Into<String>) -> Self {
        Chain {
            name: name.into(),
            hook: None,
            rules: Vec::new(),
        }
    }
}

/// A named set. Dynamic sets accept runtime membership changes through the
/// backend (fail2ban, fetched ipsets); static sets are fixed per revision.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SetDef {
    pub name: String,
    pub entries: BTreeSet<IpNet>,
    pub dynamic: bool,
    /// Per-element timeout (fail2ban bans age out in the kernel).
    pub timeout_secs: Option<u64>,
}

/// The whole compiled table.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Ruleset {
    pub sets: Vec<SetDef>,
    pub chains: Vec<Chain>,
    /// Names of schedules referenced anywhere; the scheduler reconciles the
    /// active subset against this.
    pub schedules: BTreeSet<String>,
}

impl Ruleset {
    #[must_use]
    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn set(&self, name: &str) -> Option<&SetDef> {
        self.sets.iter().find(|s| s.name == name)
    }

    pub fn base_chains(&self) -> impl Iterator<Item = &Chain> {
        self.chains.iter().filter(|c| c.hook.is_some())
    }

    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.chains.iter().map(|c| c.rules.len()).sum()
    }
}
