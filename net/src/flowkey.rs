// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::str::FromStr;

/// Transport protocols flywall can match on.
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Gre,
    Esp,
    Ah,
    /// Matches any protocol; carries no port semantics.
    Any,
}

impl Protocol {
    /// IANA protocol number, where one exists. `Any` has none.
    #[must_use]
    pub fn number(&self) -> Option<u8> {
        match self {
            Protocol::Tcp => Some(6),
            Protocol::Udp => Some(17),
            Protocol::Icmp => Some(1),
            Protocol::Icmpv6 => Some(58),
            Protocol::Gre => Some(47),
            Protocol::Esp => Some(50),
            Protocol::Ah => Some(51),
            Protocol::Any => None,
        }
    }

    /// Only TCP and UDP rules may carry port predicates.
    #[must_use]
    pub fn has_ports(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol {0}")]
pub struct UnknownProtocol(String);

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            "icmpv6" | "ipv6-icmp" => Ok(Protocol::Icmpv6),
            "gre" => Ok(Protocol::Gre),
            "esp" => Ok(Protocol::Esp),
            "ah" => Ok(Protocol::Ah),
            "any" | "all" => Ok(Protocol::Any),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Icmpv6 => "icmpv6",
            Protocol::Gre => "gre",
            Protocol::Esp => "esp",
            Protocol::Ah => "ah",
            Protocol::Any => "any",
        };
        write!(f, "{name}")
    }
}

/// The 5-tuple identifying a flow.
///
/// Ports are zero for protocols without port semantics; the tuple is still
/// unique per conversation for those because the kernel tracks them that way.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: Protocol,
}

impl Hash for FlowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.src_ip.hash(state);
        self.dst_ip.hash(state);
        self.src_port.hash(state);
        self.dst_port.hash(state);
        self.proto.hash(state);
    }
}

impl FlowKey {
    #[must_use]
    pub fn new(src_ip: IpAddr, dst_ip: IpAddr, src_port: u16, dst_port: u16, proto: Protocol) -> Self {
        FlowKey {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            proto,
        }
    }

    /// The same flow seen from the responder's side.
    #[must_use]
    pub fn reversed(&self) -> FlowKey {
        FlowKey {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            proto: self.proto,
        }
    }

    /// Stable 64-bit digest used as the persisted key and the verdict-cache key.
    #[must_use]
    pub fn digest(&self) -> u64 {
        // FNV-1a over the canonical byte rendering. Stable across runs, unlike
        // the std hasher, which is what the store and the verdict cache need.
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut acc = OFFSET;
        let mut eat = |bytes: &[u8]| {
            for b in bytes {
                acc ^= u64::from(*b);
                acc = acc.wrapping_mul(PRIME);
            }
        };
        match self.src_ip {
            IpAddr::V4(ip) => eat(&ip.octets()),
            IpAddr::V6(ip) => eat(&ip.octets()),
        }
        match self.dst_ip {
            IpAddr::V4(ip) => eat(&ip.octets()),
            IpAddr::V6(ip) => eat(&ip.octets()),
        }
        eat(&self.src_port.to_be_bytes());
        eat(&self.dst_port.to_be_bytes());
        eat(&[self.proto.number().unwrap_or(0xff)]);
        acc
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} ({})",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.proto
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FlowKey {
        FlowKey::new(
            "192.168.1.100".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
            34567,
            443,
            Protocol::Tcp,
        )
    }

    #[test]
    fn reversal_is_involutive() {
        assert_eq!(key().reversed().reversed(), key());
        assert_ne!(key().reversed(), key());
    }

    #[test]
    fn digest_is_stable_and_direction_sensitive() {
        assert_eq!(key().digest(), key().digest());
        assert_ne!(key().digest(), key().reversed().digest());
    }

    #[test]
    fn protocol_parsing() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("all".parse::<Protocol>().unwrap(), Protocol::Any);
        assert!("quic".parse::<Protocol>().is_err());
        assert!(Protocol::Udp.has_ports());
        assert!(!Protocol::Icmp.has_ports());
    }
}
