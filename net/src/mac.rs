// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A 48-bit ethernet hardware address.
///
/// Stored canonically; parses and renders the usual lower-case colon form.
#[derive(Copy, Clone, Debug, Default, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[repr(transparent)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    #[must_use]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// True for the all-ones broadcast address.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }

    /// True if the group bit is set (multicast / broadcast).
    #[must_use]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// True for 00:00:00:00:00:00, which no real device carries.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, thiserror::Error)]
pub enum InvalidMacAddr {
    #[error("mac address {0} is not six colon-separated hex octets")]
    Malformed(String),
}

impl FromStr for MacAddr {
    type Err = InvalidMacAddr;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = value.split([':', '-']);
        for octet in &mut octets {
            let part = parts
                .next()
                .ok_or_else(|| InvalidMacAddr::Malformed(value.to_string()))?;
            if part.len() != 2 {
                return Err(InvalidMacAddr::Malformed(value.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| InvalidMacAddr::Malformed(value.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(InvalidMacAddr::Malformed(value.to_string()));
        }
        Ok(MacAddr(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = InvalidMacAddr;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(value: MacAddr) -> Self {
        value.to_string()
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(value: [u8; 6]) -> Self {
        MacAddr(value)
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:01".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:01");
        let dashed: MacAddr = "AA-BB-CC-DD-EE-01".parse().unwrap();
        assert_eq!(mac, dashed);
    }

    #[test]
    fn rejects_malformed() {
        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:01:02".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:zz".parse::<MacAddr>().is_err());
        assert!("aabb.ccdd.ee01".parse::<MacAddr>().is_err());
    }

    #[test]
    fn classification() {
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(MacAddr::BROADCAST.is_multicast());
        assert!(MacAddr([0; 6]).is_zero());
        assert!(!"aa:bb:cc:dd:ee:01".parse::<MacAddr>().unwrap().is_multicast());
    }
}
