// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::num::NonZero;
use std::str::FromStr;

/// A transport-layer port. Zero is not a routable port and is rejected.
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
#[repr(transparent)]
pub struct Port(NonZero<u16>);

impl Port {
    #[must_use]
    pub fn to_u16(&self) -> u16 {
        self.0.get()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, thiserror::Error)]
pub enum InvalidPort {
    #[error("port must lie in [1, 65535]")]
    Zero,
    #[error("port range start {0} exceeds end {1}")]
    RangeInverted(u16, u16),
    #[error("malformed port or port range: {0}")]
    Malformed(String),
}

impl TryFrom<u16> for Port {
    type Error = InvalidPort;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        NonZero::new(value).map(Port).ok_or(InvalidPort::Zero)
    }
}

impl From<Port> for u16 {
    fn from(value: Port) -> Self {
        value.0.get()
    }
}

impl Display for Port {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

/// An inclusive port range. A single port is a range of one.
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    start: Port,
    end: Port,
}

impl PortRange {
    /// # Errors
    ///
    /// Fails if `start > end`.
    pub fn new(start: Port, end: Port) -> Result<Self, InvalidPort> {
        if start > end {
            return Err(InvalidPort::RangeInverted(start.to_u16(), end.to_u16()));
        }
        Ok(PortRange { start, end })
    }

    #[must_use]
    pub fn single(port: Port) -> Self {
        PortRange {
            start: port,
            end: port,
        }
    }

    #[must_use]
    pub fn start(&self) -> Port {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> Port {
        self.end
    }

    #[must_use]
    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    #[must_use]
    pub fn contains(&self, port: Port) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Parses `443` or `8000-8080`.
impl FromStr for PortRange {
    type Err = InvalidPort;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parse_one = |s: &str| -> Result<Port, InvalidPort> {
            let raw: u16 = s
                .trim()
                .parse()
                .map_err(|_| InvalidPort::Malformed(value.to_string()))?;
            Port::try_from(raw)
        };
        match value.split_once('-') {
            Some((lo, hi)) => PortRange::new(parse_one(lo)?, parse_one(hi)?),
            None => Ok(PortRange::single(parse_one(value)?)),
        }
    }
}

impl TryFrom<String> for PortRange {
    type Error = InvalidPort;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortRange> for String {
    fn from(value: PortRange) -> Self {
        value.to_string()
    }
}

impl Display for PortRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_and_range() {
        let single: PortRange = "443".parse().unwrap();
        assert!(single.is_single());
        assert_eq!(single.start().to_u16(), 443);

        let range: PortRange = "8000-8080".parse().unwrap();
        assert!(!range.is_single());
        assert!(range.contains(Port::try_from(8042).unwrap()));
        assert!(!range.contains(Port::try_from(8081).unwrap()));
    }

    #[test]
    fn rejects_bad_ranges() {
        assert!("0".parse::<PortRange>().is_err());
        assert!("80-22".parse::<PortRange>().is_err());
        assert!("65536".parse::<PortRange>().is_err());
        assert!("http".parse::<PortRange>().is_err());
    }

    #[test]
    fn round_trips_display() {
        for text in ["22", "1-65535", "8000-8080"] {
            let range: PortRange = text.parse().unwrap();
            assert_eq!(range.to_string(), text);
        }
    }
}
