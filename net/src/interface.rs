// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt::{Display, Formatter};
use std::num::NonZero;

const MAX_INTERFACE_NAME_LEN: usize = 16;

/// A string which has been checked to be a legal linux network interface name.
///
/// Legal network interface names are composed only of alphanumeric ASCII characters, `.`, `-`, and
/// `_` and which are terminated with a null (`\0`) character.
///
/// The maximum legal length of an `InterfaceName` is 16 bytes (including the terminating null).
/// Thus, the _effective_ maximum length is 15 bytes (not characters).
#[repr(transparent)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct InterfaceName(String);

impl Display for InterfaceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl InterfaceName {
    /// The maximum legal length of a linux network interface name (including the trailing NUL)
    pub const MAX_LEN: usize = MAX_INTERFACE_NAME_LEN;
}

/// Errors which may occur when mapping a general `String` into an `InterfaceName`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, thiserror::Error)]
pub enum IllegalInterfaceName {
    #[error("interface name must be at least one character")]
    Empty,
    #[error("name must not be . or ..")]
    MustNotIncludeOnlyDots(String),
    #[error("interface name {0} is too long")]
    TooLong(String),
    #[error("interface name {0} contains interior null characters")]
    InteriorNull(String),
    #[error("interface name {0} is not ascii")]
    NotAscii(String),
    #[error(
        "interface name {0} contains illegal characters (only alphanumeric ASCII and .-_ are permitted)"
    )]
    IllegalCharacters(String),
}

impl TryFrom<String> for InterfaceName {
    type Error = IllegalInterfaceName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        const LEGAL_PUNCT: [char; 3] = ['.', '-', '_'];
        if value.is_empty() {
            return Err(IllegalInterfaceName::Empty);
        }
        if value == "." || value == ".." {
            return Err(IllegalInterfaceName::MustNotIncludeOnlyDots(value));
        }
        if value.contains('\0') {
            return Err(IllegalInterfaceName::InteriorNull(value));
        }
        if !value.is_ascii() {
            return Err(IllegalInterfaceName::NotAscii(value));
        }
        if !value
            .chars()
            .all(|c| c.is_alphanumeric() || LEGAL_PUNCT.contains(&c))
        {
            return Err(IllegalInterfaceName::IllegalCharacters(value));
        }
        if value.len() >= InterfaceName::MAX_LEN {
            return Err(IllegalInterfaceName::TooLong(value));
        }
        Ok(InterfaceName(value))
    }
}

impl TryFrom<&str> for InterfaceName {
    type Error = IllegalInterfaceName;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

impl From<InterfaceName> for String {
    fn from(value: InterfaceName) -> Self {
        value.0.as_str().to_string()
    }
}

impl AsRef<str> for InterfaceName {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

/// The administrative state of a network interface: what we intend, not what the kernel reports.
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AdminState {
    /// The interface is set to down
    Down = 0,
    /// The interface is set to the up state.
    Up = 1,
}

/// The MTU of a network interface.
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
#[repr(transparent)]
pub struct Mtu(NonZero<u32>);

impl Mtu {
    pub(crate) const MIN_U32: u32 = 576; // minimum IPv4 datagram a host must accept
    pub(crate) const MAX_U32: u32 = 65535;
    pub(crate) const DEFAULT_U32: u32 = 1500;

    /// The minimum MTU flywall will configure.
    pub const MIN: Mtu = Mtu(NonZero::new(Self::MIN_U32).unwrap());
    /// The max legal MTU is 2^16 - 1 bytes.
    pub const MAX: Mtu = Mtu(NonZero::new(Self::MAX_U32).unwrap());
    /// The typical MTU for an ethernet interface
    pub const DEFAULT: Mtu = Mtu(NonZero::new(Self::DEFAULT_U32).unwrap());

    /// Return the `Mtu` represented as a u32
    #[must_use]
    pub fn to_u32(&self) -> u32 {
        self.0.get()
    }
}

impl Default for Mtu {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u32> for Mtu {
    type Error = MtuError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if !(Self::MIN_U32..=Self::MAX_U32).contains(&value) {
            return Err(MtuError::InvalidMtu(value));
        }
        Ok(Mtu(NonZero::new(value).unwrap_or_else(|| unreachable!())))
    }
}

impl From<Mtu> for u32 {
    fn from(value: Mtu) -> Self {
        value.0.get()
    }
}

impl Display for Mtu {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, thiserror::Error)]
pub enum MtuError {
    #[error("mtu {0} is not within the valid range of {min} to {max}", min = Mtu::MIN_U32, max = Mtu::MAX_U32)]
    InvalidMtu(u32),
}

/// An IEEE 802.1Q VLAN id, checked to lie in [1, 4094].
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
#[repr(transparent)]
pub struct VlanId(NonZero<u16>);

impl VlanId {
    pub const MIN_U16: u16 = 1;
    /// 4095 is reserved by 802.1Q.
    pub const MAX_U16: u16 = 4094;

    #[must_use]
    pub fn to_u16(&self) -> u16 {
        self.0.get()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, thiserror::Error)]
pub enum InvalidVlanId {
    #[error("vlan id {0} is not within the valid range of 1 to 4094")]
    OutOfRange(u16),
}

impl TryFrom<u16> for VlanId {
    type Error = InvalidVlanId;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if !(Self::MIN_U16..=Self::MAX_U16).contains(&value) {
            return Err(InvalidVlanId::OutOfRange(value));
        }
        Ok(VlanId(NonZero::new(value).unwrap_or_else(|| unreachable!())))
    }
}

impl From<VlanId> for u16 {
    fn from(value: VlanId) -> Self {
        value.0.get()
    }
}

impl Display for VlanId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

/// A linux policy-routing table id.
#[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RouteTableId(u32);

impl RouteTableId {
    #[must_use]
    pub fn to_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for RouteTableId {
    fn from(value: u32) -> Self {
        RouteTableId(value)
    }
}

impl From<RouteTableId> for u32 {
    fn from(value: RouteTableId) -> Self {
        value.0
    }
}

impl Display for RouteTableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_name_rules() {
        assert!(InterfaceName::try_from("eth0").is_ok());
        assert!(InterfaceName::try_from("wan0.100").is_ok());
        assert!(InterfaceName::try_from("wg_mgmt-1").is_ok());
        assert!(InterfaceName::try_from("").is_err());
        assert!(InterfaceName::try_from(".").is_err());
        assert!(InterfaceName::try_from("..").is_err());
        assert!(InterfaceName::try_from("eth0/1").is_err());
        assert!(InterfaceName::try_from("有线").is_err());
        // 15 bytes is the effective maximum
        assert!(InterfaceName::try_from("abcdefghijklmno").is_ok());
        assert!(InterfaceName::try_from("abcdefghijklmnop").is_err());
    }

    #[test]
    fn vlan_id_bounds() {
        assert!(VlanId::try_from(0).is_err());
        assert!(VlanId::try_from(1).is_ok());
        assert!(VlanId::try_from(4094).is_ok());
        assert!(VlanId::try_from(4095).is_err());
    }

    #[test]
    fn mtu_bounds() {
        assert!(Mtu::try_from(575).is_err());
        assert_eq!(Mtu::try_from(1500).unwrap(), Mtu::DEFAULT);
        assert!(Mtu::try_from(65535).is_ok());
    }
}
