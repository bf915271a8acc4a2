// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

use std::fmt::{Display, Formatter};

/// The fixed set of buckets in the state file.
///
/// A closed enum rather than free-form strings so a typo'd bucket cannot
/// silently shear data into its own namespace.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Bucket {
    DhcpLeases,
    Flows,
    IpSets,
    Users,
    Devices,
    Audit,
    HaState,
    Revisions,
    Staged,
}

impl Bucket {
    pub const ALL: [Bucket; 9] = [
        Bucket::DhcpLeases,
        Bucket::Flows,
        Bucket::IpSets,
        Bucket::Users,
        Bucket::Devices,
        Bucket::Audit,
        Bucket::HaState,
        Bucket::Revisions,
        Bucket::Staged,
    ];

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Bucket::DhcpLeases => "dhcp_leases",
            Bucket::Flows => "flows",
            Bucket::IpSets => "ipsets",
            Bucket::Users => "users",
            Bucket::Devices => "devices",
            Bucket::Audit => "audit",
            Bucket::HaState => "ha_state",
            Bucket::Revisions => "revisions",
            Bucket::Staged => "staged",
        }
    }

    /// Full tree key: `<bucket>/<key>`.
    pub(crate) fn full_key(&self, key: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.name().len() + 1 + key.len());
        out.extend_from_slice(self.name().as_bytes());
        out.push(b'/');
        out.extend_from_slice(key.as_bytes());
        out
    }

    pub(crate) fn prefix_len(&self) -> usize {
        self.name().len() + 1
    }
}

impl Display for Bucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_names_are_distinct_prefixes() {
        // No bucket name may be a prefix of another up to the separator,
        // otherwise scans would bleed across buckets.
        for a in Bucket::ALL {
            for b in Bucket::ALL {
                if a != b {
                    assert!(!a.full_key("").starts_with(b.full_key("").as_slice()));
                }
            }
        }
    }
}
