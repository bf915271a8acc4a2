// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Blocklist storage as a reversed-label prefix set.
//!
//! `ads.example.com` is stored as `com.example.ads`; a query matches when
//! any label-prefix of its reversed name is present, which is exactly
//! wildcard semantics (`*.ads.example.com` is covered by the same entry).

use config::BlocklistFormat;
use std::collections::HashSet;

#[derive(Clone, Debug, Default)]
pub struct BlockSet {
    blocked: HashSet<String>,
    allowed: HashSet<String>,
}

/// Reverse the labels of a domain: `ads.example.com` -> `com.example.ads`.
fn reverse_labels(domain: &str) -> Option<String> {
    let trimmed = domain.trim().trim_end_matches('.').to_lowercase();
    if trimmed.is_empty() || trimmed.contains(['/', ' ']) {
        return None;
    }
    let labels: Vec<&str> = trimmed.split('.').filter(|l| !l.is_empty()).collect();
    if labels.is_empty() {
        return None;
    }
    Some(labels.into_iter().rev().collect::<Vec<_>>().join("."))
}

fn matches_set(set: &HashSet<String>, reversed: &str) -> bool {
    // Check every label-prefix of the reversed name: com, com.example, ...
    let mut end = 0;
    let bytes = reversed.as_bytes();
    while end < bytes.len() {
        end = match reversed[end..].find('.') {
            Some(dot) => end + dot,
            None => bytes.len(),
        };
        if set.contains(&reversed[..end]) {
            return true;
        }
        end += 1;
    }
    false
}

impl BlockSet {
    #[must_use]
    pub fn new(allowlist: &[String]) -> BlockSet {
        BlockSet {
            blocked: HashSet::new(),
            allowed: allowlist.iter().filter_map(|d| reverse_labels(d)).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }

    /// Ingest one fetched list body.
    pub fn ingest(&mut self, body: &str, format: BlocklistFormat) -> usize {
        let before = self.blocked.len();
        for line in body.lines() {
            if let Some(domain) = extract_domain(line, format) {
                if let Some(reversed) = reverse_labels(&domain) {
                    self.blocked.insert(reversed);
                }
            }
        }
        self.blocked.len() - before
    }

    pub fn insert(&mut self, domain: &str) {
        if let Some(reversed) = reverse_labels(domain) {
            self.blocked.insert(reversed);
        }
    }

    /// Allowlist overrides block membership.
    #[must_use]
    pub fn is_blocked(&self, name: &str) -> bool {
        let Some(reversed) = reverse_labels(name) else {
            return false;
        };
        if matches_set(&self.allowed, &reversed) {
            return false;
        }
        matches_set(&self.blocked, &reversed)
    }
}

fn extract_domain(line: &str, format: BlocklistFormat) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        return None;
    }
    match format {
        BlocklistFormat::Domains => Some(line.to_string()),
        BlocklistFormat::Hosts => {
            let mut fields = line.split_whitespace();
            let address = fields.next()?;
            if !matches!(address, "0.0.0.0" | "127.0.0.1" | "::" | "::1") {
                return None;
            }
            let domain = fields.next()?;
            (domain != "localhost").then(|| domain.to_string())
        }
        BlocklistFormat::Adblock => {
            let body = line.strip_prefix("||")?;
            let domain = body.split(['^', '/', '$']).next()?;
            (!domain.is_empty()).then(|| domain.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn hosts_format_parses_blockers_only() {
        let mut set = BlockSet::default();
        let added = set.ingest(
            "# comment\n0.0.0.0 ads.example.com\n127.0.0.1 tracker.example.net\n192.168.1.5 myhost\n0.0.0.0 localhost\n",
            BlocklistFormat::Hosts,
        );
        assert_eq!(added, 2);
        assert!(set.is_blocked("ads.example.com"));
        assert!(!set.is_blocked("myhost"));
    }

    #[test]
    fn adblock_format_strips_separators() {
        let mut set = BlockSet::default();
        set.ingest(
            "! adblock comment\n||doubleclick.example^\n||metrics.example.org/path\n",
            BlocklistFormat::Adblock,
        );
        assert!(set.is_blocked("doubleclick.example"));
        assert!(set.is_blocked("metrics.example.org"));
    }

    #[test]
    fn wildcard_semantics_via_prefix() {
        let mut set = BlockSet::default();
        set.ingest("ads.example.com\n", BlocklistFormat::Domains);
        assert!(set.is_blocked("ads.example.com"));
        assert!(set.is_blocked("sub.ads.example.com"));
        assert!(set.is_blocked("deep.sub.ads.example.com."));
        assert!(!set.is_blocked("example.com"));
        assert!(!set.is_blocked("badads.example.com"));
    }

    #[test]
    fn allowlist_overrides() {
        let mut set = BlockSet::new(&["good.ads.example.com".to_string()]);
        set.ingest("ads.example.com\n", BlocklistFormat::Domains);
        assert!(set.is_blocked("ads.example.com"));
        assert!(!set.is_blocked("good.ads.example.com"));
        assert!(!set.is_blocked("x.good.ads.example.com"));
        assert!(set.is_blocked("evil.ads.example.com"));
    }
}
