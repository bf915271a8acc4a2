// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! First-packet signature matching with a hard time budget. A budget
//! overrun fails open: the packet is allowed and the overrun logged.

use regex::bytes::Regex;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PatternAction {
    Drop,
    /// Allow but flag the flow MONITORED.
    Monitor,
}

#[derive(Debug)]
enum Matcher {
    Literal(Vec<u8>),
    Regex(Regex),
}

#[derive(Debug)]
pub struct Signature {
    pub name: String,
    matcher: Matcher,
    pub action: PatternAction,
}

impl Signature {
    pub fn literal(name: &str, needle: &[u8], action: PatternAction) -> Signature {
        Signature {
            name: name.to_string(),
            matcher: Matcher::Literal(needle.to_vec()),
            action,
        }
    }

    /// # Errors
    ///
    /// Propagates regex compilation failures; signatures come from trusted
    /// config, not the wire.
    pub fn regex(name: &str, pattern: &str, action: PatternAction) -> Result<Signature, regex::Error> {
        Ok(Signature {
            name: name.to_string(),
            matcher: Matcher::Regex(Regex::new(pattern)?),
            action,
        })
    }

    fn matches(&self, payload: &[u8]) -> bool {
        match &self.matcher {
            Matcher::Literal(needle) => {
                !needle.is_empty()
                    && payload
                        .windows(needle.len())
                        .any(|window| window == needle.as_slice())
            }
            Matcher::Regex(regex) => regex.is_match(payload),
        }
    }
}

#[derive(Debug, Default)]
pub struct PatternSet {
    signatures: Vec<Signature>,
    budget: Duration,
}

impl PatternSet {
    #[must_use]
    pub fn new(signatures: Vec<Signature>, budget: Duration) -> PatternSet {
        PatternSet { signatures, budget }
    }

    #[must_use]
    pub fn with_default_budget(signatures: Vec<Signature>) -> PatternSet {
        PatternSet::new(signatures, Duration::from_millis(10))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// First matching signature wins. The budget is checked between
    /// signatures; running out means a `None` (allow) plus a log line.
    #[must_use]
    pub fn scan(&self, payload: &[u8]) -> Option<(&str, PatternAction)> {
        let started = Instant::now();
        for signature in &self.signatures {
            if started.elapsed() >= self.budget {
                warn!(
                    budget_ms = self.budget.as_millis() as u64,
                    "signature scan over budget, failing open"
                );
                return None;
            }
            if signature.matches(payload) {
                return Some((signature.name.as_str(), signature.action));
            }
        }
        None
    }
}
