// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The in-process flow cache: a sharded map with inactivity expiry and a
//! capacity bound enforced on reap.

use crate::flow::Flow;
use dashmap::DashMap;
use net::FlowKey;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct FlowTable {
    flows: DashMap<FlowKey, Flow>,
    capacity: usize,
    timeout: Duration,
}

impl FlowTable {
    #[must_use]
    pub fn new(capacity: usize, timeout: Duration) -> FlowTable {
        FlowTable {
            flows: DashMap::new(),
            capacity: capacity.max(16),
            timeout,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.flows.len() as f64 / self.capacity as f64
    }

    /// Run `f` under the shard lock of an existing flow.
    pub fn with_flow<R>(&self, key: &FlowKey, f: impl FnOnce(&mut Flow) -> R) -> Option<R> {
        self.flows.get_mut(key).map(|mut entry| f(entry.value_mut()))
    }

    #[must_use]
    pub fn get(&self, key: &FlowKey) -> Option<Flow> {
        self.flows.get(key).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, flow: Flow) {
        self.flows.insert(flow.key, flow);
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Flow> {
        self.flows.remove(key).map(|(_, flow)| flow)
    }

    pub fn snapshot(&self) -> Vec<Flow> {
        self.flows.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Expire idle flows; when the table still exceeds capacity, the
    /// longest-idle flows go too. Returns the removed flows so the engine
    /// can drop their fast-path entries and persistence.
    pub fn reap(&self, now: Instant) -> Vec<Flow> {
        let mut removed = Vec::new();
        let expired: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|entry| entry.value().expired(now, self.timeout))
            .map(|entry| *entry.key())
            .collect();
        for key in expired {
            if let Some((_, flow)) = self.flows.remove(&key) {
                removed.push(flow);
            }
        }

        let over = self.flows.len().saturating_sub(self.capacity);
        if over > 0 {
            let mut by_idle: Vec<(Instant, FlowKey)> = self
                .flows
                .iter()
                .map(|entry| (entry.value().last_seen, *entry.key()))
                .collect();
            by_idle.sort_by_key(|(last_seen, _)| *last_seen);
            for (_, key) in by_idle.into_iter().take(over) {
                if let Some((_, flow)) = self.flows.remove(&key) {
                    removed.push(flow);
                }
            }
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), remaining = self.flows.len(), "flows reaped");
        }
        removed
    }
}

/// The reaper cadence adapts to table pressure: a busy table reaps twice as
/// often (floor 10 s), an idle one half as often (ceiling 5 min).
#[must_use]
pub fn adapt_interval(current: Duration, utilization: f64) -> Duration {
    const FLOOR: Duration = Duration::from_secs(10);
    const CEILING: Duration = Duration::from_secs(300);
    if utilization >= 0.75 {
        (current / 2).max(FLOOR)
    } else if utilization <= 0.25 {
        (current * 2).min(CEILING)
    } else {
        current
    }
}
