// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The reconciliation contract shared by every subsystem the supervisor
//! drives (links, firewall, DHCP, DNS, WireGuard).
//!
//! Each reconciler computes its desired state from the validated model, diffs
//! it against what it observes, applies the minimal change set, and hands the
//! supervisor a reverse plan so a failed apply can be unwound step by step.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// How far a single resource got during an apply.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ResourceOutcome {
    /// Converged to the desired state.
    Converged,
    /// Already matched; nothing was done.
    Unchanged,
    /// The resource had to be destroyed and re-created (e.g. a bond mode
    /// change); callers surface this in the diff so operators expect the
    /// bounce.
    Recreated,
    /// This resource failed; the rest of the subsystem proceeded.
    Degraded { reason: String },
}

/// Per-subsystem apply report, aggregated by the supervisor into the RPC
/// apply result.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ApplyReport {
    pub subsystem: String,
    pub outcomes: Vec<(String, ResourceOutcome)>,
}

impl ApplyReport {
    #[must_use]
    pub fn new(subsystem: &str) -> Self {
        ApplyReport {
            subsystem: subsystem.to_string(),
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, resource: impl Into<String>, outcome: ResourceOutcome) {
        self.outcomes.push((resource.into(), outcome));
    }

    #[must_use]
    pub fn degraded(&self) -> impl Iterator<Item = &(String, ResourceOutcome)> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ResourceOutcome::Degraded { .. }))
    }

    /// True when every resource converged or was already in shape.
    #[must_use]
    pub fn clean(&self) -> bool {
        self.degraded().next().is_none()
    }

    pub fn merge(&mut self, other: ApplyReport) {
        self.outcomes.extend(other.outcomes);
    }
}

/// A reconciler over one subsystem.
///
/// `Desired` is computed from the validated model; `Plan` is the minimal
/// change set between desired and observed. Applying a plan yields the
/// reverse plan that undoes it. The component set is fixed and small, so this
/// one abstraction is all the polymorphism the supervisor needs.
#[async_trait]
pub trait Reconciler: Send + Sync {
    type Desired: Send + Sync;
    type Plan: Send + Debug;
    type Error: std::error::Error + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    /// Observe current state and compute the steps to reach `desired`.
    ///
    /// # Contract
    ///
    /// Must not mutate external state. An empty plan means the subsystem is
    /// already converged, and `apply` on it must be a no-op.
    async fn diff(&self, desired: &Self::Desired) -> Result<Self::Plan, Self::Error>;

    /// Execute the plan. Returns the reverse plan for rollback along with the
    /// per-resource report.
    async fn apply(
        &self,
        plan: Self::Plan,
    ) -> Result<(Self::Plan, ApplyReport), Self::Error>;

    /// Undo a previously applied plan. Reconcilers are idempotent, so a
    /// partially rolled back subsystem converges on the next apply.
    async fn rollback(&self, reverse: Self::Plan) -> Result<(), Self::Error>;
}
