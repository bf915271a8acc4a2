// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Reconcile the intended state of the linux interfaces with the observed
//! state.
//!
//! Desired links come from the validated model; observation is one netlink
//! dump; the plan is the minimal op sequence that converges, ordered so
//! dependencies (vlan parents, bond and bridge members) exist before their
//! dependents and are torn down after them. Re-running a converged plan is a
//! no-op.

pub mod observe;
pub mod plan;
pub mod reconciler;
pub mod spec;

pub use observe::{LinkObservation, ObservedLink};
pub use plan::{LinkOp, LinkPlan};
pub use reconciler::LinkReconciler;
pub use spec::{DesiredLinks, LinkKind, LinkSpec};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("netlink: {0}")]
    Netlink(#[from] rtnetlink::Error),
    #[error("netlink connection: {0}")]
    Connection(#[from] std::io::Error),
    #[error("interface {0} not found in kernel")]
    NotFound(String),
}

impl LinkError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        "kernel"
    }
}
