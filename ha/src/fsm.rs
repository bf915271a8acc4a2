// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The role state machine, free of I/O.

use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Replica,
}

/// What the node loop must do after feeding the FSM.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Transition {
    /// Claim the VIP and start announcing primary.
    Promote,
    /// Release the VIP and fall back to replica.
    Yield,
}

#[derive(Debug)]
pub struct RoleFsm {
    configured: Role,
    role: Role,
    priority: u8,
    failure_threshold: u32,
    missed: u32,
}

impl RoleFsm {
    #[must_use]
    pub fn new(configured: Role, priority: u8, failure_threshold: u32) -> RoleFsm {
        RoleFsm {
            configured,
            role: configured,
            priority,
            failure_threshold: failure_threshold.max(1),
            missed: 0,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Does this node currently announce itself as primary (and should it
    /// hold the VIP)?
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    /// A heartbeat interval elapsed without hearing the peer.
    pub fn on_missed(&mut self) -> Option<Transition> {
        self.missed = self.missed.saturating_add(1);
        if self.role == Role::Replica && self.missed >= self.failure_threshold {
            info!(
                missed = self.missed,
                "peer silent past threshold, promoting"
            );
            self.role = Role::Primary;
            return Some(Transition::Promote);
        }
        None
    }

    /// A valid peer heartbeat arrived. Higher priority wins with
    /// preemption; ties resolve to the configured primary so exactly one
    /// node ends up holding the VIP.
    pub fn on_heartbeat(&mut self, peer_role: Role, peer_priority: u8) -> Option<Transition> {
        self.missed = 0;
        match (self.role, peer_role) {
            // Split-brain or preemption: both primary, priority decides.
            (Role::Primary, Role::Primary) => {
                let peer_wins = peer_priority > self.priority
                    || (peer_priority == self.priority && self.configured == Role::Replica);
                if peer_wins {
                    info!(
                        peer_priority,
                        our_priority = self.priority,
                        "yielding primary to higher-priority peer"
                    );
                    self.role = Role::Replica;
                    return Some(Transition::Yield);
                }
                None
            }
            // Peer is a replica with higher priority: it will preempt; we
            // keep primary until it actually announces, nothing to do.
            (Role::Primary, Role::Replica) => None,
            // We are replica and outrank the announcing primary: preempt.
            (Role::Replica, _) if self.priority > peer_priority => {
                info!(
                    peer_priority,
                    our_priority = self.priority,
                    "preempting lower-priority primary"
                );
                self.role = Role::Primary;
                Some(Transition::Promote)
            }
            (Role::Replica, _) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn replica_promotes_after_threshold_misses() {
        let mut fsm = RoleFsm::new(Role::Replica, 150, 3);
        assert_eq!(fsm.on_missed(), None);
        assert_eq!(fsm.on_missed(), None);
        assert_eq!(fsm.on_missed(), Some(Transition::Promote));
        assert!(fsm.is_primary());
        // Further misses change nothing.
        assert_eq!(fsm.on_missed(), None);
    }

    #[test]
    fn primary_never_self_demotes_on_silence() {
        let mut fsm = RoleFsm::new(Role::Primary, 50, 3);
        for _ in 0..10 {
            assert_eq!(fsm.on_missed(), None);
        }
        assert!(fsm.is_primary());
    }

    #[test]
    fn split_brain_resolves_by_priority_on_restoration() {
        // The partition scenario: configured primary at 50, replica at 150
        // promoted itself during the partition. Heartbeats return.
        let mut old_primary = RoleFsm::new(Role::Primary, 50, 3);
        let mut promoted = RoleFsm::new(Role::Replica, 150, 3);
        promoted.on_missed();
        promoted.on_missed();
        assert_eq!(promoted.on_missed(), Some(Transition::Promote));

        // Old primary hears the promoted peer: yields (150 > 50).
        assert_eq!(
            old_primary.on_heartbeat(Role::Primary, 150),
            Some(Transition::Yield)
        );
        // Promoted node hears the yielded peer and keeps primary.
        assert_eq!(promoted.on_heartbeat(Role::Replica, 50), None);
        assert!(promoted.is_primary());
        assert!(!old_primary.is_primary());
    }

    #[test]
    fn higher_priority_replica_preempts() {
        let mut replica = RoleFsm::new(Role::Replica, 200, 3);
        assert_eq!(
            replica.on_heartbeat(Role::Primary, 100),
            Some(Transition::Promote)
        );
    }

    #[test]
    fn equal_priority_tie_resolves_to_configured_primary() {
        let mut a = RoleFsm::new(Role::Primary, 100, 3);
        let mut b = RoleFsm::new(Role::Replica, 100, 3);
        b.on_missed();
        b.on_missed();
        b.on_missed();
        assert!(b.is_primary());

        // Both primary at equal priority: the configured replica yields.
        assert_eq!(b.on_heartbeat(Role::Primary, 100), Some(Transition::Yield));
        assert_eq!(a.on_heartbeat(Role::Primary, 100), None);
    }

    #[test]
    fn heartbeat_resets_miss_counter() {
        let mut fsm = RoleFsm::new(Role::Replica, 150, 3);
        fsm.on_missed();
        fsm.on_missed();
        fsm.on_heartbeat(Role::Primary, 50);
        assert_eq!(fsm.on_missed(), None);
        assert_eq!(fsm.on_missed(), None);
        assert_eq!(fsm.on_missed(), Some(Transition::Promote));
    }
}
