// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The per-member health state machine.

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    Up,
    /// Probes flapping or confidence not yet earned.
    Degraded,
    Down,
}

/// Consecutive-outcome tracker. Fresh members start degraded; they must
/// earn `up_threshold` straight successes to be up, and `down_threshold`
/// straight failures to be declared down. A single failure from `Up` drops
/// to degraded immediately so selection reacts before full loss.
#[derive(Debug)]
pub struct HealthTracker {
    state: MemberState,
    consecutive_ok: u32,
    consecutive_fail: u32,
    up_threshold: u32,
    down_threshold: u32,
}

impl HealthTracker {
    #[must_use]
    pub fn new(up_threshold: u32, down_threshold: u32) -> HealthTracker {
        HealthTracker {
            state: MemberState::Degraded,
            consecutive_ok: 0,
            consecutive_fail: 0,
            up_threshold: up_threshold.max(1),
            down_threshold: down_threshold.max(1),
        }
    }

    #[must_use]
    pub fn state(&self) -> MemberState {
        self.state
    }

    /// Feed one probe outcome; `Some(new_state)` on transition.
    pub fn record(&mut self, ok: bool) -> Option<MemberState> {
        if ok {
            self.consecutive_ok += 1;
            self.consecutive_fail = 0;
        } else {
            self.consecutive_fail += 1;
            self.consecutive_ok = 0;
        }

        let next = match self.state {
            MemberState::Up if !ok => {
                if self.consecutive_fail >= self.down_threshold {
                    MemberState::Down
                } else {
                    MemberState::Degraded
                }
            }
            MemberState::Degraded if self.consecutive_fail >= self.down_threshold => {
                MemberState::Down
            }
            MemberState::Degraded | MemberState::Down
                if self.consecutive_ok >= self.up_threshold =>
            {
                MemberState::Up
            }
            current => current,
        };

        (next != self.state).then(|| {
            self.state = next;
            next
        })
    }
}
