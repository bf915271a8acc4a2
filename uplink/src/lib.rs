// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! WAN uplink groups: per-member health checking and failover selection.
//!
//! Each member runs its probes on the group's interval; consecutive
//! outcomes drive the `up | degraded | down` state machine and the group
//! always prefers its highest-priority `up` member.

pub mod health;
pub mod probe;

pub use health::{HealthTracker, MemberState};
pub use probe::{HttpProbe, PingProbe, Probe};

use config::{UplinkGroupConfig, ValidModel};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemberStatus {
    pub interface: String,
    pub priority: u32,
    pub weight: u32,
    pub state: MemberState,
    /// Operator override: a disabled member never gets selected.
    pub enabled: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupStatus {
    pub name: String,
    pub members: Vec<MemberStatus>,
    pub active: Option<String>,
}

/// Change events for the API's `health` topic.
#[derive(Clone, Debug)]
pub struct UplinkEvent {
    pub group: String,
    pub interface: String,
    pub state: MemberState,
}

struct MemberRuntime {
    status: MemberStatus,
    tracker: HealthTracker,
    probes: Vec<Arc<dyn Probe>>,
}

struct GroupRuntime {
    config: UplinkGroupConfig,
    members: Vec<MemberRuntime>,
}

pub struct UplinkManager {
    groups: RwLock<Vec<GroupRuntime>>,
    events: broadcast::Sender<UplinkEvent>,
}

impl UplinkManager {
    #[must_use]
    pub fn from_model(model: &ValidModel) -> Arc<UplinkManager> {
        let (events, _) = broadcast::channel(64);
        let groups = model
            .model()
            .uplink_groups
            .iter()
            .map(|config| GroupRuntime {
                members: config
                    .members
                    .iter()
                    .map(|member| MemberRuntime {
                        status: MemberStatus {
                            interface: member.interface.clone(),
                            priority: member.priority,
                            weight: member.weight,
                            state: MemberState::Degraded,
                            enabled: true,
                        },
                        tracker: HealthTracker::new(
                            config.health.up_threshold,
                            config.health.down_threshold,
                        ),
                        probes: probe::build_probes(&config.health),
                    })
                    .collect(),
                config: config.clone(),
            })
            .collect();
        Arc::new(UplinkManager {
            groups: RwLock::new(groups),
            events,
        })
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<UplinkEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn status(&self) -> Vec<GroupStatus> {
        self.groups
            .read()
            .iter()
            .map(|group| GroupStatus {
                name: group.config.name.clone(),
                members: group.members.iter().map(|m| m.status.clone()).collect(),
                active: select_active(&group.members).map(str::to_string),
            })
            .collect()
    }

    /// Operator toggle; a disabled member is skipped by selection until
    /// re-enabled.
    pub fn toggle(&self, group: &str, interface: &str, enabled: bool) -> bool {
        let mut groups = self.groups.write();
        for g in groups.iter_mut() {
            if g.config.name == group {
                for member in &mut g.members {
                    if member.status.interface == interface {
                        member.status.enabled = enabled;
                        info!(group, interface, enabled, "uplink member toggled");
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Run every member's probes once and feed the state machine. Split out
    /// of the loop so RPC `uplinks test` and the tests drive it directly.
    pub async fn check_round(&self) {
        // Probe outside the lock; apply outcomes after.
        let mut work = Vec::new();
        {
            let groups = self.groups.read();
            for (gi, group) in groups.iter().enumerate() {
                for (mi, member) in group.members.iter().enumerate() {
                    work.push((gi, mi, member.probes.clone(), group.config.name.clone(), member.status.interface.clone()));
                }
            }
        }

        for (gi, mi, probes, group_name, interface) in work {
            let mut ok = !probes.is_empty();
            for probe in &probes {
                if !probe.check().await {
                    ok = false;
                    break;
                }
            }
            let transition = {
                let mut groups = self.groups.write();
                let member = &mut groups[gi].members[mi];
                let transition = member.tracker.record(ok);
                if let Some(state) = transition {
                    member.status.state = state;
                }
                transition
            };
            if let Some(state) = transition {
                info!(group = %group_name, interface = %interface, ?state, "uplink state change");
                let _ = self.events.send(UplinkEvent {
                    group: group_name,
                    interface,
                    state,
                });
            } else {
                debug!(interface, ok, "uplink probe");
            }
        }
    }

    /// The periodic loop; interval comes from each group's config, so the
    /// tick is the minimum across groups.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = {
            let groups = self.groups.read();
            groups
                .iter()
                .map(|g| g.config.health.interval)
                .min()
                .unwrap_or(5)
        };
        let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_round().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

/// Highest-priority enabled member that is up; a degraded one beats
/// nothing.
fn select_active(members: &[MemberRuntime]) -> Option<&str> {
    let pick = |state: MemberState| {
        members
            .iter()
            .filter(|m| m.status.enabled && m.status.state == state)
            .min_by_key(|m| m.status.priority)
            .map(|m| m.status.interface.as_str())
    };
    pick(MemberState::Up).or_else(|| pick(MemberState::Degraded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeProbe(Arc<AtomicBool>);

    #[async_trait]
    impl Probe for FakeProbe {
        async fn check(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn manager_with_fakes() -> (Arc<UplinkManager>, Arc<AtomicBool>, Arc<AtomicBool>) {
        let model = config::validate(
            config::from_yaml_str(
                r"
interface:
  - name: wan0
    kind: physical
  - name: wan1
    kind: physical
uplink_group:
  - name: internet
    members:
      - interface: wan0
        priority: 10
      - interface: wan1
        priority: 20
    health:
      interval: 1
      up_threshold: 2
      down_threshold: 2
",
            )
            .unwrap(),
        )
        .unwrap();
        let manager = UplinkManager::from_model(&model);
        let primary_ok = Arc::new(AtomicBool::new(true));
        let backup_ok = Arc::new(AtomicBool::new(true));
        {
            let mut groups = manager.groups.write();
            groups[0].members[0].probes =
                vec![Arc::new(FakeProbe(Arc::clone(&primary_ok)))];
            groups[0].members[1].probes = vec![Arc::new(FakeProbe(Arc::clone(&backup_ok)))];
        }
        (manager, primary_ok, backup_ok)
    }

    #[tokio::test]
    async fn failover_to_lower_priority_member() {
        let (manager, primary_ok, _backup_ok) = manager_with_fakes();

        // Two good rounds bring both up; wan0 wins on priority.
        manager.check_round().await;
        manager.check_round().await;
        assert_eq!(manager.status()[0].active.as_deref(), Some("wan0"));

        // wan0 starts failing: one bad round degrades, two take it down.
        primary_ok.store(false, Ordering::SeqCst);
        manager.check_round().await;
        manager.check_round().await;
        let status = &manager.status()[0];
        assert_eq!(status.members[0].state, MemberState::Down);
        assert_eq!(status.active.as_deref(), Some("wan1"));

        // Recovery needs up_threshold good rounds.
        primary_ok.store(true, Ordering::SeqCst);
        manager.check_round().await;
        assert_eq!(manager.status()[0].active.as_deref(), Some("wan1"));
        manager.check_round().await;
        assert_eq!(manager.status()[0].active.as_deref(), Some("wan0"));
    }

    #[tokio::test]
    async fn toggle_excludes_member_from_selection() {
        let (manager, _primary_ok, _backup_ok) = manager_with_fakes();
        manager.check_round().await;
        manager.check_round().await;
        assert!(manager.toggle("internet", "wan0", false));
        assert_eq!(manager.status()[0].active.as_deref(), Some("wan1"));
        assert!(manager.toggle("internet", "wan0", true));
        assert_eq!(manager.status()[0].active.as_deref(), Some("wan0"));
        assert!(!manager.toggle("internet", "nope", false));
    }

    #[tokio::test]
    async fn events_fire_on_transition() {
        let (manager, primary_ok, _backup_ok) = manager_with_fakes();
        let mut events = manager.subscribe();
        manager.check_round().await;
        manager.check_round().await;
        // Both members came up: two events.
        assert_eq!(events.recv().await.unwrap().state, MemberState::Up);
        assert_eq!(events.recv().await.unwrap().state, MemberState::Up);

        primary_ok.store(false, Ordering::SeqCst);
        manager.check_round().await;
        let event = events.recv().await.unwrap();
        assert_eq!(event.interface, "wan0");
        assert_eq!(event.state, MemberState::Degraded);
    }
}
