// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The global apply transaction.
//!
//! One apply at a time (the mutex is FIFO, so reloads and RPC applies queue
//! fairly). Order inside an apply: validate, links, wireguard, services,
//! store commit, kernel table swap, broadcast. Every reconciler hands back
//! its reverse plan; any failure unwinds what already landed and the
//! previous revision keeps running.

use crate::supervisor::{unix_now, Event, Supervisor};
use crate::MgmtError;
use firewall::RulesetBackend;
use interface_manager::DesiredLinks;
use recon::Reconciler;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};
use wireguard::reconciler::DesiredTunnels;
use wireguard::{GuardOutcome, LockoutGuard, WgOp};

impl Supervisor {
    /// Apply the staged revision. Returns the per-subsystem report.
    pub async fn apply_staged(self: &Arc<Self>) -> Result<Value, MgmtError> {
        let _serialize = self.apply_lock.lock().await;

        let (revision_id, model) = {
            let db = self.db.lock();
            let staged = db.staged().ok_or(MgmtError::NothingStaged)?;
            (staged.id, staged.model.clone())
        };

        // Step 1: validate. A rejected model fails the revision and touches
        // nothing else.
        let valid = match config::validate(model) {
            Ok(valid) => valid,
            Err(errors) => {
                error!(revision = revision_id, %errors, "config validation failed");
                self.db.lock().mark_failed(revision_id)?;
                self.broadcast(Event::ConfigFailed {
                    revision: revision_id,
                    reason: errors.to_string(),
                });
                return Err(MgmtError::Validation(errors));
            }
        };

        // Step 2: compute every desired state up front; compile failures
        // abort before any kernel mutation.
        let desired_links = DesiredLinks::from_model(&valid)?;
        let ruleset = firewall::compile(&valid)?;
        let desired_tunnels = DesiredTunnels::from_model(&valid);

        let mut reports = Vec::new();

        // Step 3: links first; everything else depends on them.
        let mut links_reverse = None;
        if let Some(links) = &self.links {
            let plan = links.diff(&desired_links).await?;
            match links.apply(plan).await {
                Ok((reverse, report)) => {
                    reports.push(report);
                    links_reverse = Some(reverse);
                }
                Err(error) => {
                    self.fail_revision(revision_id, &error.to_string()).await;
                    return Err(error.into());
                }
            }
        }

        // Step 4: wireguard, with the lockout guard armed when a protected
        // tunnel changes.
        let wg_plan = self.wg.diff(&desired_tunnels).await?;
        let guard_targets: Vec<(String, Option<wireguard::TunnelSpec>, u64)> = wg_plan
            .forward
            .iter()
            .enumerate()
            .filter_map(|(position, op)| match op {
                WgOp::Configure(spec) if spec.lockout_protection => Some((
                    spec.name.clone(),
                    match wg_plan.reverse.get(position) {
                        Some(WgOp::Configure(previous)) => Some(previous.clone()),
                        _ => None,
                    },
                    spec.lockout_timeout,
                )),
                _ => None,
            })
            .collect();

        let wg_reverse = match self.wg.apply(wg_plan).await {
            Ok((reverse, report)) => {
                reports.push(report);
                reverse
            }
            Err(error) => {
                self.rollback_links(links_reverse).await;
                self.fail_revision(revision_id, &error.to_string()).await;
                return Err(error.into());
            }
        };

        // The guard gates the durable commit: runtime carries the change,
        // the persisted config does not, until a peer handshake confirms
        // the admin still has a way in.
        for (tunnel, previous, timeout) in guard_targets {
            info!(tunnel, timeout, "lockout guard armed");
            let mut guard = LockoutGuard::arm(
                self.wg.backend(),
                tunnel.clone(),
                previous,
                std::time::Duration::from_secs(timeout.max(5)),
            );
            if guard.settled().await == GuardOutcome::Reverted {
                warn!(tunnel, "lockout guard reverted the change");
                self.rollback_links(links_reverse).await;
                self.fail_revision(revision_id, "lockout guard reverted").await;
                return Err(MgmtError::Denied);
            }
        }

        // Step 5: service generation follows the new model. Soft failures
        // only; they surface as degraded services, not a failed apply.
        self.start_services(&valid, &ruleset);

        // Step 6: durable commit. The revision flips to applied before the
        // kernel swap so observers of the broadcast can re-read both.
        let commit_result = {
            let mut db = self.db.lock();
            let mut txn = self.store.begin();
            db.mark_applied(revision_id, unix_now(), &mut txn)?;
            txn.commit()
        };
        if let Err(error) = commit_result {
            self.rollback_wireguard(wg_reverse).await;
            self.rollback_links(links_reverse).await;
            self.fail_revision(revision_id, &error.to_string()).await;
            return Err(error.into());
        }

        // Step 7: the kernel table swap, one atomic transaction. On
        // rejection the prior ruleset is still in force; compensate the
        // store and unwind.
        if let Err(error) = self.kernel.apply(&ruleset).await {
            error!(%error, "kernel ruleset swap rejected");
            self.rollback_wireguard(wg_reverse).await;
            self.rollback_links(links_reverse).await;
            self.restore_previous_revision(revision_id).await;
            return Err(error.into());
        }
        let _ = self.view.apply(&ruleset).await;

        // Step 8: visible to everyone else.
        info!(revision = revision_id, "configuration applied");
        self.broadcast(Event::ConfigApplied {
            revision: revision_id,
        });

        Ok(json!({
            "revision": revision_id,
            "reports": reports,
            "rules": ruleset.rule_count(),
        }))
    }

    async fn rollback_links(&self, reverse: Option<interface_manager::LinkPlan>) {
        if let (Some(links), Some(reverse)) = (&self.links, reverse) {
            if let Err(error) = links.rollback(reverse).await {
                warn!(%error, "link rollback incomplete");
            }
        }
    }

    async fn rollback_wireguard(&self, reverse: wireguard::WgPlan) {
        if let Err(error) = self.wg.rollback(reverse).await {
            warn!(%error, "wireguard rollback incomplete");
        }
    }

    async fn fail_revision(&self, revision: u64, reason: &str) {
        if let Err(error) = self.db.lock().mark_failed(revision) {
            warn!(%error, "failed to record revision failure");
        }
        self.broadcast(Event::ConfigFailed {
            revision,
            reason: reason.to_string(),
        });
    }

    /// Compensation for a kernel swap failure after the store commit: put
    /// the parent revision back in the applied seat.
    async fn restore_previous_revision(&self, failed: u64) {
        let parent = {
            let db = self.db.lock();
            db.get(failed).and_then(|r| r.parent)
        };
        {
            let mut db = self.db.lock();
            let mut txn = self.store.begin();
            let restore = parent.and_then(|id| {
                db.mark_applied(id, unix_now(), &mut txn).ok()
            });
            if restore.is_some() {
                let _ = txn.commit();
            }
        }
        self.fail_revision(failed, "kernel swap rejected").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SupervisorOptions;
    use pretty_assertions::assert_eq;

    fn supervisor() -> (tempfile::TempDir, Arc<Supervisor>) {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            Supervisor::new(SupervisorOptions::headless(dir.path().to_path_buf())).unwrap();
        (dir, supervisor)
    }

    fn lan_wan_model(extra: &str) -> config::Model {
        config::from_yaml_str(&format!(
            r"
interface:
  - name: eth0
    kind: physical
    zone: lan
    addresses: [192.168.1.1/24]
  - name: eth1
    kind: physical
    zone: wan
policy:
  - from: lan
    to: wan
    rules:
      - name: allow_all_from_lan
        action: accept
{extra}"
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn apply_lands_ruleset_and_marks_revision() {
        let (_dir, supervisor) = supervisor();
        supervisor
            .stage_model(lan_wan_model(""), "rpc")
            .unwrap();
        let result = supervisor.apply_staged().await.unwrap();
        assert!(result["rules"].as_u64().unwrap() > 0);

        let listing = supervisor.kernel.list().await.unwrap();
        assert!(listing.contains("allow_all_from_lan"));
        let status = supervisor.status();
        assert_eq!(status["applied_revision"], 1);
        assert!(status["staged_revision"].is_null());
    }

    #[tokio::test]
    async fn invalid_model_never_stages() {
        let (_dir, supervisor) = supervisor();
        supervisor.stage_model(lan_wan_model(""), "rpc").unwrap();
        supervisor.apply_staged().await.unwrap();

        // The bad ipset name is rejected at staging; the applied revision
        // and kernel rules are untouched.
        let mut bad = lan_wan_model("");
        bad.ipsets.push(config::IpSetConfig {
            name: "bad;name".to_string(),
            ..config::IpSetConfig::default()
        });
        let error = supervisor.stage_model(bad, "signal").unwrap_err();
        assert_eq!(error.kind(), "validation");

        let listing = supervisor.kernel.list().await.unwrap();
        assert!(listing.contains("allow_all_from_lan"));
        assert_eq!(supervisor.status()["applied_revision"], 1);
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let (_dir, supervisor) = supervisor();
        supervisor.stage_model(lan_wan_model(""), "rpc").unwrap();
        supervisor.apply_staged().await.unwrap();
        let first = supervisor.kernel.list().await.unwrap();

        supervisor.stage_model(lan_wan_model(""), "rpc").unwrap();
        supervisor.apply_staged().await.unwrap();
        let second = supervisor.kernel.list().await.unwrap();
        // Byte-identical rendering: the second apply changed nothing.
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn nothing_staged_is_an_error() {
        let (_dir, supervisor) = supervisor();
        let error = supervisor.apply_staged().await.unwrap_err();
        assert!(matches!(error, MgmtError::NothingStaged));
    }

    #[tokio::test]
    async fn fail2ban_address_lands_in_blocked_set() {
        let (_dir, supervisor) = supervisor();
        supervisor.stage_model(lan_wan_model(""), "rpc").unwrap();
        supervisor.apply_staged().await.unwrap();

        supervisor
            .add_blocked_ip("203.0.113.66".parse().unwrap(), "failed logins")
            .await
            .unwrap();
        let members = supervisor.view.set_members(firewall::BLOCKED_SET);
        assert_eq!(members.len(), 1);
    }

    #[tokio::test]
    async fn discard_staged_round_trip() {
        let (_dir, supervisor) = supervisor();
        supervisor.stage_model(lan_wan_model(""), "rpc").unwrap();
        assert!(supervisor.discard_staged().unwrap());
        assert!(matches!(
            supervisor.apply_staged().await.unwrap_err(),
            MgmtError::NothingStaged
        ));
    }
}
