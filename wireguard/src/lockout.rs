// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! The management-lockout guard.
//!
//! When a staged change touches the tunnel carrying the active admin
//! session, the new config goes to the kernel runtime only. The guard then
//! watches for any peer handshake newer than the apply instant: one
//! handshake confirms the admin can still reach us and the change may be
//! persisted; silence until the timeout reverts the runtime to the previous
//! configuration.

use crate::backend::{handshakes_after, WgBackend};
use crate::reconciler::TunnelSpec;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GuardOutcome {
    /// Still watching.
    Pending,
    /// Handshake seen; safe to persist the new config.
    Confirmed,
    /// No handshake before the deadline; previous runtime restored.
    Reverted,
}

pub struct LockoutGuard {
    outcome: watch::Receiver<GuardOutcome>,
}

impl LockoutGuard {
    /// Arm the guard after the new runtime config has been applied.
    ///
    /// `previous` is what the kernel ran before the change; `None` means the
    /// tunnel did not exist, so reverting removes it.
    pub fn arm(
        backend: Arc<dyn WgBackend>,
        tunnel: String,
        previous: Option<TunnelSpec>,
        timeout: Duration,
    ) -> LockoutGuard {
        let (tx, rx) = watch::channel(GuardOutcome::Pending);
        let armed_at = SystemTime::now();
        tokio::spawn(async move {
            let poll = Duration::from_secs(2).min(timeout);
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                tokio::time::sleep(poll).await;
                let confirmed = {
                    let backend = Arc::clone(&backend);
                    let tunnel = tunnel.clone();
                    tokio::task::spawn_blocking(move || {
                        backend
                            .get(&tunnel)
                            .ok()
                            .flatten()
                            .map(|snapshot| !handshakes_after(&snapshot, armed_at).is_empty())
                            .unwrap_or(false)
                    })
                    .await
                    .unwrap_or(false)
                };
                if confirmed {
                    info!(tunnel, "lockout guard confirmed by peer handshake");
                    let _ = tx.send(GuardOutcome::Confirmed);
                    return;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(tunnel, "lockout guard expired, reverting runtime config");
                    let backend = Arc::clone(&backend);
                    let tunnel_name = tunnel.clone();
                    let previous = previous.clone();
                    let result = tokio::task::spawn_blocking(move || match previous {
                        Some(spec) => backend.configure(&spec),
                        None => backend.remove(&tunnel_name),
                    })
                    .await;
                    if let Ok(Err(error)) = result {
                        warn!(tunnel, %error, "lockout revert failed");
                    }
                    let _ = tx.send(GuardOutcome::Reverted);
                    return;
                }
            }
        });
        LockoutGuard { outcome: rx }
    }

    /// Wait for the guard to settle.
    pub async fn settled(&mut self) -> GuardOutcome {
        loop {
            let current = *self.outcome.borrow();
            if current != GuardOutcome::Pending {
                return current;
            }
            if self.outcome.changed().await.is_err() {
                return GuardOutcome::Reverted;
            }
        }
    }

    #[must_use]
    pub fn current(&self) -> GuardOutcome {
        *self.outcome.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FakeWg;
    use crate::reconciler::PeerSpec;

    fn spec(name: &str, port: u16) -> TunnelSpec {
        TunnelSpec {
            name: name.to_string(),
            private_key: "cHJpdmF0ZWtleXByaXZhdGVrZXlwcml2YXRla2V5cHI=".to_string(),
            listen_port: port,
            peers: vec![PeerSpec {
                public_key: "cHVibGlja2V5cHVibGlja2V5cHVibGlja2V5cHVibGk=".to_string(),
                preshared_key: None,
                endpoint: None,
                allowed_ips: vec!["10.8.0.2/32".parse().unwrap()],
                persistent_keepalive: 0,
            }],
            lockout_protection: true,
            lockout_timeout: 90,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_confirms() {
        let backend = Arc::new(FakeWg::new());
        backend.configure(&spec("wg0", 51820)).unwrap();
        let mut guard = LockoutGuard::arm(
            backend.clone(),
            "wg0".to_string(),
            Some(spec("wg0", 51800)),
            Duration::from_secs(30),
        );
        // A handshake lands while the guard polls.
        backend.handshake("wg0", "cHVibGlja2V5cHVibGlja2V5cHVibGlja2V5cHVibGk=");
        assert_eq!(guard.settled().await, GuardOutcome::Confirmed);
        // Runtime keeps the new port.
        assert_eq!(
            backend.get("wg0").unwrap().unwrap().listen_port,
            Some(51820)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silence_reverts_to_previous_runtime() {
        let backend = Arc::new(FakeWg::new());
        backend.configure(&spec("wg0", 51820)).unwrap();
        let mut guard = LockoutGuard::arm(
            backend.clone(),
            "wg0".to_string(),
            Some(spec("wg0", 51800)),
            Duration::from_secs(10),
        );
        assert_eq!(guard.settled().await, GuardOutcome::Reverted);
        assert_eq!(
            backend.get("wg0").unwrap().unwrap().listen_port,
            Some(51800)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_tunnel_reverts_to_removal() {
        let backend = Arc::new(FakeWg::new());
        backend.configure(&spec("wg1", 51821)).unwrap();
        let mut guard = LockoutGuard::arm(
            backend.clone(),
            "wg1".to_string(),
            None,
            Duration::from_secs(5),
        );
        assert_eq!(guard.settled().await, GuardOutcome::Reverted);
        assert!(backend.get("wg1").unwrap().is_none());
    }
}
