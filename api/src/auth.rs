// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Sessions, API keys, CSRF tokens, and the fail2ban counter.

use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

const SESSION_TTL: Duration = Duration::from_secs(12 * 3600);
pub const FAIL_THRESHOLD: u32 = 5;
pub const FAIL_WINDOW: Duration = Duration::from_secs(600);

struct Session {
    user: String,
    csrf: String,
    expires_at: Instant,
}

pub struct AuthState {
    sessions: Mutex<HashMap<String, Session>>,
    /// SHA-256 digests of accepted API keys, from config.
    api_key_digests: Vec<String>,
    pub failures: FailTracker,
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl AuthState {
    #[must_use]
    pub fn new(_session_secret: Option<&str>, api_key_digests: Vec<String>) -> AuthState {
        AuthState {
            sessions: Mutex::new(HashMap::new()),
            api_key_digests,
            failures: FailTracker::new(FAIL_THRESHOLD, FAIL_WINDOW),
        }
    }

    /// Open a session; returns `(session_token, csrf_token)`.
    pub fn open_session(&self, user: &str) -> (String, String) {
        let token = random_token();
        let csrf = random_token();
        self.sessions.lock().insert(
            token.clone(),
            Session {
                user: user.to_string(),
                csrf: csrf.clone(),
                expires_at: Instant::now() + SESSION_TTL,
            },
        );
        (token, csrf)
    }

    pub fn close_session(&self, token: &str) {
        self.sessions.lock().remove(token);
    }

    /// Session cookie check; expired sessions evict on touch.
    #[must_use]
    pub fn session_user(&self, token: &str) -> Option<String> {
        let mut sessions = self.sessions.lock();
        match sessions.get(token) {
            Some(session) if session.expires_at > Instant::now() => Some(session.user.clone()),
            Some(_) => {
                sessions.remove(token);
                None
            }
            None => None,
        }
    }

    /// CSRF double-submit: the header must echo the session's token.
    #[must_use]
    pub fn csrf_ok(&self, token: &str, header: Option<&str>) -> bool {
        let sessions = self.sessions.lock();
        match (sessions.get(token), header) {
            (Some(session), Some(header)) => session.csrf == header,
            _ => false,
        }
    }

    #[must_use]
    pub fn api_key_ok(&self, key: &str) -> bool {
        if self.api_key_digests.is_empty() {
            return false;
        }
        let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
        self.api_key_digests.iter().any(|d| d.eq_ignore_ascii_case(&digest))
    }
}

/// Failed-login accounting per source address. Crossing the threshold
/// within the window fires once per window.
pub struct FailTracker {
    threshold: u32,
    window: Duration,
    attempts: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl FailTracker {
    #[must_use]
    pub fn new(threshold: u32, window: Duration) -> FailTracker {
        FailTracker {
            threshold,
            window,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Record one failure; true when the address just crossed the
    /// threshold and should be banned.
    pub fn record_failure(&self, source: IpAddr, now: Instant) -> bool {
        let mut attempts = self.attempts.lock();
        let entry = attempts.entry(source).or_default();
        entry.retain(|at| now.saturating_duration_since(*at) < self.window);
        entry.push(now);
        if entry.len() as u32 >= self.threshold {
            entry.clear();
            return true;
        }
        false
    }

    pub fn record_success(&self, source: IpAddr) {
        self.attempts.lock().remove(&source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn session_lifecycle() {
        let auth = AuthState::new(None, Vec::new());
        let (token, csrf) = auth.open_session("admin");
        assert_eq!(auth.session_user(&token).as_deref(), Some("admin"));
        assert!(auth.csrf_ok(&token, Some(&csrf)));
        assert!(!auth.csrf_ok(&token, Some("forged")));
        assert!(!auth.csrf_ok(&token, None));
        auth.close_session(&token);
        assert!(auth.session_user(&token).is_none());
    }

    #[test]
    fn api_keys_match_by_digest() {
        let digest = format!("{:x}", Sha256::digest(b"k-123"));
        let auth = AuthState::new(None, vec![digest]);
        assert!(auth.api_key_ok("k-123"));
        assert!(!auth.api_key_ok("k-456"));
        // No configured keys: nothing matches.
        let empty = AuthState::new(None, Vec::new());
        assert!(!empty.api_key_ok("k-123"));
    }

    #[test]
    fn five_failures_within_window_trip() {
        let tracker = FailTracker::new(5, Duration::from_secs(600));
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        let t0 = Instant::now();
        for i in 0..4 {
            assert!(!tracker.record_failure(ip, t0 + Duration::from_secs(i)));
        }
        assert!(tracker.record_failure(ip, t0 + Duration::from_secs(4)));
        // Counter reset after the trip: not an immediate re-trip.
        assert!(!tracker.record_failure(ip, t0 + Duration::from_secs(5)));
    }

    #[test]
    fn old_failures_age_out() {
        let tracker = FailTracker::new(5, Duration::from_secs(600));
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        let t0 = Instant::now();
        for i in 0..4 {
            tracker.record_failure(ip, t0 + Duration::from_secs(i));
        }
        // The fifth comes after the window: the first four are gone.
        assert!(!tracker.record_failure(ip, t0 + Duration::from_secs(700)));
    }

    #[test]
    fn success_clears_history() {
        let tracker = FailTracker::new(5, Duration::from_secs(600));
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        let t0 = Instant::now();
        for i in 0..4 {
            tracker.record_failure(ip, t0 + Duration::from_secs(i));
        }
        tracker.record_success(ip);
        assert!(!tracker.record_failure(ip, t0 + Duration::from_secs(10)));
    }
}
