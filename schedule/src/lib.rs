// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Time-window evaluation for scheduled rules.
//!
//! Windows are expanded once per applied revision (midnight-crossing windows
//! become two intervals); a minute ticker recomputes the active set in each
//! window's own timezone and reconciles the kernel gates through the
//! firewall backend.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use config::ScheduleConfig;
use firewall::RulesetBackend;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("schedule {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// Minutes since Monday 00:00, half-open interval in the window's timezone.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Interval {
    start: u32,
    end: u32,
}

const WEEK_MINUTES: u32 = 7 * 24 * 60;

/// A compiled schedule: a name, a timezone, and expanded weekly intervals.
#[derive(Clone, Debug)]
pub struct Window {
    pub name: String,
    tz: Tz,
    intervals: Vec<Interval>,
}

impl Window {
    /// Expand one schedule block. Windows crossing midnight split into the
    /// evening leg and the next day's morning leg.
    pub fn expand(config: &ScheduleConfig, default_tz: &str) -> Result<Window, ScheduleError> {
        let invalid = |reason: &str| ScheduleError::Invalid {
            name: config.name.clone(),
            reason: reason.to_string(),
        };
        let tz: Tz = config
            .timezone
            .as_deref()
            .unwrap_or(default_tz)
            .parse()
            .map_err(|_| invalid("unknown timezone"))?;
        let (start_h, start_m) =
            config::validate::parse_hm(&config.start).ok_or_else(|| invalid("bad start time"))?;
        let (end_h, end_m) =
            config::validate::parse_hm(&config.end).ok_or_else(|| invalid("bad end time"))?;
        let start = u32::from(start_h) * 60 + u32::from(start_m);
        let end = u32::from(end_h) * 60 + u32::from(end_m);

        let mut intervals = Vec::new();
        for day in &config.days {
            let day_index = day_number(day).ok_or_else(|| invalid("unknown day"))?;
            let base = day_index * 24 * 60;
            if start < end {
                intervals.push(Interval {
                    start: base + start,
                    end: base + end,
                });
            } else {
                // Crosses midnight: evening leg plus next-day morning leg.
                intervals.push(Interval {
                    start: base + start,
                    end: base + 24 * 60,
                });
                let next = (base + 24 * 60) % WEEK_MINUTES;
                intervals.push(Interval {
                    start: next,
                    end: next + end,
                });
            }
        }
        Ok(Window {
            name: config.name.clone(),
            tz,
            intervals,
        })
    }

    /// Whether `instant` falls in any expanded interval, evaluated in the
    /// window's timezone. Pure, so the property tests drive it directly.
    #[must_use]
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let local = instant.with_timezone(&self.tz);
        let minute = weekday_number(local.weekday()) * 24 * 60
            + local.hour() * 60
            + local.minute();
        self.intervals
            .iter()
            .any(|iv| minute >= iv.start && minute < iv.end)
    }
}

fn day_number(day: &str) -> Option<u32> {
    let n = match day.to_lowercase().as_str() {
        "mon" => 0,
        "tue" => 1,
        "wed" => 2,
        "thu" => 3,
        "fri" => 4,
        "sat" => 5,
        "sun" => 6,
        _ => return None,
    };
    Some(n)
}

fn weekday_number(day: Weekday) -> u32 {
    day.num_days_from_monday()
}

/// The minute ticker driving the kernel's `active_schedules` state.
pub struct Scheduler {
    windows: Vec<Window>,
    backend: Arc<dyn RulesetBackend>,
}

impl Scheduler {
    pub fn new(
        schedules: &[ScheduleConfig],
        default_tz: &str,
        backend: Arc<dyn RulesetBackend>,
    ) -> Result<Scheduler, ScheduleError> {
        let windows = schedules
            .iter()
            .map(|s| Window::expand(s, default_tz))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Scheduler { windows, backend })
    }

    /// The names active at `instant`.
    #[must_use]
    pub fn active_at(&self, instant: DateTime<Utc>) -> BTreeSet<String> {
        self.windows
            .iter()
            .filter(|w| w.contains(instant))
            .map(|w| w.name.clone())
            .collect()
    }

    /// Recompute and reconcile once. Exposed for the supervisor to call
    /// right after an apply so gates match reality immediately.
    pub async fn tick(&self, instant: DateTime<Utc>) {
        let active = self.active_at(instant);
        if let Err(error) = self.backend.update_schedules(&active).await {
            warn!(%error, "schedule gate reconciliation failed");
        } else {
            debug!(active = active.len(), "schedule gates reconciled");
        }
    }

    /// Run the 60 s loop until shutdown flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(Utc::now()).await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn window(days: &[&str], start: &str, end: &str, tz: &str) -> Window {
        Window::expand(
            &ScheduleConfig {
                name: "w".to_string(),
                days: days.iter().map(ToString::to_string).collect(),
                start: start.to_string(),
                end: end.to_string(),
                timezone: Some(tz.to_string()),
            },
            "UTC",
        )
        .unwrap()
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn plain_window_contains_its_hours() {
        // 2026-01-05 is a Monday.
        let w = window(&["mon"], "09:00", "17:00", "UTC");
        assert!(w.contains(utc(2026, 1, 5, 9, 0)));
        assert!(w.contains(utc(2026, 1, 5, 16, 59)));
        assert!(!w.contains(utc(2026, 1, 5, 17, 0)));
        assert!(!w.contains(utc(2026, 1, 6, 12, 0)));
    }

    #[test]
    fn midnight_crossing_expands_to_two_intervals() {
        let w = window(&["fri"], "22:00", "06:00", "UTC");
        // Friday 23:30 is in.
        assert!(w.contains(utc(2026, 1, 9, 23, 30)));
        // Saturday 05:59 is in (the morning leg).
        assert!(w.contains(utc(2026, 1, 10, 5, 59)));
        assert!(!w.contains(utc(2026, 1, 10, 6, 0)));
        assert!(!w.contains(utc(2026, 1, 9, 21, 59)));
    }

    #[test]
    fn timezone_is_respected() {
        // 09:00-17:00 in Berlin is 08:00-16:00 UTC in winter.
        let w = window(&["mon"], "09:00", "17:00", "Europe/Berlin");
        assert!(w.contains(utc(2026, 1, 5, 8, 0)));
        assert!(!w.contains(utc(2026, 1, 5, 16, 30)));
    }

    #[test]
    fn sunday_to_monday_wraps_the_week() {
        let w = window(&["sun"], "22:00", "02:00", "UTC");
        // Sunday 2026-01-11 23:00 in.
        assert!(w.contains(utc(2026, 1, 11, 23, 0)));
        // Monday 01:30 in (wrapped leg).
        assert!(w.contains(utc(2026, 1, 12, 1, 30)));
        assert!(!w.contains(utc(2026, 1, 12, 2, 0)));
    }

    #[test]
    fn membership_matches_expanded_intervals_exhaustively() {
        // Containment must hold exactly when the local minute lies in an
        // expanded interval. Walk a whole week minute by minute.
        let w = window(&["tue", "thu"], "08:30", "12:15", "UTC");
        let monday = utc(2026, 1, 5, 0, 0);
        for minute in 0..WEEK_MINUTES {
            let t = monday + chrono::Duration::minutes(i64::from(minute));
            let day = minute / (24 * 60);
            let of_day = minute % (24 * 60);
            let expected = (day == 1 || day == 3) && (510..735).contains(&of_day);
            assert_eq!(w.contains(t), expected, "minute {minute}");
        }
    }

    #[tokio::test]
    async fn tick_updates_backend() {
        let backend = Arc::new(firewall::MemoryBackend::new());
        let scheduler = Scheduler::new(
            &[ScheduleConfig {
                name: "always".to_string(),
                days: vec![
                    "mon".into(),
                    "tue".into(),
                    "wed".into(),
                    "thu".into(),
                    "fri".into(),
                    "sat".into(),
                    "sun".into(),
                ],
                start: "00:00".to_string(),
                end: "24:00".to_string(),
                timezone: None,
            }],
            "UTC",
            backend.clone(),
        )
        .unwrap();
        scheduler.tick(Utc::now()).await;
        assert!(backend.active_schedules().contains("always"));
    }
}
