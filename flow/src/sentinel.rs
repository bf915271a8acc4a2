// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

//! Per-device anomaly tracking.
//!
//! Welford-online mean/variance over per-second byte and packet rates. A
//! device whose current rate z-scores past the threshold is flagged
//! anomalous and the registered callbacks fire; the sentinel itself never
//! drops traffic.

use net::MacAddr;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use tracing::info;

/// Online mean/variance accumulator.
#[derive(Clone, Debug, Default)]
struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    fn update(&mut self, sample: f64) {
        self.count += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (sample - self.mean);
    }

    fn stddev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).sqrt()
    }

    fn z_score(&self, sample: f64) -> f64 {
        let stddev = self.stddev();
        if stddev == 0.0 {
            return 0.0;
        }
        (sample - self.mean) / stddev
    }
}

#[derive(Clone, Debug, Default)]
struct DeviceTrack {
    bytes_rate: Welford,
    packets_rate: Welford,
    /// Accumulators for the second in progress.
    window_start: u64,
    window_bytes: u64,
    window_packets: u64,
    anomalous: bool,
}

/// Minimum rate samples before z-scores mean anything.
const WARMUP_SAMPLES: u64 = 10;

type Callback = Box<dyn Fn(MacAddr, f64) + Send + Sync>;

pub struct Sentinel {
    devices: RwLock<HashMap<MacAddr, DeviceTrack>>,
    threshold: f64,
    callbacks: Mutex<Vec<Callback>>,
}

impl Sentinel {
    #[must_use]
    pub fn new(threshold: f64) -> Sentinel {
        Sentinel {
            devices: RwLock::new(HashMap::new()),
            threshold,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn on_anomaly(&self, callback: impl Fn(MacAddr, f64) + Send + Sync + 'static) {
        self.callbacks.lock().push(Box::new(callback));
    }

    /// Account one packet for `mac` at unix second `now`.
    pub fn observe(&self, mac: MacAddr, bytes: u64, now: u64) {
        let mut fired: Option<f64> = None;
        {
            let mut devices = self.devices.write();
            let track = devices.entry(mac).or_insert_with(|| DeviceTrack {
                window_start: now,
                ..DeviceTrack::default()
            });

            if now > track.window_start {
                // Close out finished seconds; quiet gaps count as zeros so a
                // silent device's baseline stays low.
                let elapsed = (now - track.window_start).min(60);
                let bytes_rate = track.window_bytes as f64 / elapsed as f64;
                let packets_rate = track.window_packets as f64 / elapsed as f64;

                let warmed = track.bytes_rate.count >= WARMUP_SAMPLES;
                let z_bytes = track.bytes_rate.z_score(bytes_rate);
                let z_packets = track.packets_rate.z_score(packets_rate);
                let z = z_bytes.max(z_packets);
                if warmed && z > self.threshold {
                    if !track.anomalous {
                        track.anomalous = true;
                        fired = Some(z);
                    }
                } else if warmed && z < self.threshold / 2.0 {
                    track.anomalous = false;
                }

                track.bytes_rate.update(bytes_rate);
                track.packets_rate.update(packets_rate);
                track.window_start = now;
                track.window_bytes = 0;
                track.window_packets = 0;
            }
            track.window_bytes += bytes;
            track.window_packets += 1;
        }

        if let Some(z) = fired {
            info!(%mac, z, "device flagged anomalous");
            for callback in self.callbacks.lock().iter() {
                callback(mac, z);
            }
        }
    }

    #[must_use]
    pub fn is_anomalous(&self, mac: MacAddr) -> bool {
        self.devices
            .read()
            .get(&mac)
            .is_some_and(|track| track.anomalous)
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }
}

impl Default for Sentinel {
    fn default() -> Self {
        Sentinel::new(3.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const MAC: MacAddr = MacAddr([0xaa, 0, 0, 0, 0, 1]);

    #[test]
    fn steady_traffic_never_fires() {
        let sentinel = Sentinel::new(3.0);
        for second in 0..120 {
            for _ in 0..10 {
                sentinel.observe(MAC, 1_000, second);
            }
        }
        assert!(!sentinel.is_anomalous(MAC));
    }

    #[test]
    fn burst_after_baseline_fires_once() {
        let sentinel = Sentinel::new(3.0);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        sentinel.on_anomaly(move |_, _| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Baseline: 10 packets of 1 kB per second with slight jitter so the
        // variance is non-zero.
        for second in 0..60 {
            let count = if second % 7 == 0 { 11 } else { 10 };
            for _ in 0..count {
                sentinel.observe(MAC, 1_000, second);
            }
        }
        assert!(!sentinel.is_anomalous(MAC));

        // A 100x burst.
        for _ in 0..1_000 {
            sentinel.observe(MAC, 1_500, 60);
        }
        // The burst's window closes on the next observation.
        sentinel.observe(MAC, 1_000, 61);
        assert!(sentinel.is_anomalous(MAC));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn warmup_suppresses_early_alerts() {
        let sentinel = Sentinel::new(3.0);
        sentinel.observe(MAC, 500, 0);
        for _ in 0..10_000 {
            sentinel.observe(MAC, 1_500, 1);
        }
        sentinel.observe(MAC, 500, 2);
        assert!(!sentinel.is_anomalous(MAC));
    }
}
