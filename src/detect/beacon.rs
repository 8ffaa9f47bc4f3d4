//! Periodic beacon detection
//!
//! Command-and-control implants tend to call home on a fixed timer.
//! For every (source, destination, port, protocol) pair with enough
//! connections, the detector measures inter-arrival regularity via the
//! coefficient of variation and flags tight timing inside a plausible
//! beacon interval range.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::FlowDetector;
use crate::config::EngineConfig;
use crate::core::{compute_stats, Evidence, FlowKey, FlowRecord, RawAnomaly, ThreatType};

#[derive(Debug, Default)]
pub struct BeaconDetector;

impl BeaconDetector {
    pub fn new() -> Self {
        Self
    }

    fn classify(&self, cv: f64, connections: usize, config: &EngineConfig) -> f32 {
        let regularity = (1.0 - cv / config.beacon.max_cv_percent) as f32;
        let count_bonus =
            (connections.saturating_sub(config.beacon.min_connections) as f32 * 0.01).min(0.1);
        (0.6 + regularity * 0.3 + count_bonus).clamp(0.0, 1.0)
    }
}

impl FlowDetector for BeaconDetector {
    fn name(&self) -> &'static str {
        "beacon"
    }

    fn threat_type(&self) -> ThreatType {
        ThreatType::PeriodicBeacon
    }

    fn detect(&self, batch: &[FlowRecord], config: &EngineConfig) -> Vec<RawAnomaly> {
        if !config.beacon.enabled {
            return Vec::new();
        }

        // full batch, beacons can tick far slower than the detection window
        let mut pairs: BTreeMap<FlowKey, Vec<DateTime<Utc>>> = BTreeMap::new();
        for record in batch {
            pairs.entry(record.key()).or_default().push(record.window_start);
        }

        let mut anomalies = Vec::new();
        for (key, mut timestamps) in pairs {
            if timestamps.len() < config.beacon.min_connections {
                continue;
            }
            timestamps.sort_unstable();

            let intervals: Vec<f64> = timestamps
                .windows(2)
                .map(|pair| (pair[1] - pair[0]).num_milliseconds() as f64 / 1000.0)
                .collect();
            if intervals.len() < 2 {
                continue;
            }

            let (_, _, mean, std) = compute_stats(&intervals);
            if mean <= 0.0 {
                continue;
            }
            let cv = std / mean * 100.0;

            if cv >= config.beacon.max_cv_percent
                || mean < config.beacon.min_interval_secs
                || mean > config.beacon.max_interval_secs
            {
                continue;
            }

            let connections = timestamps.len();
            let confidence = self.classify(cv, connections, config);
            debug!(
                src = %key.src_ip,
                dst = %key.dst_ip,
                port = key.dst_port,
                cv_percent = cv,
                mean_interval = mean,
                connections,
                "periodic beacon detected"
            );

            let last_seen = timestamps[timestamps.len() - 1];
            anomalies.push(
                RawAnomaly::new(
                    self.name(),
                    key.src_ip,
                    key.dst_ip,
                    Evidence::Beacon {
                        cv_percent: cv,
                        mean_interval_secs: mean,
                        connections,
                    },
                )
                .with_dst_port(key.dst_port)
                .with_confidence(confidence)
                .with_timestamp(last_seen),
            );
        }

        anomalies
    }
}
