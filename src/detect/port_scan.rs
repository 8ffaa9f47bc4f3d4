//! Port scan detection
//!
//! Flags sources that touch an anomalous number of distinct destination
//! ports inside one detection window. Confidence rises with port
//! diversity, a poor connection success ratio, and sequential port
//! walking.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{trailing_window, FlowDetector};
use crate::config::EngineConfig;
use crate::core::{Evidence, FlowRecord, RawAnomaly, ThreatType};

/// Ascending run length treated as sequential port walking
const SEQUENTIAL_RUN_MIN: usize = 5;

#[derive(Debug, Default)]
struct SourceActivity {
    ports: HashSet<u16>,
    flows: usize,
    accepted: usize,
    dst_counts: HashMap<IpAddr, usize>,
    last_seen: Option<DateTime<Utc>>,
}

impl SourceActivity {
    fn success_ratio(&self) -> f64 {
        if self.flows == 0 {
            return 0.0;
        }
        self.accepted as f64 / self.flows as f64
    }

    /// Destination with the most flows from this source
    fn top_destination(&self) -> Option<IpAddr> {
        self.dst_counts
            .iter()
            .max_by_key(|(ip, count)| (**count, **ip))
            .map(|(ip, _)| *ip)
    }
}

/// Length of the longest run of consecutive ascending port numbers
fn longest_ascending_run(ports: &HashSet<u16>) -> usize {
    if ports.is_empty() {
        return 0;
    }

    let mut sorted: Vec<u16> = ports.iter().copied().collect();
    sorted.sort_unstable();

    let mut best = 1;
    let mut run = 1;
    for pair in sorted.windows(2) {
        if pair[1] == pair[0] + 1 {
            run += 1;
            best = best.max(run);
        } else {
            run = 1;
        }
    }
    best
}

#[derive(Debug, Default)]
pub struct PortScanDetector;

impl PortScanDetector {
    pub fn new() -> Self {
        Self
    }

    fn classify(
        &self,
        src_ip: IpAddr,
        activity: &SourceActivity,
        config: &EngineConfig,
    ) -> (f32, f64, bool) {
        let unique = activity.ports.len();
        let threshold = config.port_scan.unique_port_threshold;
        let mut confidence: f32 = 0.5;
        let mut reasons = vec![format!("{} unique ports in window", unique)];

        // diversity beyond the threshold
        let over = unique.saturating_sub(threshold) as f32 / threshold.max(1) as f32;
        confidence += (over * 0.6).min(0.2);

        let success_ratio = activity.success_ratio();
        if success_ratio < config.port_scan.success_ratio_ceiling {
            confidence += 0.2;
            reasons.push(format!("success ratio {:.2}", success_ratio));
        }

        let run = longest_ascending_run(&activity.ports);
        let sequential = run >= SEQUENTIAL_RUN_MIN;
        if sequential {
            confidence += 0.1;
            reasons.push(format!("sequential run of {}", run));
        }

        debug!(
            src = %src_ip,
            confidence,
            "port scan: {}",
            reasons.join(", ")
        );

        (confidence.clamp(0.0, 1.0), success_ratio, sequential)
    }
}

impl FlowDetector for PortScanDetector {
    fn name(&self) -> &'static str {
        "port_scan"
    }

    fn threat_type(&self) -> ThreatType {
        ThreatType::PortScan
    }

    fn detect(&self, batch: &[FlowRecord], config: &EngineConfig) -> Vec<RawAnomaly> {
        if !config.port_scan.enabled {
            return Vec::new();
        }

        let window = trailing_window(batch, config.window.window_secs);

        // BTreeMap keeps emission order stable across runs
        let mut sources: BTreeMap<IpAddr, SourceActivity> = BTreeMap::new();
        for record in window {
            let entry = sources.entry(record.src_ip).or_default();
            entry.ports.insert(record.dst_port);
            entry.flows += 1;
            if record.action.is_accept() {
                entry.accepted += 1;
            }
            *entry.dst_counts.entry(record.dst_ip).or_insert(0) += 1;
            entry.last_seen = Some(
                entry
                    .last_seen
                    .map_or(record.window_start, |t| t.max(record.window_start)),
            );
        }

        let mut anomalies = Vec::new();
        for (src_ip, activity) in &sources {
            if activity.ports.len() <= config.port_scan.unique_port_threshold {
                continue;
            }
            let Some(dst_ip) = activity.top_destination() else {
                continue;
            };

            let (confidence, success_ratio, sequential) =
                self.classify(*src_ip, activity, config);

            let mut anomaly = RawAnomaly::new(
                self.name(),
                *src_ip,
                dst_ip,
                Evidence::PortScan {
                    unique_ports: activity.ports.len(),
                    success_ratio,
                    sequential,
                },
            )
            .with_confidence(confidence);
            if let Some(ts) = activity.last_seen {
                anomaly = anomaly.with_timestamp(ts);
            }
            anomalies.push(anomaly);
        }

        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FlowAction, Protocol};
    use chrono::TimeZone;

    fn make_flow(src: &str, dst_port: u16, action: FlowAction, offset_secs: i64) -> FlowRecord {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
            + chrono::Duration::seconds(offset_secs);
        FlowRecord {
            src_ip: src.parse().unwrap(),
            dst_ip: "192.0.2.10".parse().unwrap(),
            src_port: 50000,
            dst_port,
            protocol: Protocol::Tcp,
            packets: 3,
            bytes: 180,
            window_start: start,
            window_end: start + chrono::Duration::seconds(1),
            action,
            geo_country: None,
            resource_tag: None,
            dns_name: None,
        }
    }

    fn scan_batch(src: &str, ports: usize) -> Vec<FlowRecord> {
        (0..ports)
            .map(|i| make_flow(src, 1000 + i as u16, FlowAction::Reject, i as i64))
            .collect()
    }

    #[test]
    fn test_detects_above_threshold() {
        let detector = PortScanDetector::new();
        let config = EngineConfig::default();

        let anomalies = detector.detect(&scan_batch("10.0.0.1", 21), &config);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].threat_type, ThreatType::PortScan);
        assert_eq!(anomalies[0].src_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_quiet_below_threshold() {
        let detector = PortScanDetector::new();
        let config = EngineConfig::default();

        assert!(detector.detect(&scan_batch("10.0.0.1", 19), &config).is_empty());
        // exactly at the threshold still does not fire
        assert!(detector.detect(&scan_batch("10.0.0.1", 20), &config).is_empty());
    }

    #[test]
    fn test_rejected_sequential_scan_scores_high() {
        let detector = PortScanDetector::new();
        let config = EngineConfig::default();

        let anomalies = detector.detect(&scan_batch("10.0.0.1", 25), &config);
        assert_eq!(anomalies.len(), 1);
        assert!(anomalies[0].confidence >= 0.9);

        match &anomalies[0].evidence {
            Evidence::PortScan {
                unique_ports,
                success_ratio,
                sequential,
            } => {
                assert_eq!(*unique_ports, 25);
                assert!(*success_ratio < 0.01);
                assert!(sequential);
            }
            other => panic!("wrong evidence: {:?}", other),
        }
    }

    #[test]
    fn test_accepted_flows_lower_confidence() {
        let detector = PortScanDetector::new();
        let config = EngineConfig::default();

        let rejected = detector.detect(&scan_batch("10.0.0.1", 25), &config);

        let accepted: Vec<FlowRecord> = (0..25)
            .map(|i| make_flow("10.0.0.1", 1000 + i as u16, FlowAction::Accept, i as i64))
            .collect();
        let accepted = detector.detect(&accepted, &config);

        assert!(accepted[0].confidence < rejected[0].confidence);
    }

    #[test]
    fn test_scattered_ports_not_sequential() {
        let detector = PortScanDetector::new();
        let config = EngineConfig::default();

        let batch: Vec<FlowRecord> = (0..25)
            .map(|i| make_flow("10.0.0.1", (i * 97 % 60000 + 1024) as u16, FlowAction::Reject, i))
            .collect();
        let anomalies = detector.detect(&batch, &config);
        assert_eq!(anomalies.len(), 1);

        match &anomalies[0].evidence {
            Evidence::PortScan { sequential, .. } => assert!(!sequential),
            other => panic!("wrong evidence: {:?}", other),
        }
    }

    #[test]
    fn test_per_source_isolation() {
        let detector = PortScanDetector::new();
        let config = EngineConfig::default();

        // two quiet sources do not add up to one loud one
        let mut batch = scan_batch("10.0.0.1", 12);
        batch.extend(scan_batch("10.0.0.2", 12));
        batch.sort_by_key(|r| r.window_start);

        assert!(detector.detect(&batch, &config).is_empty());
    }

    #[test]
    fn test_disabled_detector_is_silent() {
        let detector = PortScanDetector::new();
        let mut config = EngineConfig::default();
        config.port_scan.enabled = false;

        assert!(detector.detect(&scan_batch("10.0.0.1", 25), &config).is_empty());
    }

    #[test]
    fn test_longest_ascending_run() {
        let ports: HashSet<u16> = [80, 81, 82, 83, 84, 443, 8080].into_iter().collect();
        assert_eq!(longest_ascending_run(&ports), 5);

        let scattered: HashSet<u16> = [10, 20, 30].into_iter().collect();
        assert_eq!(longest_ascending_run(&scattered), 1);
        assert_eq!(longest_ascending_run(&HashSet::new()), 0);
    }
}
