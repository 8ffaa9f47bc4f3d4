//! Volumetric flood detection
//!
//! Tracks the aggregate packet rate toward each (destination, port) pair
//! inside the detection window. Confidence grows with how far the rate
//! exceeds the threshold and with source diversity, since many distinct
//! senders point at a coordinated flood.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{trailing_window, FlowDetector};
use crate::config::EngineConfig;
use crate::core::{Evidence, FlowRecord, RawAnomaly, ThreatType};

#[derive(Debug)]
struct TargetActivity {
    packets: u64,
    per_source: HashMap<IpAddr, u64>,
    first_start: DateTime<Utc>,
    last_end: DateTime<Utc>,
    last_start: DateTime<Utc>,
}

impl TargetActivity {
    fn new(record: &FlowRecord) -> Self {
        Self {
            packets: 0,
            per_source: HashMap::new(),
            first_start: record.window_start,
            last_end: record.window_end,
            last_start: record.window_start,
        }
    }

    fn add(&mut self, record: &FlowRecord) {
        self.packets += record.packets;
        *self.per_source.entry(record.src_ip).or_insert(0) += record.packets;
        self.first_start = self.first_start.min(record.window_start);
        self.last_end = self.last_end.max(record.window_end);
        self.last_start = self.last_start.max(record.window_start);
    }

    /// Aggregate packets per second over the observed span, floored at
    /// one second so instantaneous bursts stay finite
    fn packet_rate(&self) -> f64 {
        let span_ms = (self.last_end - self.first_start).num_milliseconds().max(0);
        let span_secs = (span_ms as f64 / 1000.0).max(1.0);
        self.packets as f64 / span_secs
    }

    fn distinct_sources(&self) -> usize {
        self.per_source.len()
    }

    /// Heaviest sender, ties broken by address for determinism
    fn top_source(&self) -> Option<IpAddr> {
        self.per_source
            .iter()
            .max_by_key(|(ip, packets)| (**packets, **ip))
            .map(|(ip, _)| *ip)
    }
}

#[derive(Debug, Default)]
pub struct FloodDetector;

impl FloodDetector {
    pub fn new() -> Self {
        Self
    }

    fn classify(&self, rate: f64, sources: usize, config: &EngineConfig) -> f32 {
        let mut confidence: f32 = 0.5;

        let excess = (rate / config.flood.packet_rate_threshold) as f32;
        confidence += ((excess - 1.0) * 0.15).clamp(0.0, 0.3);

        if sources >= 10 {
            confidence += 0.2;
        } else if sources >= 3 {
            confidence += 0.1;
        }

        confidence.clamp(0.0, 1.0)
    }
}

impl FlowDetector for FloodDetector {
    fn name(&self) -> &'static str {
        "flood"
    }

    fn threat_type(&self) -> ThreatType {
        ThreatType::VolumetricFlood
    }

    fn detect(&self, batch: &[FlowRecord], config: &EngineConfig) -> Vec<RawAnomaly> {
        if !config.flood.enabled {
            return Vec::new();
        }

        let window = trailing_window(batch, config.window.window_secs);

        let mut targets: BTreeMap<(IpAddr, u16), TargetActivity> = BTreeMap::new();
        for record in window {
            targets
                .entry((record.dst_ip, record.dst_port))
                .or_insert_with(|| TargetActivity::new(record))
                .add(record);
        }

        let mut anomalies = Vec::new();
        for ((dst_ip, dst_port), activity) in &targets {
            let rate = activity.packet_rate();
            if rate <= config.flood.packet_rate_threshold {
                continue;
            }
            let Some(src_ip) = activity.top_source() else {
                continue;
            };

            let sources = activity.distinct_sources();
            let confidence = self.classify(rate, sources, config);
            debug!(
                dst = %dst_ip,
                port = dst_port,
                rate,
                sources,
                confidence,
                "volumetric flood detected"
            );

            anomalies.push(
                RawAnomaly::new(
                    self.name(),
                    src_ip,
                    *dst_ip,
                    Evidence::Flood {
                        packet_rate: rate,
                        distinct_sources: sources,
                    },
                )
                .with_dst_port(*dst_port)
                .with_confidence(confidence)
                .with_timestamp(activity.last_start),
            );
        }

        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FlowAction, Protocol};
    use chrono::TimeZone;

    fn make_flow(src: &str, packets: u64, offset_secs: i64, span_secs: i64) -> FlowRecord {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
            + chrono::Duration::seconds(offset_secs);
        FlowRecord {
            src_ip: src.parse().unwrap(),
            dst_ip: "192.0.2.80".parse().unwrap(),
            src_port: 40000,
            dst_port: 80,
            protocol: Protocol::Udp,
            packets,
            bytes: packets * 60,
            window_start: start,
            window_end: start + chrono::Duration::seconds(span_secs),
            action: FlowAction::Accept,
            geo_country: None,
            resource_tag: None,
            dns_name: None,
        }
    }

    #[test]
    fn test_detects_rate_above_threshold() {
        let detector = FloodDetector::new();
        let config = EngineConfig::default();

        // 120k packets over 60s toward one target: 2000 pkt/s
        let batch = vec![make_flow("10.0.0.1", 120_000, 0, 60)];
        let anomalies = detector.detect(&batch, &config);

        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].threat_type, ThreatType::VolumetricFlood);
        assert_eq!(anomalies[0].dst_port, Some(80));
        match &anomalies[0].evidence {
            Evidence::Flood {
                packet_rate,
                distinct_sources,
            } => {
                assert!((*packet_rate - 2000.0).abs() < 1.0);
                assert_eq!(*distinct_sources, 1);
            }
            other => panic!("wrong evidence: {:?}", other),
        }
    }

    #[test]
    fn test_quiet_below_threshold() {
        let detector = FloodDetector::new();
        let config = EngineConfig::default();

        // 30k packets over 60s: 500 pkt/s
        let batch = vec![make_flow("10.0.0.1", 30_000, 0, 60)];
        assert!(detector.detect(&batch, &config).is_empty());
    }

    #[test]
    fn test_source_diversity_raises_confidence() {
        let detector = FloodDetector::new();
        let config = EngineConfig::default();

        let single = detector.detect(&[make_flow("10.0.0.1", 120_000, 0, 60)], &config);

        let distributed: Vec<FlowRecord> = (0..12)
            .map(|i| make_flow(&format!("10.0.1.{}", i), 10_000, 0, 60))
            .collect();
        let distributed = detector.detect(&distributed, &config);

        assert_eq!(distributed.len(), 1);
        assert!(distributed[0].confidence > single[0].confidence);
        match &distributed[0].evidence {
            Evidence::Flood {
                distinct_sources, ..
            } => assert_eq!(*distinct_sources, 12),
            other => panic!("wrong evidence: {:?}", other),
        }
    }

    #[test]
    fn test_instantaneous_burst_uses_floor_span() {
        let detector = FloodDetector::new();
        let config = EngineConfig::default();

        // zero-length window, rate falls back to packets per one second
        let batch = vec![make_flow("10.0.0.1", 1500, 0, 0)];
        let anomalies = detector.detect(&batch, &config);
        assert_eq!(anomalies.len(), 1);
    }

    #[test]
    fn test_disabled_detector_is_silent() {
        let detector = FloodDetector::new();
        let mut config = EngineConfig::default();
        config.flood.enabled = false;

        let batch = vec![make_flow("10.0.0.1", 120_000, 0, 60)];
        assert!(detector.detect(&batch, &config).is_empty());
    }
}
