//! Crypto mining detection
//!
//! Fixed signature: the destination must be on the mining pool list and
//! the destination port must be a known stratum port. Both conditions are
//! required, so a pool IP serving unrelated traffic stays quiet.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;

use super::FlowDetector;
use crate::config::EngineConfig;
use crate::core::{Evidence, FlowRecord, RawAnomaly, ThreatType};
use crate::intel::IntelStore;

/// Signature matches carry fixed high confidence
const SIGNATURE_CONFIDENCE: f32 = 0.95;

pub struct MiningDetector {
    intel: Arc<IntelStore>,
}

impl MiningDetector {
    pub fn new(intel: Arc<IntelStore>) -> Self {
        Self { intel }
    }
}

impl FlowDetector for MiningDetector {
    fn name(&self) -> &'static str {
        "mining"
    }

    fn threat_type(&self) -> ThreatType {
        ThreatType::CryptoMining
    }

    fn detect(&self, batch: &[FlowRecord], config: &EngineConfig) -> Vec<RawAnomaly> {
        if !config.mining.enabled {
            return Vec::new();
        }

        let mut seen: HashSet<(IpAddr, IpAddr, u16)> = HashSet::new();
        let mut anomalies = Vec::new();

        for record in batch {
            if !config.mining.ports.contains(&record.dst_port) {
                continue;
            }
            let Some(hit) = self.intel.check_mining_pool(&record.dst_ip) else {
                continue;
            };
            // one anomaly per (source, pool, port) per batch
            if !seen.insert((record.src_ip, record.dst_ip, record.dst_port)) {
                continue;
            }

            debug!(
                src = %record.src_ip,
                pool = %hit.matched,
                port = record.dst_port,
                "stratum connection to known mining pool"
            );

            anomalies.push(
                RawAnomaly::new(
                    self.name(),
                    record.src_ip,
                    record.dst_ip,
                    Evidence::Mining {
                        pool: hit.matched,
                        port: record.dst_port,
                    },
                )
                .with_dst_port(record.dst_port)
                .with_confidence(SIGNATURE_CONFIDENCE)
                .with_timestamp(record.window_start),
            );
        }

        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FlowAction, Protocol};
    use crate::intel::IntelSnapshot;
    use chrono::{TimeZone, Utc};

    fn make_flow(dst: &str, dst_port: u16) -> FlowRecord {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        FlowRecord {
            src_ip: "10.0.0.7".parse().unwrap(),
            dst_ip: dst.parse().unwrap(),
            src_port: 51000,
            dst_port,
            protocol: Protocol::Tcp,
            packets: 40,
            bytes: 6000,
            window_start: start,
            window_end: start + chrono::Duration::seconds(30),
            action: FlowAction::Accept,
            geo_country: None,
            resource_tag: None,
            dns_name: None,
        }
    }

    fn pool_store() -> Arc<IntelStore> {
        let mut pools = HashSet::new();
        pools.insert("198.51.100.7".parse().unwrap());
        Arc::new(IntelStore::with_snapshot(IntelSnapshot::new(
            pools,
            HashSet::new(),
            "unit",
        )))
    }

    #[test]
    fn test_pool_and_port_required_together() {
        let detector = MiningDetector::new(pool_store());
        let config = EngineConfig::default();

        // pool IP on a stratum port fires
        let hits = detector.detect(&[make_flow("198.51.100.7", 3333)], &config);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].threat_type, ThreatType::CryptoMining);
        assert_eq!(hits[0].confidence, SIGNATURE_CONFIDENCE);

        // pool IP on an ordinary port stays quiet
        assert!(detector
            .detect(&[make_flow("198.51.100.7", 443)], &config)
            .is_empty());

        // stratum port to an unlisted IP stays quiet
        assert!(detector
            .detect(&[make_flow("198.51.100.8", 3333)], &config)
            .is_empty());
    }

    #[test]
    fn test_repeat_flows_deduplicated() {
        let detector = MiningDetector::new(pool_store());
        let config = EngineConfig::default();

        let batch = vec![
            make_flow("198.51.100.7", 4444),
            make_flow("198.51.100.7", 4444),
            make_flow("198.51.100.7", 4444),
        ];
        assert_eq!(detector.detect(&batch, &config).len(), 1);
    }

    #[test]
    fn test_each_stratum_port_reported() {
        let detector = MiningDetector::new(pool_store());
        let config = EngineConfig::default();

        let batch = vec![
            make_flow("198.51.100.7", 3333),
            make_flow("198.51.100.7", 9999),
        ];
        assert_eq!(detector.detect(&batch, &config).len(), 2);
    }

    #[test]
    fn test_disabled_detector_is_silent() {
        let detector = MiningDetector::new(pool_store());
        let mut config = EngineConfig::default();
        config.mining.enabled = false;

        assert!(detector
            .detect(&[make_flow("198.51.100.7", 3333)], &config)
            .is_empty());
    }
}
