//! Tor exit node detection
//!
//! Pure list membership against the hourly-refreshed exit node snapshot.
//! Confidence sits below the signature detectors; published exit lists
//! lag the live network.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;

use super::FlowDetector;
use crate::config::EngineConfig;
use crate::core::{Evidence, FlowRecord, RawAnomaly, ThreatType};
use crate::intel::IntelStore;

const LIST_CONFIDENCE: f32 = 0.85;

pub struct TorDetector {
    intel: Arc<IntelStore>,
}

impl TorDetector {
    pub fn new(intel: Arc<IntelStore>) -> Self {
        Self { intel }
    }
}

impl FlowDetector for TorDetector {
    fn name(&self) -> &'static str {
        "tor"
    }

    fn threat_type(&self) -> ThreatType {
        ThreatType::TorUsage
    }

    fn detect(&self, batch: &[FlowRecord], config: &EngineConfig) -> Vec<RawAnomaly> {
        if !config.tor.enabled {
            return Vec::new();
        }

        let mut seen: HashSet<(IpAddr, IpAddr)> = HashSet::new();
        let mut anomalies = Vec::new();

        for record in batch {
            let Some(hit) = self.intel.check_tor_exit(&record.dst_ip) else {
                continue;
            };
            // one anomaly per (source, exit) per batch
            if !seen.insert((record.src_ip, record.dst_ip)) {
                continue;
            }

            debug!(
                src = %record.src_ip,
                exit = %record.dst_ip,
                source = %hit.source,
                "connection to tor exit node"
            );

            anomalies.push(
                RawAnomaly::new(
                    self.name(),
                    record.src_ip,
                    record.dst_ip,
                    Evidence::TorExit {
                        list_source: hit.source,
                    },
                )
                .with_dst_port(record.dst_port)
                .with_confidence(LIST_CONFIDENCE)
                .with_timestamp(record.window_start),
            );
        }

        anomalies
    }
}
