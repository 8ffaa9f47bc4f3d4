//! Correlation engine
//!
//! Groups raw anomalies from both detector families into incidents along
//! three axes: time proximity, entity overlap, and threat type affinity.
//! Grouping is greedy and first-seen-wins over the merged anomaly list,
//! which keeps output deterministic for identical input and guarantees
//! non-overlapping groups.

use serde::Serialize;
use tracing::debug;

use crate::config::EngineConfig;
use crate::core::{CorrelationGroup, RawAnomaly, RelatedAnomaly, ThreatType};

/// Static affinity between threat types, symmetric with a unit diagonal.
/// Exhaustive over the closed enum: a new threat type does not compile
/// until it is placed in this table.
pub fn type_affinity(a: ThreatType, b: ThreatType) -> f32 {
    use ThreatType::*;
    match (a, b) {
        (PortScan, PortScan) => 1.0,
        (PortScan, VolumetricFlood) | (VolumetricFlood, PortScan) => 0.6,
        (PortScan, PeriodicBeacon) | (PeriodicBeacon, PortScan) => 0.5,
        (PortScan, CryptoMining) | (CryptoMining, PortScan) => 0.4,
        (PortScan, TorUsage) | (TorUsage, PortScan) => 0.4,
        (PortScan, BehavioralDeviation) | (BehavioralDeviation, PortScan) => 0.7,
        (VolumetricFlood, VolumetricFlood) => 1.0,
        (VolumetricFlood, PeriodicBeacon) | (PeriodicBeacon, VolumetricFlood) => 0.3,
        (VolumetricFlood, CryptoMining) | (CryptoMining, VolumetricFlood) => 0.2,
        (VolumetricFlood, TorUsage) | (TorUsage, VolumetricFlood) => 0.3,
        (VolumetricFlood, BehavioralDeviation) | (BehavioralDeviation, VolumetricFlood) => 0.7,
        (PeriodicBeacon, PeriodicBeacon) => 1.0,
        (PeriodicBeacon, CryptoMining) | (CryptoMining, PeriodicBeacon) => 0.6,
        (PeriodicBeacon, TorUsage) | (TorUsage, PeriodicBeacon) => 0.7,
        (PeriodicBeacon, BehavioralDeviation) | (BehavioralDeviation, PeriodicBeacon) => 0.7,
        (CryptoMining, CryptoMining) => 1.0,
        (CryptoMining, TorUsage) | (TorUsage, CryptoMining) => 0.5,
        (CryptoMining, BehavioralDeviation) | (BehavioralDeviation, CryptoMining) => 0.7,
        (TorUsage, TorUsage) => 1.0,
        (TorUsage, BehavioralDeviation) | (BehavioralDeviation, TorUsage) => 0.6,
        (BehavioralDeviation, BehavioralDeviation) => 1.0,
    }
}

/// Per-invocation counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CorrelationStats {
    pub input_anomalies: usize,
    pub groups: usize,
    pub singletons: usize,
    pub linked: usize,
}

/// Output of one correlation pass
#[derive(Debug)]
pub struct CorrelationResult {
    pub groups: Vec<CorrelationGroup>,
    pub stats: CorrelationStats,
}

/// Stateless grouping engine; all tunables come from the config snapshot
#[derive(Debug, Default)]
pub struct CorrelationEngine;

impl CorrelationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Pairwise score in [0, 1]:
    /// weighted time proximity, entity overlap, and type affinity.
    pub fn pairwise_score(
        &self,
        a: &RawAnomaly,
        b: &RawAnomaly,
        config: &EngineConfig,
    ) -> f32 {
        let weights = &config.correlation;

        let delta_secs =
            (a.timestamp - b.timestamp).num_milliseconds().abs() as f64 / 1000.0;
        let horizon = weights.time_window_secs.max(1) as f64;
        let time = (1.0 - (delta_secs / horizon).min(1.0)) as f32;

        let mut entity = 0.0f32;
        if a.src_ip == b.src_ip {
            entity += 0.4;
        }
        if a.dst_ip == b.dst_ip {
            entity += 0.4;
        }
        if let (Some(pa), Some(pb)) = (a.dst_port, b.dst_port) {
            if pa == pb {
                entity += 0.2;
            }
        }

        let affinity = type_affinity(a.threat_type, b.threat_type);

        weights.time_weight * time
            + weights.entity_weight * entity
            + weights.affinity_weight * affinity
    }

    /// Group anomalies greedily in input order. Each anomaly joins the
    /// first group whose primary it scores above the threshold with;
    /// an anomaly never moves once claimed.
    pub fn correlate(
        &self,
        anomalies: Vec<RawAnomaly>,
        config: &EngineConfig,
    ) -> CorrelationResult {
        let input_anomalies = anomalies.len();

        // nothing to correlate against
        if input_anomalies <= 1 {
            let groups: Vec<CorrelationGroup> = anomalies
                .into_iter()
                .map(CorrelationGroup::singleton)
                .collect();
            let singletons = groups.len();
            return CorrelationResult {
                stats: CorrelationStats {
                    input_anomalies,
                    groups: singletons,
                    singletons,
                    linked: 0,
                },
                groups,
            };
        }

        let threshold = config.correlation.score_threshold;
        let mut slots: Vec<Option<RawAnomaly>> = anomalies.into_iter().map(Some).collect();
        let mut groups = Vec::new();
        let mut linked = 0;

        for i in 0..slots.len() {
            let Some(primary) = slots[i].take() else {
                continue;
            };

            let mut related = Vec::new();
            for j in (i + 1)..slots.len() {
                let score = match slots[j].as_ref() {
                    Some(candidate) => self.pairwise_score(&primary, candidate, config),
                    None => continue,
                };
                if score > threshold {
                    if let Some(anomaly) = slots[j].take() {
                        related.push(RelatedAnomaly { anomaly, score });
                    }
                }
            }

            linked += related.len();
            groups.push(CorrelationGroup { primary, related });
        }

        let singletons = groups.iter().filter(|g| g.is_singleton()).count();
        debug!(
            input = input_anomalies,
            groups = groups.len(),
            singletons,
            linked,
            "correlation pass complete"
        );

        CorrelationResult {
            stats: CorrelationStats {
                input_anomalies,
                groups: groups.len(),
                singletons,
                linked,
            },
            groups,
        }
    }
}

/// True when no anomaly appears in more than one group. The pipeline
/// treats a violation as batch-fatal.
pub fn groups_disjoint(groups: &[CorrelationGroup]) -> bool {
    let mut seen = std::collections::HashSet::new();
    for group in groups {
        for id in group.member_ids() {
            if !seen.insert(id) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Evidence;
    use chrono::{TimeZone, Utc};

    fn make_anomaly(
        threat: ThreatType,
        src: &str,
        dst: &str,
        offset_secs: i64,
    ) -> RawAnomaly {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
            + chrono::Duration::seconds(offset_secs);
        let evidence = match threat {
            ThreatType::PortScan => Evidence::PortScan {
                unique_ports: 25,
                success_ratio: 0.0,
                sequential: true,
            },
            ThreatType::VolumetricFlood => Evidence::Flood {
                packet_rate: 2000.0,
                distinct_sources: 4,
            },
            ThreatType::BehavioralDeviation => Evidence::Behavioral {
                model: "outlier".to_string(),
                score: 0.95,
            },
            _ => Evidence::TorExit {
                list_source: "unit".to_string(),
            },
        };
        RawAnomaly::new("test", src.parse().unwrap(), dst.parse().unwrap(), evidence)
            .with_confidence(0.9)
            .with_timestamp(ts)
    }

    #[test]
    fn test_affinity_symmetric_unit_diagonal() {
        for a in ThreatType::ALL {
            for b in ThreatType::ALL {
                let forward = type_affinity(a, b);
                assert_eq!(forward, type_affinity(b, a));
                assert!((0.0..=1.0).contains(&forward));
            }
            assert_eq!(type_affinity(a, a), 1.0);
        }
    }

    #[test]
    fn test_single_anomaly_passes_through() {
        let engine = CorrelationEngine::new();
        let config = EngineConfig::default();

        let result = engine.correlate(
            vec![make_anomaly(ThreatType::PortScan, "10.0.0.1", "192.0.2.1", 0)],
            &config,
        );

        assert_eq!(result.groups.len(), 1);
        assert!(result.groups[0].is_singleton());
        assert_eq!(result.stats.singletons, 1);
        assert_eq!(result.stats.linked, 0);
    }

    #[test]
    fn test_close_pair_groups_distant_stays_single() {
        let engine = CorrelationEngine::new();
        let config = EngineConfig::default();

        // b shares source and destination with a at the same instant
        let a = make_anomaly(ThreatType::PortScan, "10.0.0.1", "192.0.2.1", 0);
        let b = make_anomaly(ThreatType::BehavioralDeviation, "10.0.0.1", "192.0.2.1", 0);
        // c shares only the destination, four minutes later, other type
        let c = make_anomaly(ThreatType::VolumetricFlood, "10.0.0.9", "192.0.2.1", 240);

        let score_ab = engine.pairwise_score(&a, &b, &config);
        let score_ac = engine.pairwise_score(&a, &c, &config);
        assert!(score_ab > 0.7, "expected close pair above threshold: {}", score_ab);
        assert!(score_ac < 0.7, "expected distant pair below threshold: {}", score_ac);

        let a_id = a.id;
        let b_id = b.id;
        let c_id = c.id;
        let result = engine.correlate(vec![a, b, c], &config);

        assert_eq!(result.groups.len(), 2);
        assert_eq!(result.groups[0].member_ids(), vec![a_id, b_id]);
        assert_eq!(result.groups[1].member_ids(), vec![c_id]);
        assert_eq!(result.stats.linked, 1);
        assert!(groups_disjoint(&result.groups));
    }

    #[test]
    fn test_first_seen_wins_claims_shared_member() {
        let engine = CorrelationEngine::new();
        let config = EngineConfig::default();

        // b correlates with both a and c; a comes first and claims it
        let a = make_anomaly(ThreatType::PortScan, "10.0.0.1", "192.0.2.1", 0);
        let b = make_anomaly(ThreatType::PortScan, "10.0.0.1", "192.0.2.2", 0);
        let c = make_anomaly(ThreatType::PortScan, "10.0.0.9", "192.0.2.2", 0);

        assert!(engine.pairwise_score(&a, &b, &config) > 0.7);
        assert!(engine.pairwise_score(&b, &c, &config) > 0.7);
        assert!(engine.pairwise_score(&a, &c, &config) < 0.7);

        let ids = [a.id, b.id, c.id];
        let result = engine.correlate(vec![a, b, c], &config);

        assert_eq!(result.groups.len(), 2);
        assert_eq!(result.groups[0].member_ids(), vec![ids[0], ids[1]]);
        assert_eq!(result.groups[1].member_ids(), vec![ids[2]]);
    }

    #[test]
    fn test_correlation_is_deterministic() {
        let engine = CorrelationEngine::new();
        let config = EngineConfig::default();

        let anomalies: Vec<RawAnomaly> = (0..8)
            .map(|i| {
                make_anomaly(
                    if i % 2 == 0 {
                        ThreatType::PortScan
                    } else {
                        ThreatType::BehavioralDeviation
                    },
                    &format!("10.0.0.{}", i % 3 + 1),
                    "192.0.2.1",
                    i * 20,
                )
            })
            .collect();

        let first = engine.correlate(anomalies.clone(), &config);
        let second = engine.correlate(anomalies, &config);

        let shape =
            |r: &CorrelationResult| r.groups.iter().map(|g| g.member_ids()).collect::<Vec<_>>();
        assert_eq!(shape(&first), shape(&second));
        assert!(groups_disjoint(&first.groups));
    }

    #[test]
    fn test_groups_disjoint_detects_overlap() {
        let a = make_anomaly(ThreatType::PortScan, "10.0.0.1", "192.0.2.1", 0);
        let b = make_anomaly(ThreatType::PortScan, "10.0.0.2", "192.0.2.1", 0);

        let good = vec![
            CorrelationGroup::singleton(a.clone()),
            CorrelationGroup::singleton(b.clone()),
        ];
        assert!(groups_disjoint(&good));

        let bad = vec![
            CorrelationGroup::singleton(a.clone()),
            CorrelationGroup {
                primary: b,
                related: vec![RelatedAnomaly {
                    anomaly: a,
                    score: 0.9,
                }],
            },
        ];
        assert!(!groups_disjoint(&bad));
    }
}
