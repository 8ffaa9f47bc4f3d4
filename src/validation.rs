//! Validation gate
//!
//! Last stop before emission. Each correlation group runs through an
//! ordered set of checks that short-circuit on the first failure:
//! structural integrity, combined confidence against the gate threshold,
//! then the false-positive filter (allowlist plus analyst dismissals).
//! Groups that pass get a severity from the static threat table and leave
//! as `ValidatedAnomaly`; everything else is suppressed and counted.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::{
    CorrelationGroup, Severity, ThreatType, ValidatedAnomaly, ValidationCheck, Verdict,
};
use crate::intel::Allowlist;

/// Timestamps further in the future than this fail the structural check
const MAX_FUTURE_SKEW_SECS: i64 = 300;

/// Base severity per threat type, elevated one level at very high
/// confidence. Exhaustive over the closed enum.
pub fn assign_severity(threat: ThreatType, confidence: f32) -> Severity {
    let base = match threat {
        ThreatType::CryptoMining | ThreatType::VolumetricFlood => Severity::High,
        ThreatType::PortScan => {
            if confidence >= 0.85 {
                Severity::High
            } else {
                Severity::Medium
            }
        }
        ThreatType::PeriodicBeacon | ThreatType::TorUsage => Severity::Medium,
        ThreatType::BehavioralDeviation => Severity::Low,
    };
    if confidence >= 0.95 {
        base.elevated()
    } else {
        base
    }
}

/// Analyst dismissals keyed by threat type and source entity. Once a pair
/// is dismissed, later reports of the same kind against the same host are
/// suppressed at the gate.
#[derive(Debug, Default)]
pub struct FeedbackStore {
    dismissed: RwLock<HashSet<(ThreatType, IpAddr)>>,
}

impl FeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dismissal(&self, threat_type: ThreatType, entity: IpAddr) {
        if self.dismissed.write().insert((threat_type, entity)) {
            info!(%threat_type, %entity, "analyst dismissal recorded");
        }
    }

    pub fn is_dismissed(&self, threat_type: ThreatType, entity: IpAddr) -> bool {
        self.dismissed.read().contains(&(threat_type, entity))
    }

    pub fn dismissal_count(&self) -> usize {
        self.dismissed.read().len()
    }
}

/// Gate counters for monitoring
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationStats {
    pub emitted: u64,
    pub suppressed_structural: u64,
    pub suppressed_confidence: u64,
    pub suppressed_false_positive: u64,
}

#[derive(Debug, Default)]
struct GateCounters {
    emitted: AtomicU64,
    suppressed_structural: AtomicU64,
    suppressed_confidence: AtomicU64,
    suppressed_false_positive: AtomicU64,
}

/// How one group fared at the gate. Suppressed groups keep their verdict
/// so analyst tooling can see which check stopped them.
#[derive(Debug)]
pub enum GateOutcome {
    Emitted(ValidatedAnomaly),
    Suppressed(Verdict),
}

impl GateOutcome {
    pub fn emitted(self) -> Option<ValidatedAnomaly> {
        match self {
            GateOutcome::Emitted(anomaly) => Some(anomaly),
            GateOutcome::Suppressed(_) => None,
        }
    }

    pub fn failed_check(&self) -> Option<ValidationCheck> {
        match self {
            GateOutcome::Emitted(_) => None,
            GateOutcome::Suppressed(verdict) => verdict.failed,
        }
    }
}

/// The validation gate itself. Shared across batches; checks are
/// read-only apart from the counters.
#[derive(Debug, Default)]
pub struct ValidationGate {
    allowlist: Allowlist,
    feedback: FeedbackStore,
    counters: GateCounters,
}

impl ValidationGate {
    pub fn new(allowlist: Allowlist) -> Self {
        Self {
            allowlist,
            feedback: FeedbackStore::new(),
            counters: GateCounters::default(),
        }
    }

    pub fn feedback(&self) -> &FeedbackStore {
        &self.feedback
    }

    pub fn stats(&self) -> ValidationStats {
        ValidationStats {
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            suppressed_structural: self.counters.suppressed_structural.load(Ordering::Relaxed),
            suppressed_confidence: self.counters.suppressed_confidence.load(Ordering::Relaxed),
            suppressed_false_positive: self
                .counters
                .suppressed_false_positive
                .load(Ordering::Relaxed),
        }
    }

    /// Run one group through the gate, discarding suppression verdicts.
    /// The pipeline uses this form.
    pub fn validate(
        &self,
        group: CorrelationGroup,
        config: &EngineConfig,
    ) -> Option<ValidatedAnomaly> {
        self.evaluate(group, config).emitted()
    }

    /// Run one group through the ordered checks, short-circuiting on the
    /// first failure.
    pub fn evaluate(&self, group: CorrelationGroup, config: &EngineConfig) -> GateOutcome {
        let mut verdict = Verdict::clean();

        if let Err(reason) = self.structural_check(&group) {
            verdict.record_failure(ValidationCheck::Structural, &reason);
            self.counters
                .suppressed_structural
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                threat = %group.primary.threat_type,
                src = %group.primary.src_ip,
                %reason,
                "group failed structural check"
            );
            return GateOutcome::Suppressed(verdict);
        }
        verdict.record_pass(ValidationCheck::Structural);

        let confidence = self.combined_confidence(&group, config);
        if confidence < config.validation.confidence_threshold {
            verdict.record_failure(
                ValidationCheck::Confidence,
                format!(
                    "combined confidence {:.2} below {:.2}",
                    confidence, config.validation.confidence_threshold
                ),
            );
            self.counters
                .suppressed_confidence
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                threat = %group.primary.threat_type,
                src = %group.primary.src_ip,
                confidence,
                "group failed confidence check"
            );
            return GateOutcome::Suppressed(verdict);
        }
        verdict.record_pass(ValidationCheck::Confidence);

        if let Err(reason) = self.false_positive_check(&group) {
            verdict.record_failure(ValidationCheck::FalsePositive, &reason);
            self.counters
                .suppressed_false_positive
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                threat = %group.primary.threat_type,
                src = %group.primary.src_ip,
                %reason,
                "group filtered as false positive"
            );
            return GateOutcome::Suppressed(verdict);
        }
        verdict.record_pass(ValidationCheck::FalsePositive);

        let threat_type = group.primary.threat_type;
        let severity = assign_severity(threat_type, confidence);
        let detected_at = group.primary.timestamp;
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);

        GateOutcome::Emitted(ValidatedAnomaly {
            id: Uuid::new_v4(),
            group,
            confidence,
            verdict,
            severity,
            detected_at,
        })
    }

    /// Singletons keep the detector's confidence; grouped anomalies blend
    /// it with the mean pairwise correlation.
    fn combined_confidence(&self, group: &CorrelationGroup, config: &EngineConfig) -> f32 {
        let weights = &config.validation;
        let combined = match group.mean_correlation() {
            Some(mean) => {
                weights.primary_weight * group.primary.confidence
                    + weights.correlation_weight * mean
            }
            None => group.primary.confidence,
        };
        combined.clamp(0.0, 1.0)
    }

    fn structural_check(&self, group: &CorrelationGroup) -> Result<(), String> {
        let primary = &group.primary;
        if primary.detector.is_empty() {
            return Err("empty detector name".to_string());
        }
        if primary.confidence <= 0.0 {
            return Err("non-positive detector confidence".to_string());
        }
        if primary.evidence.threat_type() != primary.threat_type {
            return Err(format!(
                "evidence kind disagrees with threat type {}",
                primary.threat_type
            ));
        }
        let skew = (primary.timestamp - Utc::now()).num_seconds();
        if skew > MAX_FUTURE_SKEW_SECS {
            return Err(format!("timestamp {}s in the future", skew));
        }
        for related in &group.related {
            if !(0.0..=1.0).contains(&related.score) {
                return Err(format!("correlation score {} out of range", related.score));
            }
        }
        Ok(())
    }

    fn false_positive_check(&self, group: &CorrelationGroup) -> Result<(), String> {
        let primary = &group.primary;
        if self.allowlist.contains(&primary.src_ip) {
            return Err(format!("source {} allowlisted", primary.src_ip));
        }
        if self.allowlist.contains(&primary.dst_ip) {
            return Err(format!("destination {} allowlisted", primary.dst_ip));
        }
        if self
            .feedback
            .is_dismissed(primary.threat_type, primary.src_ip)
        {
            return Err(format!(
                "{} from {} dismissed by analyst",
                primary.threat_type, primary.src_ip
            ));
        }
        Ok(())
    }
}
