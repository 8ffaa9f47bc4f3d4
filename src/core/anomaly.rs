//! Anomaly records produced and consumed by the detection tiers
//!
//! `RawAnomaly` is the unit a detector emits, `CorrelationGroup` bundles
//! related raw anomalies into one incident, and `ValidatedAnomaly` is what
//! leaves the engine after the validation gate. Threat types are a closed
//! enum so affinity and severity tables stay exhaustive at compile time.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of threat categories the engine can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    PortScan,
    VolumetricFlood,
    PeriodicBeacon,
    CryptoMining,
    TorUsage,
    BehavioralDeviation,
}

impl ThreatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatType::PortScan => "port_scan",
            ThreatType::VolumetricFlood => "volumetric_flood",
            ThreatType::PeriodicBeacon => "periodic_beacon",
            ThreatType::CryptoMining => "crypto_mining",
            ThreatType::TorUsage => "tor_usage",
            ThreatType::BehavioralDeviation => "behavioral_deviation",
        }
    }

    pub const ALL: [ThreatType; 6] = [
        ThreatType::PortScan,
        ThreatType::VolumetricFlood,
        ThreatType::PeriodicBeacon,
        ThreatType::CryptoMining,
        ThreatType::TorUsage,
        ThreatType::BehavioralDeviation,
    ];
}

impl std::fmt::Display for ThreatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity level, ordered from informational to critical
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Severity {
    Info = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Severity {
    /// One level up, saturating at Critical
    pub fn elevated(&self) -> Severity {
        match self {
            Severity::Info => Severity::Low,
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High => Severity::Critical,
            Severity::Critical => Severity::Critical,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}

/// Typed evidence payload, one variant per threat type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    PortScan {
        unique_ports: usize,
        success_ratio: f64,
        sequential: bool,
    },
    Flood {
        packet_rate: f64,
        distinct_sources: usize,
    },
    Beacon {
        cv_percent: f64,
        mean_interval_secs: f64,
        connections: usize,
    },
    Mining {
        pool: IpAddr,
        port: u16,
    },
    TorExit {
        list_source: String,
    },
    Behavioral {
        model: String,
        score: f32,
    },
}

impl Evidence {
    /// Threat type this evidence substantiates
    pub fn threat_type(&self) -> ThreatType {
        match self {
            Evidence::PortScan { .. } => ThreatType::PortScan,
            Evidence::Flood { .. } => ThreatType::VolumetricFlood,
            Evidence::Beacon { .. } => ThreatType::PeriodicBeacon,
            Evidence::Mining { .. } => ThreatType::CryptoMining,
            Evidence::TorExit { .. } => ThreatType::TorUsage,
            Evidence::Behavioral { .. } => ThreatType::BehavioralDeviation,
        }
    }
}

/// Candidate anomaly emitted by a statistical detector or behavioral model.
/// Created once, never mutated, discarded after correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAnomaly {
    /// Unique anomaly ID
    pub id: Uuid,
    pub threat_type: ThreatType,
    /// Name of the emitting detector or model
    pub detector: String,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    /// Detector-local confidence in [0, 1]
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
    pub evidence: Evidence,
}

impl RawAnomaly {
    pub fn new(
        detector: impl Into<String>,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        evidence: Evidence,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            threat_type: evidence.threat_type(),
            detector: detector.into(),
            src_ip,
            dst_ip,
            dst_port: None,
            confidence: 0.5,
            timestamp: Utc::now(),
            evidence,
        }
    }

    pub fn with_dst_port(mut self, port: u16) -> Self {
        self.dst_port = Some(port);
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A non-primary group member plus its pairwise score against the primary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedAnomaly {
    pub anomaly: RawAnomaly,
    /// Correlation score against the group primary, in [0, 1]
    pub score: f32,
}

/// Related anomalies bundled into one incident. Groups never overlap:
/// each anomaly belongs to exactly one group per correlation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationGroup {
    pub primary: RawAnomaly,
    pub related: Vec<RelatedAnomaly>,
}

impl CorrelationGroup {
    pub fn singleton(primary: RawAnomaly) -> Self {
        Self {
            primary,
            related: Vec::new(),
        }
    }

    /// Primary plus related count
    pub fn member_count(&self) -> usize {
        1 + self.related.len()
    }

    pub fn is_singleton(&self) -> bool {
        self.related.is_empty()
    }

    /// All members, primary first
    pub fn members(&self) -> impl Iterator<Item = &RawAnomaly> {
        std::iter::once(&self.primary).chain(self.related.iter().map(|r| &r.anomaly))
    }

    pub fn member_ids(&self) -> Vec<Uuid> {
        self.members().map(|a| a.id).collect()
    }

    /// Mean pairwise score against the primary, None for singletons
    pub fn mean_correlation(&self) -> Option<f32> {
        if self.related.is_empty() {
            return None;
        }
        let sum: f32 = self.related.iter().map(|r| r.score).sum();
        Some(sum / self.related.len() as f32)
    }
}

/// Outcome of one validation check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCheck {
    Structural,
    Confidence,
    FalsePositive,
}

impl ValidationCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCheck::Structural => "structural",
            ValidationCheck::Confidence => "confidence",
            ValidationCheck::FalsePositive => "false_positive",
        }
    }
}

/// Per-check record of how a group fared in the validation gate.
/// Checks run in order and short-circuit on the first failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Checks that ran and passed, in gate order
    pub passed: Vec<ValidationCheck>,
    /// First failing check, if the group was suppressed
    pub failed: Option<ValidationCheck>,
    /// Check-specific detail, for logs and analyst review
    pub notes: Vec<String>,
}

impl Verdict {
    pub fn clean() -> Self {
        Self {
            passed: Vec::new(),
            failed: None,
            notes: Vec::new(),
        }
    }

    pub fn record_pass(&mut self, check: ValidationCheck) {
        self.passed.push(check);
    }

    pub fn record_failure(&mut self, check: ValidationCheck, note: impl Into<String>) {
        self.failed = Some(check);
        self.notes.push(note.into());
    }

    pub fn is_pass(&self) -> bool {
        self.failed.is_none()
    }
}

/// Final output unit, immutable once emitted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedAnomaly {
    pub id: Uuid,
    pub group: CorrelationGroup,
    /// Gate confidence, combining detector confidence and correlation
    pub confidence: f32,
    pub verdict: Verdict,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
}

impl ValidatedAnomaly {
    pub fn threat_type(&self) -> ThreatType {
        self.group.primary.threat_type
    }

    /// One-line description for logs
    pub fn summary(&self) -> String {
        format!(
            "{} {} {} -> {} confidence={:.2} members={}",
            self.severity,
            self.threat_type(),
            self.group.primary.src_ip,
            self.group.primary.dst_ip,
            self.confidence,
            self.group.member_count(),
        )
    }
}
