//! Core shared types for flow analysis and detection
//!
//! Provides the data structures used by every tier of the engine:
//! - `FlowRecord`: enriched network flow record, the unit of input
//! - `RawAnomaly`: candidate anomaly emitted by a detector
//! - `CorrelationGroup`: related anomalies bundled into one incident
//! - `ValidatedAnomaly`: the final, validated output unit

pub mod anomaly;
pub mod flow;

pub use anomaly::{
    CorrelationGroup, Evidence, RawAnomaly, RelatedAnomaly, Severity, ThreatType,
    ValidatedAnomaly, ValidationCheck, Verdict,
};
pub use flow::{compute_stats, FlowAction, FlowKey, FlowRecord, Protocol};
