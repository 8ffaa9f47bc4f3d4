//! Statistical detector set
//!
//! Five independent, stateless-per-window detectors scan each flow batch:
//! - `port_scan`: unique destination ports per source
//! - `flood`: packet rate toward one (destination, port)
//! - `beacon`: low-variance connection timing
//! - `mining`: pool list plus stratum port signature
//! - `tor`: exit node list membership
//!
//! Detectors are registered in a fixed order so merged output stays
//! deterministic across runs. A failure in one detector never blocks the
//! others; the pipeline isolates each worker.

pub mod beacon;
pub mod flood;
pub mod mining;
pub mod port_scan;
pub mod tor;

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::core::{FlowRecord, RawAnomaly, ThreatType};
use crate::intel::IntelStore;

pub use beacon::BeaconDetector;
pub use flood::FloodDetector;
pub use mining::MiningDetector;
pub use port_scan::PortScanDetector;
pub use tor::TorDetector;

/// One statistical detector. Implementations are pure over the batch they
/// are handed plus the config snapshot; any shared state (list snapshots)
/// is read-only for the duration of a call.
pub trait FlowDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn threat_type(&self) -> ThreatType;

    /// Scan a time-ordered batch and emit candidate anomalies.
    /// Malformed records have already been filtered out.
    fn detect(&self, batch: &[FlowRecord], config: &EngineConfig) -> Vec<RawAnomaly>;
}

/// Fixed-order detector registry. Registration order defines the merge
/// order of detector output within a batch.
pub struct DetectorRegistry {
    detectors: Vec<Arc<dyn FlowDetector>>,
}

impl DetectorRegistry {
    /// The standard five detectors in their canonical order.
    pub fn standard(intel: Arc<IntelStore>) -> Self {
        Self {
            detectors: vec![
                Arc::new(PortScanDetector::new()),
                Arc::new(FloodDetector::new()),
                Arc::new(BeaconDetector::new()),
                Arc::new(MiningDetector::new(intel.clone())),
                Arc::new(TorDetector::new(intel)),
            ],
        }
    }

    pub fn empty() -> Self {
        Self {
            detectors: Vec::new(),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn FlowDetector>) -> Self {
        self.detectors.push(detector);
        self
    }

    pub fn detectors(&self) -> &[Arc<dyn FlowDetector>] {
        &self.detectors
    }

    pub fn detector_count(&self) -> usize {
        self.detectors.len()
    }
}

/// Restrict a time-ordered batch to the trailing detection window ending
/// at the newest record. Callers handing in exactly one window get the
/// whole batch back.
pub(crate) fn trailing_window(batch: &[FlowRecord], window_secs: u64) -> &[FlowRecord] {
    let Some(last) = batch.last() else {
        return batch;
    };
    let cutoff = last.window_start - chrono::Duration::seconds(window_secs as i64);
    let start = batch.partition_point(|r| r.window_start < cutoff);
    &batch[start..]
}
