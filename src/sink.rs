//! Validated-anomaly delivery
//!
//! `AnomalySink` is the seam between the engine and downstream consumers.
//! The pipeline delivers each validated anomaly once, in emission order;
//! a failed delivery is logged and counted but never fails the batch.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::core::ValidatedAnomaly;

#[async_trait]
pub trait AnomalySink: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Deliver one validated anomaly downstream
    async fn deliver(&self, anomaly: &ValidatedAnomaly) -> anyhow::Result<()>;
}

/// Append-only in-process sink. Serves as the default target and as the
/// query surface in tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: RwLock<Vec<ValidatedAnomaly>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn count(&self) -> usize {
        self.delivered.read().len()
    }

    /// Snapshot of everything delivered so far, in delivery order
    pub fn all(&self) -> Vec<ValidatedAnomaly> {
        self.delivered.read().clone()
    }

    pub fn find(&self, id: Uuid) -> Option<ValidatedAnomaly> {
        self.delivered.read().iter().find(|a| a.id == id).cloned()
    }

    pub fn clear(&self) {
        self.delivered.write().clear();
    }
}

#[async_trait]
impl AnomalySink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, anomaly: &ValidatedAnomaly) -> anyhow::Result<()> {
        debug!(id = %anomaly.id, "{}", anomaly.summary());
        self.delivered.write().push(anomaly.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CorrelationGroup, Evidence, RawAnomaly, Severity, Verdict};
    use chrono::Utc;

    fn make_validated() -> ValidatedAnomaly {
        let raw = RawAnomaly::new(
            "tor",
            "203.0.113.50".parse().unwrap(),
            "10.0.0.8".parse().unwrap(),
            Evidence::TorExit {
                list_source: "unit".to_string(),
            },
        )
        .with_confidence(0.85);
        ValidatedAnomaly {
            id: Uuid::new_v4(),
            group: CorrelationGroup::singleton(raw),
            confidence: 0.85,
            verdict: Verdict::clean(),
            severity: Severity::Medium,
            detected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_sink_appends_and_finds() {
        let sink = MemorySink::new();
        let first = make_validated();
        let second = make_validated();

        sink.deliver(&first).await.unwrap();
        sink.deliver(&second).await.unwrap();

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.all()[0].id, first.id);
        assert_eq!(sink.find(second.id).map(|a| a.id), Some(second.id));
        assert!(sink.find(Uuid::new_v4()).is_none());

        sink.clear();
        assert_eq!(sink.count(), 0);
    }
}
