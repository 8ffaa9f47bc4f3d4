pub mod behavioral;
pub mod config;
pub mod core;
pub mod correlation;
pub mod detect;
pub mod intel;
pub mod pipeline;
pub mod resilience;
pub mod sink;
pub mod validation;

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::behavioral::{BehavioralAnalyzer, ModelClient, ModelError, ModelHealth};
use crate::config::{ConfigError, ConfigHandle, EngineConfig};
use crate::core::{FlowRecord, ThreatType};
use crate::detect::DetectorRegistry;
use crate::intel::{Allowlist, IntelSnapshot, IntelStore};
use crate::pipeline::{BatchReport, EngineStats, Pipeline, PipelineError};
use crate::resilience::BreakerSnapshot;
use crate::sink::{AnomalySink, MemorySink};
use crate::validation::{FeedbackStore, ValidationGate};

/// One assembled detection engine: the tiered pipeline plus the shared
/// state it reads (config snapshot, intel lists, analyst feedback).
pub struct Engine {
    config: ConfigHandle,
    intel: Arc<IntelStore>,
    pipeline: Pipeline,
}

impl Engine {
    /// Engine with live HTTP model clients and the in-memory sink
    pub fn new(config: EngineConfig) -> Result<Self> {
        let behavioral = BehavioralAnalyzer::new(&config)?;
        Self::assemble(config, Arc::new(IntelStore::new()), behavioral, MemorySink::shared())
    }

    /// Engine delivering to a caller-supplied sink
    pub fn with_sink(config: EngineConfig, sink: Arc<dyn AnomalySink>) -> Result<Self> {
        let behavioral = BehavioralAnalyzer::new(&config)?;
        Self::assemble(config, Arc::new(IntelStore::new()), behavioral, sink)
    }

    /// Fully injected engine: intel store, model clients, and sink all
    /// supplied by the caller. Tests use this with mocks.
    pub fn with_components(
        config: EngineConfig,
        intel: Arc<IntelStore>,
        outlier: Arc<dyn ModelClient>,
        sequence: Arc<dyn ModelClient>,
        sink: Arc<dyn AnomalySink>,
    ) -> Result<Self> {
        let behavioral = BehavioralAnalyzer::with_clients(outlier, sequence, &config.resilience);
        Self::assemble(config, intel, behavioral, sink)
    }

    fn assemble(
        config: EngineConfig,
        intel: Arc<IntelStore>,
        behavioral: BehavioralAnalyzer,
        sink: Arc<dyn AnomalySink>,
    ) -> Result<Self> {
        let mut allowlist = Allowlist::new();
        for entry in &config.validation.allowlist {
            // validate() vouched for these, but a handle built straight
            // from a struct skips the file path
            if !allowlist.add_entry(entry) {
                warn!(entry = %entry, "ignoring unparseable allowlist entry");
            }
        }

        let handle = ConfigHandle::new(config)?;
        let registry = DetectorRegistry::standard(intel.clone());
        info!(
            detectors = registry.detector_count(),
            allowlist_entries = allowlist.entry_count(),
            sink = sink.name(),
            "engine assembled"
        );

        let pipeline = Pipeline::new(
            handle.clone(),
            registry,
            behavioral,
            ValidationGate::new(allowlist),
            sink,
        );
        Ok(Self {
            config: handle,
            intel,
            pipeline,
        })
    }

    /// Run one time-ordered flow batch through the tiered pipeline
    pub async fn process_batch(
        &self,
        batch: Vec<FlowRecord>,
    ) -> Result<BatchReport, PipelineError> {
        self.pipeline.process_batch(batch).await
    }

    /// Cumulative counters plus breaker and gate health
    pub fn stats(&self) -> EngineStats {
        self.pipeline.stats()
    }

    /// Subscribe to per-batch reports
    pub fn subscribe_reports(&self) -> broadcast::Receiver<BatchReport> {
        self.pipeline.subscribe_reports()
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.current()
    }

    /// Validate and apply a config update; an invalid candidate leaves
    /// the active snapshot untouched
    pub fn apply_config(&self, candidate: EngineConfig) -> Result<(), ConfigError> {
        self.config.apply(candidate)
    }

    /// Reload configuration from a TOML file
    pub fn reload_config<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.config.reload_from(path)
    }

    /// Shared threat list store; refresh jobs swap snapshots through this
    pub fn intel(&self) -> &IntelStore {
        &self.intel
    }

    /// Replace the active threat list snapshot
    pub fn swap_intel(&self, snapshot: IntelSnapshot) {
        self.intel.swap_snapshot(snapshot);
    }

    /// Analyst feedback: suppress future reports of this threat type from
    /// this entity
    pub fn record_dismissal(&self, threat_type: ThreatType, entity: IpAddr) {
        self.pipeline.gate().feedback().record_dismissal(threat_type, entity);
    }

    pub fn feedback(&self) -> &FeedbackStore {
        self.pipeline.gate().feedback()
    }

    /// Circuit breaker positions for both model dependencies
    pub fn model_health(&self) -> Vec<BreakerSnapshot> {
        self.pipeline.behavioral().health()
    }

    /// Active health probe against both model endpoints
    pub async fn probe_models(&self) -> Vec<(String, Result<ModelHealth, ModelError>)> {
        self.pipeline.behavioral().probe().await
    }
}
