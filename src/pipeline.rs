//! Tiered pipeline orchestrator
//!
//! Drives each flow batch through the tier sequence
//! statistical screen -> behavioral screen -> correlate -> validate -> emit,
//! returning to idle early when the statistical screen comes back clean.
//! Every tier runs under a soft timeout clipped to the batch deadline; a
//! tier that runs out of budget contributes partial or empty results and
//! marks the batch degraded instead of blocking the pipeline. One pipeline
//! value serves concurrent batches; all shared state is atomic or swapped
//! behind `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::behavioral::BehavioralAnalyzer;
use crate::config::{ConfigHandle, EngineConfig};
use crate::core::{CorrelationGroup, FlowRecord, RawAnomaly, ValidatedAnomaly};
use crate::correlation::{groups_disjoint, CorrelationEngine};
use crate::detect::DetectorRegistry;
use crate::resilience::BreakerSnapshot;
use crate::sink::AnomalySink;
use crate::validation::{ValidationGate, ValidationStats};

/// Capacity of the batch report broadcast channel; slow subscribers lag
/// rather than block the pipeline.
const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Position of one batch in the tier sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Idle,
    StatisticalScreen,
    BehavioralScreen,
    Correlate,
    Validate,
    Emit,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Idle => "idle",
            PipelineStage::StatisticalScreen => "statistical_screen",
            PipelineStage::BehavioralScreen => "behavioral_screen",
            PipelineStage::Correlate => "correlate",
            PipelineStage::Validate => "validate",
            PipelineStage::Emit => "emit",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Batch-fatal failures. The offending batch is dropped; the pipeline
/// keeps accepting new batches.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("batch {batch_id}: correlation produced overlapping groups")]
    OverlappingGroups { batch_id: Uuid },
}

/// Wall-clock spent per tier, in milliseconds
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TierLatencies {
    pub statistical_ms: u64,
    pub behavioral_ms: u64,
    pub correlation_ms: u64,
    pub validation_ms: u64,
}

/// Per-batch outcome, published to report subscribers
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    /// Records handed in, including malformed ones
    pub records: usize,
    pub skipped_records: usize,
    pub statistical_hits: usize,
    pub behavioral_hits: usize,
    pub groups: usize,
    pub validated: usize,
    pub delivered: usize,
    pub sink_failures: usize,
    /// True when any tier was cut off by its budget or the batch deadline
    pub degraded: bool,
    pub timed_out_tiers: Vec<String>,
    pub latencies: TierLatencies,
    pub total_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Cumulative counters since engine start
#[derive(Debug, Default)]
struct EngineCounters {
    batches: AtomicU64,
    batches_degraded: AtomicU64,
    batches_failed: AtomicU64,
    records_seen: AtomicU64,
    records_skipped: AtomicU64,
    statistical_anomalies: AtomicU64,
    behavioral_anomalies: AtomicU64,
    groups_built: AtomicU64,
    anomalies_validated: AtomicU64,
    sink_failures: AtomicU64,
}

/// Point-in-time view of the engine counters plus downstream health
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub batches: u64,
    pub batches_degraded: u64,
    pub batches_failed: u64,
    pub records_seen: u64,
    pub records_skipped: u64,
    pub statistical_anomalies: u64,
    pub behavioral_anomalies: u64,
    pub groups_built: u64,
    pub anomalies_validated: u64,
    pub sink_failures: u64,
    pub validation: ValidationStats,
    pub model_breakers: Vec<BreakerSnapshot>,
}

/// The orchestrator. Construction wires the tiers together; afterwards
/// `process_batch` may be called from any number of tasks concurrently.
pub struct Pipeline {
    config: ConfigHandle,
    registry: Arc<DetectorRegistry>,
    behavioral: Arc<BehavioralAnalyzer>,
    correlator: Arc<CorrelationEngine>,
    gate: Arc<ValidationGate>,
    sink: Arc<dyn AnomalySink>,
    counters: EngineCounters,
    reports: broadcast::Sender<BatchReport>,
}

impl Pipeline {
    pub fn new(
        config: ConfigHandle,
        registry: DetectorRegistry,
        behavioral: BehavioralAnalyzer,
        gate: ValidationGate,
        sink: Arc<dyn AnomalySink>,
    ) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            config,
            registry: Arc::new(registry),
            behavioral: Arc::new(behavioral),
            correlator: Arc::new(CorrelationEngine::new()),
            gate: Arc::new(gate),
            sink,
            counters: EngineCounters::default(),
            reports,
        }
    }

    /// Subscribe to per-batch reports. Lagging receivers drop old reports.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<BatchReport> {
        self.reports.subscribe()
    }

    pub fn behavioral(&self) -> &BehavioralAnalyzer {
        &self.behavioral
    }

    pub fn gate(&self) -> &ValidationGate {
        &self.gate
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            batches: self.counters.batches.load(Ordering::Relaxed),
            batches_degraded: self.counters.batches_degraded.load(Ordering::Relaxed),
            batches_failed: self.counters.batches_failed.load(Ordering::Relaxed),
            records_seen: self.counters.records_seen.load(Ordering::Relaxed),
            records_skipped: self.counters.records_skipped.load(Ordering::Relaxed),
            statistical_anomalies: self.counters.statistical_anomalies.load(Ordering::Relaxed),
            behavioral_anomalies: self.counters.behavioral_anomalies.load(Ordering::Relaxed),
            groups_built: self.counters.groups_built.load(Ordering::Relaxed),
            anomalies_validated: self.counters.anomalies_validated.load(Ordering::Relaxed),
            sink_failures: self.counters.sink_failures.load(Ordering::Relaxed),
            validation: self.gate.stats(),
            model_breakers: self.behavioral.health(),
        }
    }

    /// Run one time-ordered flow batch through every tier. `Ok` carries
    /// the batch report whether or not the run degraded; `Err` is reserved
    /// for batch-fatal invariant violations.
    pub async fn process_batch(
        &self,
        batch: Vec<FlowRecord>,
    ) -> Result<BatchReport, PipelineError> {
        let config = self.config.current();
        let batch_id = Uuid::new_v4();
        let started = Instant::now();
        let deadline = started + Duration::from_secs(config.pipeline.sla_secs);
        let mut latencies = TierLatencies::default();
        let mut timed_out: Vec<String> = Vec::new();

        let received = batch.len();
        self.counters
            .records_seen
            .fetch_add(received as u64, Ordering::Relaxed);

        let (batch, skipped_records) = screen_records(batch);
        if skipped_records > 0 {
            self.counters
                .records_skipped
                .fetch_add(skipped_records as u64, Ordering::Relaxed);
            warn!(
                batch = %batch_id,
                skipped = skipped_records,
                "dropped malformed flow records"
            );
        }
        let batch = Arc::new(batch);

        debug!(
            batch = %batch_id,
            records = batch.len(),
            stage = %PipelineStage::StatisticalScreen,
            "batch accepted"
        );

        let tier_start = Instant::now();
        let budget = tier_budget(config.pipeline.statistical_timeout_ms, deadline);
        let (statistical, cut_off) = self
            .run_statistical(&batch, &config, budget, batch_id)
            .await;
        latencies.statistical_ms = tier_start.elapsed().as_millis() as u64;
        if cut_off {
            timed_out.push(PipelineStage::StatisticalScreen.as_str().to_string());
        }
        let statistical_hits = statistical.len();
        self.counters
            .statistical_anomalies
            .fetch_add(statistical_hits as u64, Ordering::Relaxed);

        // clean batch: back to idle without waking the model tier
        if statistical.is_empty() {
            debug!(
                batch = %batch_id,
                stage = %PipelineStage::Idle,
                "no statistical candidates, behavioral tier skipped"
            );
            let report = BatchReport {
                batch_id,
                records: received,
                skipped_records,
                statistical_hits: 0,
                behavioral_hits: 0,
                groups: 0,
                validated: 0,
                delivered: 0,
                sink_failures: 0,
                degraded: !timed_out.is_empty(),
                timed_out_tiers: timed_out,
                latencies,
                total_ms: started.elapsed().as_millis() as u64,
                completed_at: Utc::now(),
            };
            return Ok(self.publish(report));
        }

        let tier_start = Instant::now();
        let budget = tier_budget(config.pipeline.behavioral_timeout_ms, deadline);
        let (behavioral, cut_off) = self.run_behavioral(&batch, &config, budget, batch_id).await;
        latencies.behavioral_ms = tier_start.elapsed().as_millis() as u64;
        if cut_off {
            timed_out.push(PipelineStage::BehavioralScreen.as_str().to_string());
        }
        let behavioral_hits = behavioral.len();
        self.counters
            .behavioral_anomalies
            .fetch_add(behavioral_hits as u64, Ordering::Relaxed);

        // stable merge: registration order first, model output after
        let mut merged = statistical;
        merged.extend(behavioral);

        let tier_start = Instant::now();
        let budget = tier_budget(config.pipeline.correlation_timeout_ms, deadline);
        let (groups, cut_off) = self.run_correlation(merged, &config, budget, batch_id).await;
        latencies.correlation_ms = tier_start.elapsed().as_millis() as u64;
        if cut_off {
            timed_out.push(PipelineStage::Correlate.as_str().to_string());
        }

        if !groups_disjoint(&groups) {
            self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
            error!(
                batch = %batch_id,
                groups = groups.len(),
                "overlapping correlation groups, dropping batch"
            );
            return Err(PipelineError::OverlappingGroups { batch_id });
        }
        let group_count = groups.len();
        self.counters
            .groups_built
            .fetch_add(group_count as u64, Ordering::Relaxed);

        let tier_start = Instant::now();
        let budget = tier_budget(config.pipeline.validation_timeout_ms, deadline);
        let (validated, cut_off) = self.run_validation(groups, &config, budget, batch_id).await;
        latencies.validation_ms = tier_start.elapsed().as_millis() as u64;
        if cut_off {
            timed_out.push(PipelineStage::Validate.as_str().to_string());
        }
        self.counters
            .anomalies_validated
            .fetch_add(validated.len() as u64, Ordering::Relaxed);

        debug!(
            batch = %batch_id,
            stage = %PipelineStage::Emit,
            count = validated.len(),
            "delivering validated anomalies"
        );
        let mut delivered = 0;
        let mut sink_failures = 0;
        for anomaly in &validated {
            match self.sink.deliver(anomaly).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    sink_failures += 1;
                    self.counters.sink_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        batch = %batch_id,
                        sink = self.sink.name(),
                        anomaly = %anomaly.id,
                        "failed to deliver anomaly: {}",
                        e
                    );
                }
            }
        }

        let report = BatchReport {
            batch_id,
            records: received,
            skipped_records,
            statistical_hits,
            behavioral_hits,
            groups: group_count,
            validated: validated.len(),
            delivered,
            sink_failures,
            degraded: !timed_out.is_empty(),
            timed_out_tiers: timed_out,
            latencies,
            total_ms: started.elapsed().as_millis() as u64,
            completed_at: Utc::now(),
        };
        Ok(self.publish(report))
    }

    /// Record, log, and broadcast one finished batch
    fn publish(&self, report: BatchReport) -> BatchReport {
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        if report.degraded {
            self.counters.batches_degraded.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            batch = %report.batch_id,
            records = report.records,
            statistical = report.statistical_hits,
            behavioral = report.behavioral_hits,
            groups = report.groups,
            validated = report.validated,
            degraded = report.degraded,
            total_ms = report.total_ms,
            "batch complete"
        );
        let _ = self.reports.send(report.clone());
        report
    }

    /// Fan the batch out to all registered detectors under the worker
    /// semaphore, then merge their output in registration order. Detectors
    /// that fail or miss the budget contribute nothing.
    async fn run_statistical(
        &self,
        batch: &Arc<Vec<FlowRecord>>,
        config: &Arc<EngineConfig>,
        budget: Duration,
        batch_id: Uuid,
    ) -> (Vec<RawAnomaly>, bool) {
        if self.registry.detector_count() == 0 || batch.is_empty() {
            return (Vec::new(), false);
        }
        if budget.is_zero() {
            warn!(batch = %batch_id, "no budget left for the statistical tier");
            return (Vec::new(), true);
        }

        let semaphore = Arc::new(Semaphore::new(config.pipeline.detector_workers.max(1)));
        let mut tasks: JoinSet<(usize, Vec<RawAnomaly>)> = JoinSet::new();
        for (index, detector) in self.registry.detectors().iter().enumerate() {
            let detector = detector.clone();
            let semaphore = semaphore.clone();
            let batch = batch.clone();
            let config = config.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    // the semaphore lives as long as the tasks; closure
                    // cannot happen mid-batch
                    Err(_) => return (index, Vec::new()),
                };
                (index, detector.detect(&batch, &config))
            });
        }

        let mut slots: Vec<Option<Vec<RawAnomaly>>> =
            vec![None; self.registry.detector_count()];
        let collect = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, anomalies)) => {
                        if let Some(slot) = slots.get_mut(index) {
                            *slot = Some(anomalies);
                        }
                    }
                    Err(e) => {
                        error!(batch = %batch_id, "detector worker failed: {}", e);
                    }
                }
            }
        };
        let cut_off = tokio::time::timeout(budget, collect).await.is_err();
        if cut_off {
            tasks.abort_all();
            warn!(
                batch = %batch_id,
                budget_ms = budget.as_millis() as u64,
                "statistical tier timed out, keeping partial results"
            );
        }

        let mut anomalies = Vec::new();
        for finished in slots.into_iter().flatten() {
            anomalies.extend(finished);
        }
        (anomalies, cut_off)
    }

    async fn run_behavioral(
        &self,
        batch: &Arc<Vec<FlowRecord>>,
        config: &Arc<EngineConfig>,
        budget: Duration,
        batch_id: Uuid,
    ) -> (Vec<RawAnomaly>, bool) {
        if budget.is_zero() {
            warn!(batch = %batch_id, "no budget left for the behavioral tier");
            return (Vec::new(), true);
        }
        match tokio::time::timeout(budget, self.behavioral.analyze(batch, config)).await {
            Ok(anomalies) => (anomalies, false),
            Err(_) => {
                warn!(
                    batch = %batch_id,
                    budget_ms = budget.as_millis() as u64,
                    "behavioral tier timed out, continuing without model results"
                );
                (Vec::new(), true)
            }
        }
    }

    async fn run_correlation(
        &self,
        anomalies: Vec<RawAnomaly>,
        config: &Arc<EngineConfig>,
        budget: Duration,
        batch_id: Uuid,
    ) -> (Vec<CorrelationGroup>, bool) {
        if budget.is_zero() {
            warn!(batch = %batch_id, "no budget left for the correlation tier");
            return (Vec::new(), true);
        }
        let correlator = self.correlator.clone();
        let config = config.clone();
        let work = tokio::task::spawn_blocking(move || correlator.correlate(anomalies, &config));
        match tokio::time::timeout(budget, work).await {
            Ok(Ok(result)) => {
                debug!(
                    batch = %batch_id,
                    stage = %PipelineStage::Correlate,
                    groups = result.stats.groups,
                    singletons = result.stats.singletons,
                    linked = result.stats.linked,
                    "correlation complete"
                );
                (result.groups, false)
            }
            Ok(Err(e)) => {
                error!(batch = %batch_id, "correlation worker failed: {}", e);
                (Vec::new(), false)
            }
            Err(_) => {
                warn!(
                    batch = %batch_id,
                    budget_ms = budget.as_millis() as u64,
                    "correlation tier timed out, dropping candidate anomalies"
                );
                (Vec::new(), true)
            }
        }
    }

    async fn run_validation(
        &self,
        groups: Vec<CorrelationGroup>,
        config: &Arc<EngineConfig>,
        budget: Duration,
        batch_id: Uuid,
    ) -> (Vec<ValidatedAnomaly>, bool) {
        if groups.is_empty() {
            return (Vec::new(), false);
        }
        if budget.is_zero() {
            warn!(batch = %batch_id, "no budget left for the validation tier");
            return (Vec::new(), true);
        }
        let gate = self.gate.clone();
        let config = config.clone();
        let work = tokio::task::spawn_blocking(move || {
            groups
                .into_iter()
                .filter_map(|group| gate.validate(group, &config))
                .collect::<Vec<_>>()
        });
        match tokio::time::timeout(budget, work).await {
            Ok(Ok(validated)) => (validated, false),
            Ok(Err(e)) => {
                error!(batch = %batch_id, "validation worker failed: {}", e);
                (Vec::new(), false)
            }
            Err(_) => {
                warn!(
                    batch = %batch_id,
                    budget_ms = budget.as_millis() as u64,
                    "validation tier timed out, suppressing remaining groups"
                );
                (Vec::new(), true)
            }
        }
    }
}

/// Tier budget: the configured soft timeout, clipped to whatever is left
/// of the batch deadline.
fn tier_budget(tier_ms: u64, deadline: Instant) -> Duration {
    Duration::from_millis(tier_ms).min(deadline.saturating_duration_since(Instant::now()))
}

/// Drop records the detectors cannot interpret, keeping time order
fn screen_records(batch: Vec<FlowRecord>) -> (Vec<FlowRecord>, usize) {
    let before = batch.len();
    let kept: Vec<FlowRecord> = batch.into_iter().filter(FlowRecord::is_wellformed).collect();
    let skipped = before - kept.len();
    (kept, skipped)
}
