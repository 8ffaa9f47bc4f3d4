//! Behavioral model tier
//!
//! Runs the outlier model and the sequence model in parallel over a flow
//! batch, each call wrapped in its own circuit breaker and retry policy.
//! The tier only runs when the statistical tier already found something;
//! a model that is down, slow, or skipped contributes nothing instead of
//! failing the batch.

pub mod client;
pub mod features;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::config::{EngineConfig, ResilienceConfig};
use crate::core::{Evidence, FlowRecord, RawAnomaly};
use crate::resilience::{BreakerSnapshot, CallOutcome, CircuitBreaker, RetryPolicy};

pub use client::{HttpModelClient, ModelClient, ModelError, ModelHealth};
pub use features::{flow_features, sequence_windows, SequenceWindow, FLOW_FEATURES};

/// Adapter over the two learned models
pub struct BehavioralAnalyzer {
    outlier: Arc<dyn ModelClient>,
    sequence: Arc<dyn ModelClient>,
    outlier_breaker: Arc<CircuitBreaker>,
    sequence_breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    invocations: AtomicU64,
}

impl BehavioralAnalyzer {
    /// Build HTTP clients from the configured endpoints
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let timeout = config.behavioral.request_timeout_secs;
        let outlier = Arc::new(HttpModelClient::new(
            "outlier",
            &config.behavioral.outlier_url,
            timeout,
        )?);
        let sequence = Arc::new(HttpModelClient::new(
            "sequence",
            &config.behavioral.sequence_url,
            timeout,
        )?);
        Ok(Self::with_clients(outlier, sequence, &config.resilience))
    }

    /// Inject model clients directly. Tests use this with mocks.
    pub fn with_clients(
        outlier: Arc<dyn ModelClient>,
        sequence: Arc<dyn ModelClient>,
        resilience: &ResilienceConfig,
    ) -> Self {
        Self {
            outlier_breaker: Arc::new(CircuitBreaker::from_config("model.outlier", resilience)),
            sequence_breaker: Arc::new(CircuitBreaker::from_config("model.sequence", resilience)),
            retry: RetryPolicy::from_config(resilience),
            outlier,
            sequence,
            invocations: AtomicU64::new(0),
        }
    }

    /// Score one batch with both models concurrently and merge their
    /// anomalies, outlier results first. Never fails: model errors and
    /// open circuits degrade to an empty contribution.
    pub async fn analyze(&self, batch: &[FlowRecord], config: &EngineConfig) -> Vec<RawAnomaly> {
        if !config.behavioral.enabled {
            return Vec::new();
        }
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let (mut anomalies, sequence_anomalies) = tokio::join!(
            self.run_outlier(batch, config),
            self.run_sequence(batch, config),
        );
        anomalies.extend(sequence_anomalies);
        anomalies
    }

    /// Times `analyze` actually ran a model pass
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Breaker state for both models
    pub fn health(&self) -> Vec<BreakerSnapshot> {
        vec![
            self.outlier_breaker.snapshot(),
            self.sequence_breaker.snapshot(),
        ]
    }

    /// Active health probe against both model endpoints
    pub async fn probe(&self) -> Vec<(String, Result<ModelHealth, ModelError>)> {
        let (outlier, sequence) =
            tokio::join!(self.outlier.health_check(), self.sequence.health_check());
        vec![
            (self.outlier.name().to_string(), outlier),
            (self.sequence.name().to_string(), sequence),
        ]
    }

    async fn run_outlier(&self, batch: &[FlowRecord], config: &EngineConfig) -> Vec<RawAnomaly> {
        let feature_rows: Vec<Vec<f32>> = batch.iter().map(flow_features).collect();
        if feature_rows.is_empty() {
            return Vec::new();
        }

        let outcome = self
            .outlier_breaker
            .call(&self.retry, || self.outlier.score(&feature_rows))
            .await;

        let scores = match outcome {
            CallOutcome::Success(scores) => scores,
            CallOutcome::Skipped => {
                debug!(model = self.outlier.name(), "circuit open, model skipped");
                return Vec::new();
            }
            CallOutcome::Failed(e) => {
                warn!(
                    model = self.outlier.name(),
                    error = %e,
                    "model unavailable, continuing without its contribution"
                );
                return Vec::new();
            }
        };

        let threshold = config.behavioral.outlier_score_threshold;
        let mut anomalies = Vec::new();
        for (record, score) in batch.iter().zip(scores) {
            if score <= threshold {
                continue;
            }
            debug!(
                model = self.outlier.name(),
                src = %record.src_ip,
                score,
                "outlier flow flagged"
            );
            anomalies.push(
                RawAnomaly::new(
                    self.outlier.name(),
                    record.src_ip,
                    record.dst_ip,
                    Evidence::Behavioral {
                        model: self.outlier.name().to_string(),
                        score,
                    },
                )
                .with_dst_port(record.dst_port)
                .with_confidence(score)
                .with_timestamp(record.window_start),
            );
        }
        anomalies
    }

    async fn run_sequence(&self, batch: &[FlowRecord], config: &EngineConfig) -> Vec<RawAnomaly> {
        let windows = sequence_windows(batch, config.behavioral.sequence_length);
        if windows.is_empty() {
            return Vec::new();
        }
        let feature_rows: Vec<Vec<f32>> =
            windows.iter().map(|w| w.features.clone()).collect();

        let outcome = self
            .sequence_breaker
            .call(&self.retry, || self.sequence.score(&feature_rows))
            .await;

        let errors = match outcome {
            CallOutcome::Success(errors) => errors,
            CallOutcome::Skipped => {
                debug!(model = self.sequence.name(), "circuit open, model skipped");
                return Vec::new();
            }
            CallOutcome::Failed(e) => {
                warn!(
                    model = self.sequence.name(),
                    error = %e,
                    "model unavailable, continuing without its contribution"
                );
                return Vec::new();
            }
        };

        // keep only the worst window per source
        let mut best: BTreeMap<IpAddr, (usize, f32)> = BTreeMap::new();
        for (index, error) in errors.iter().enumerate() {
            let src = windows[index].src_ip;
            let entry = best.entry(src).or_insert((index, *error));
            if *error > entry.1 {
                *entry = (index, *error);
            }
        }

        let threshold = config.behavioral.sequence_error_threshold;
        let mut anomalies = Vec::new();
        for (src, (index, error)) in best {
            if error <= threshold {
                continue;
            }
            let window = &windows[index];
            let confidence = 0.7 + 0.3 * ((error - threshold) / threshold).min(1.0);
            debug!(
                model = self.sequence.name(),
                src = %src,
                reconstruction_error = error,
                "sequence deviation flagged"
            );
            anomalies.push(
                RawAnomaly::new(
                    self.sequence.name(),
                    window.src_ip,
                    window.dst_ip,
                    Evidence::Behavioral {
                        model: self.sequence.name().to_string(),
                        score: error,
                    },
                )
                .with_dst_port(window.dst_port)
                .with_confidence(confidence)
                .with_timestamp(window.timestamp),
            );
        }
        anomalies
    }
}
