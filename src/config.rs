//! Engine configuration
//!
//! Every tunable threshold lives here as a typed, validated struct. The
//! running engine holds an immutable snapshot behind a `ConfigHandle`;
//! reloads swap the whole snapshot only after validation, so an invalid
//! update never replaces the last known good configuration.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// A config value rejected during validation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub window: WindowConfig,

    #[serde(default)]
    pub port_scan: PortScanConfig,

    #[serde(default)]
    pub flood: FloodConfig,

    #[serde(default)]
    pub beacon: BeaconConfig,

    #[serde(default)]
    pub mining: MiningConfig,

    #[serde(default)]
    pub tor: TorConfig,

    #[serde(default)]
    pub behavioral: BehavioralConfig,

    #[serde(default)]
    pub correlation: CorrelationConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub resilience: ResilienceConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Detection window settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Detection window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
        }
    }
}

/// Port scan detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortScanConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Unique destination ports per source before an anomaly is raised
    #[serde(default = "default_unique_port_threshold")]
    pub unique_port_threshold: usize,

    /// Success ratio below which confidence is boosted
    #[serde(default = "default_success_ratio_ceiling")]
    pub success_ratio_ceiling: f64,
}

fn default_unique_port_threshold() -> usize {
    20
}

fn default_success_ratio_ceiling() -> f64 {
    0.10
}

impl Default for PortScanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            unique_port_threshold: default_unique_port_threshold(),
            success_ratio_ceiling: default_success_ratio_ceiling(),
        }
    }
}

/// Volumetric flood detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Packets per second toward one (destination, port) before alerting
    #[serde(default = "default_packet_rate_threshold")]
    pub packet_rate_threshold: f64,
}

fn default_packet_rate_threshold() -> f64 {
    1000.0
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            packet_rate_threshold: default_packet_rate_threshold(),
        }
    }
}

/// Periodic beacon detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum connections to one destination before timing is analyzed
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// Coefficient of variation (percent) below which timing is periodic
    #[serde(default = "default_max_cv_percent")]
    pub max_cv_percent: f64,

    /// Shortest plausible beacon interval in seconds
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: f64,

    /// Longest plausible beacon interval in seconds
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: f64,
}

fn default_min_connections() -> usize {
    10
}

fn default_max_cv_percent() -> f64 {
    10.0
}

fn default_min_interval_secs() -> f64 {
    30.0
}

fn default_max_interval_secs() -> f64 {
    7200.0
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_connections: default_min_connections(),
            max_cv_percent: default_max_cv_percent(),
            min_interval_secs: default_min_interval_secs(),
            max_interval_secs: default_max_interval_secs(),
        }
    }
}

/// Crypto mining detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Stratum ports that, combined with a pool IP match, indicate mining
    #[serde(default = "default_mining_ports")]
    pub ports: Vec<u16>,
}

fn default_mining_ports() -> Vec<u16> {
    vec![3333, 4444, 9999]
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: default_mining_ports(),
        }
    }
}

/// Tor exit detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Behavioral model tier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehavioralConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Outlier model scoring endpoint
    #[serde(default = "default_outlier_url")]
    pub outlier_url: String,

    /// Sequence model scoring endpoint
    #[serde(default = "default_sequence_url")]
    pub sequence_url: String,

    /// Outlier score above which a record is flagged
    #[serde(default = "default_outlier_score_threshold")]
    pub outlier_score_threshold: f32,

    /// Reconstruction error above which a window is flagged.
    /// Calibrated offline to the 95th percentile of baseline error.
    #[serde(default = "default_sequence_error_threshold")]
    pub sequence_error_threshold: f32,

    /// Sliding window length fed to the sequence model
    #[serde(default = "default_sequence_length")]
    pub sequence_length: usize,

    /// Per-request timeout for model calls, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_outlier_url() -> String {
    "http://127.0.0.1:8900/v1/outlier/score".to_string()
}

fn default_sequence_url() -> String {
    "http://127.0.0.1:8900/v1/sequence/score".to_string()
}

fn default_outlier_score_threshold() -> f32 {
    0.90
}

fn default_sequence_error_threshold() -> f32 {
    2.5
}

fn default_sequence_length() -> usize {
    50
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for BehavioralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            outlier_url: default_outlier_url(),
            sequence_url: default_sequence_url(),
            outlier_score_threshold: default_outlier_score_threshold(),
            sequence_error_threshold: default_sequence_error_threshold(),
            sequence_length: default_sequence_length(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Correlation engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Pairwise score above which two anomalies join one group
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,

    /// Time proximity decays linearly to zero at this horizon
    #[serde(default = "default_time_window_secs")]
    pub time_window_secs: u64,

    /// Weight of the time proximity component
    #[serde(default = "default_time_weight")]
    pub time_weight: f32,

    /// Weight of the entity similarity component
    #[serde(default = "default_entity_weight")]
    pub entity_weight: f32,

    /// Weight of the threat type affinity component
    #[serde(default = "default_affinity_weight")]
    pub affinity_weight: f32,
}

fn default_score_threshold() -> f32 {
    0.7
}

fn default_time_window_secs() -> u64 {
    300
}

fn default_time_weight() -> f32 {
    0.4
}

fn default_entity_weight() -> f32 {
    0.4
}

fn default_affinity_weight() -> f32 {
    0.2
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            score_threshold: default_score_threshold(),
            time_window_secs: default_time_window_secs(),
            time_weight: default_time_weight(),
            entity_weight: default_entity_weight(),
            affinity_weight: default_affinity_weight(),
        }
    }
}

/// Validation gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Gate confidence below which a group is suppressed
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Weight of the primary anomaly's detector confidence
    #[serde(default = "default_primary_weight")]
    pub primary_weight: f32,

    /// Weight of the group's mean pairwise correlation
    #[serde(default = "default_correlation_weight")]
    pub correlation_weight: f32,

    /// Known-benign entities, bare IPs or CIDR blocks, never reported
    #[serde(default)]
    pub allowlist: Vec<String>,
}

fn default_confidence_threshold() -> f32 {
    0.8
}

fn default_primary_weight() -> f32 {
    0.6
}

fn default_correlation_weight() -> f32 {
    0.4
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            primary_weight: default_primary_weight(),
            correlation_weight: default_correlation_weight(),
            allowlist: Vec::new(),
        }
    }
}

/// Circuit breaker and retry settings shared by all external dependencies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Consecutive failures before a breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open breaker waits before allowing a probe
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,

    /// Attempts per call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Retry delay cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter fraction applied to each delay, in [0, 1]
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

/// Pipeline orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Concurrent statistical detector workers
    #[serde(default = "default_detector_workers")]
    pub detector_workers: usize,

    /// Soft timeout for the statistical tier, in milliseconds
    #[serde(default = "default_statistical_timeout_ms")]
    pub statistical_timeout_ms: u64,

    /// Soft timeout for the behavioral tier, in milliseconds
    #[serde(default = "default_behavioral_timeout_ms")]
    pub behavioral_timeout_ms: u64,

    /// Soft timeout for the correlation tier, in milliseconds
    #[serde(default = "default_correlation_timeout_ms")]
    pub correlation_timeout_ms: u64,

    /// Soft timeout for the validation tier, in milliseconds
    #[serde(default = "default_validation_timeout_ms")]
    pub validation_timeout_ms: u64,

    /// End-to-end completion target per batch, in seconds
    #[serde(default = "default_sla_secs")]
    pub sla_secs: u64,
}

fn default_detector_workers() -> usize {
    5
}

fn default_statistical_timeout_ms() -> u64 {
    1_000
}

fn default_behavioral_timeout_ms() -> u64 {
    30_000
}

fn default_correlation_timeout_ms() -> u64 {
    60_000
}

fn default_validation_timeout_ms() -> u64 {
    120_000
}

fn default_sla_secs() -> u64 {
    300
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detector_workers: default_detector_workers(),
            statistical_timeout_ms: default_statistical_timeout_ms(),
            behavioral_timeout_ms: default_behavioral_timeout_ms(),
            correlation_timeout_ms: default_correlation_timeout_ms(),
            validation_timeout_ms: default_validation_timeout_ms(),
            sla_secs: default_sla_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;

        let config: EngineConfig =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;

        config
            .validate()
            .with_context(|| "config failed validation")?;

        Ok(config)
    }

    /// Load from the given path, falling back to defaults if it is absent
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "could not load config from {}: {:#}, using defaults",
                    path.as_ref().display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Check every tunable for a sane value. A config failing this is
    /// never applied to a running engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.window_secs == 0 {
            return Err(invalid("window.window_secs", "must be positive"));
        }

        if self.port_scan.unique_port_threshold == 0 {
            return Err(invalid("port_scan.unique_port_threshold", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.port_scan.success_ratio_ceiling) {
            return Err(invalid(
                "port_scan.success_ratio_ceiling",
                "must be within [0, 1]",
            ));
        }

        if self.flood.packet_rate_threshold <= 0.0 {
            return Err(invalid("flood.packet_rate_threshold", "must be positive"));
        }

        if self.beacon.min_connections < 2 {
            return Err(invalid("beacon.min_connections", "need at least 2"));
        }
        if self.beacon.max_cv_percent <= 0.0 {
            return Err(invalid("beacon.max_cv_percent", "must be positive"));
        }
        if self.beacon.min_interval_secs >= self.beacon.max_interval_secs {
            return Err(invalid(
                "beacon.min_interval_secs",
                "must be below max_interval_secs",
            ));
        }

        if self.mining.ports.is_empty() {
            return Err(invalid("mining.ports", "must list at least one port"));
        }

        if self.behavioral.sequence_length < 2 {
            return Err(invalid("behavioral.sequence_length", "need at least 2"));
        }
        if self.behavioral.request_timeout_secs == 0 {
            return Err(invalid("behavioral.request_timeout_secs", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.behavioral.outlier_score_threshold) {
            return Err(invalid(
                "behavioral.outlier_score_threshold",
                "must be within [0, 1]",
            ));
        }
        if self.behavioral.sequence_error_threshold <= 0.0 {
            return Err(invalid(
                "behavioral.sequence_error_threshold",
                "must be positive",
            ));
        }

        if !(0.0..1.0).contains(&self.correlation.score_threshold) {
            return Err(invalid(
                "correlation.score_threshold",
                "must be within [0, 1)",
            ));
        }
        if self.correlation.time_window_secs == 0 {
            return Err(invalid("correlation.time_window_secs", "must be positive"));
        }
        let weight_sum = self.correlation.time_weight
            + self.correlation.entity_weight
            + self.correlation.affinity_weight;
        if (weight_sum - 1.0).abs() > 1e-4 {
            return Err(invalid(
                "correlation.time_weight",
                format!("component weights must sum to 1.0, got {:.4}", weight_sum),
            ));
        }

        if !(0.0..1.0).contains(&self.validation.confidence_threshold) {
            return Err(invalid(
                "validation.confidence_threshold",
                "must be within [0, 1)",
            ));
        }
        let gate_sum = self.validation.primary_weight + self.validation.correlation_weight;
        if (gate_sum - 1.0).abs() > 1e-4 {
            return Err(invalid(
                "validation.primary_weight",
                format!("gate weights must sum to 1.0, got {:.4}", gate_sum),
            ));
        }
        for entry in &self.validation.allowlist {
            if entry.parse::<IpAddr>().is_err() && entry.parse::<IpNetwork>().is_err() {
                return Err(invalid(
                    "validation.allowlist",
                    format!("'{}' is neither an IP nor a CIDR block", entry),
                ));
            }
        }

        if self.resilience.failure_threshold == 0 {
            return Err(invalid("resilience.failure_threshold", "must be positive"));
        }
        if self.resilience.max_attempts == 0 {
            return Err(invalid("resilience.max_attempts", "must be positive"));
        }
        if self.resilience.base_delay_ms > self.resilience.max_delay_ms {
            return Err(invalid(
                "resilience.base_delay_ms",
                "must not exceed max_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.resilience.jitter) {
            return Err(invalid("resilience.jitter", "must be within [0, 1]"));
        }

        if self.pipeline.detector_workers == 0 {
            return Err(invalid("pipeline.detector_workers", "must be positive"));
        }
        if self.pipeline.sla_secs == 0 {
            return Err(invalid("pipeline.sla_secs", "must be positive"));
        }

        Ok(())
    }
}

/// Shared handle to the active configuration snapshot.
/// Readers clone the inner `Arc` and keep a consistent view for the
/// duration of one batch; `apply` swaps the snapshot whole.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<EngineConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    /// Current snapshot
    pub fn current(&self) -> Arc<EngineConfig> {
        self.inner.read().clone()
    }

    /// Validate and apply a new configuration. On failure the previous
    /// snapshot stays active.
    pub fn apply(&self, candidate: EngineConfig) -> Result<(), ConfigError> {
        if let Err(e) = candidate.validate() {
            warn!(error = %e, "rejected config update, keeping last known good");
            return Err(e);
        }

        *self.inner.write() = Arc::new(candidate);
        info!("configuration updated");
        Ok(())
    }

    /// Reload from a TOML file, keeping the active snapshot on any error
    pub fn reload_from<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let candidate = EngineConfig::load(path)?;
        self.apply(candidate)?;
        Ok(())
    }
}

impl std::fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHandle").finish_non_exhaustive()
    }
}
