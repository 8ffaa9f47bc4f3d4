//! End-to-end exercises of the assembled engine through its public
//! surface: statistical screen, behavioral gating, correlation,
//! validation, and delivery, with mock model clients standing in for the
//! inference service.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use flowsentry::behavioral::{ModelClient, ModelError, ModelHealth};
use flowsentry::config::EngineConfig;
use flowsentry::core::{FlowAction, FlowRecord, Protocol, Severity, ThreatType};
use flowsentry::intel::{IntelSnapshot, IntelStore};
use flowsentry::sink::MemorySink;
use flowsentry::Engine;

#[derive(Debug)]
struct CountingModel {
    name: &'static str,
    score: f32,
    calls: AtomicUsize,
}

impl CountingModel {
    fn new(name: &'static str, score: f32) -> Arc<Self> {
        Arc::new(Self {
            name,
            score,
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for CountingModel {
    fn name(&self) -> &str {
        self.name
    }

    async fn health_check(&self) -> Result<ModelHealth, ModelError> {
        Ok(ModelHealth {
            healthy: true,
            latency_ms: 1,
        })
    }

    async fn score(&self, features: &[Vec<f32>]) -> Result<Vec<f32>, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![self.score; features.len()])
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn make_engine(
    sink: Arc<MemorySink>,
    outlier: Arc<CountingModel>,
    sequence: Arc<CountingModel>,
) -> Engine {
    Engine::with_components(
        EngineConfig::default(),
        Arc::new(IntelStore::new()),
        outlier,
        sequence,
        sink,
    )
    .unwrap()
}

fn make_flow(src: &str, dst: &str, dst_port: u16, offset_secs: i64, action: FlowAction) -> FlowRecord {
    let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
        + chrono::Duration::seconds(offset_secs);
    FlowRecord {
        src_ip: src.parse().unwrap(),
        dst_ip: dst.parse().unwrap(),
        src_port: 51000,
        dst_port,
        protocol: Protocol::Tcp,
        packets: 3,
        bytes: 180,
        window_start: start,
        window_end: start + chrono::Duration::seconds(1),
        action,
        geo_country: None,
        resource_tag: None,
        dns_name: None,
    }
}

/// 25 distinct destination ports from one source inside a minute
fn scan_batch() -> Vec<FlowRecord> {
    (0..25)
        .map(|i| {
            make_flow(
                "10.0.0.1",
                "192.0.2.10",
                1000 + i as u16,
                i * 2,
                FlowAction::Reject,
            )
        })
        .collect()
}

/// A few ordinary accepted flows that trip no detector
fn benign_batch() -> Vec<FlowRecord> {
    vec![
        make_flow("10.0.0.1", "192.0.2.10", 443, 0, FlowAction::Accept),
        make_flow("10.0.0.2", "192.0.2.10", 443, 5, FlowAction::Accept),
        make_flow("10.0.0.3", "192.0.2.11", 53, 11, FlowAction::Accept),
    ]
}

#[tokio::test]
async fn test_scan_batch_yields_one_port_scan_report() {
    init_tracing();
    let sink = MemorySink::shared();
    let outlier = CountingModel::new("outlier-mock", 0.1);
    let sequence = CountingModel::new("sequence-mock", 0.0);
    let engine = make_engine(sink.clone(), outlier.clone(), sequence);

    let report = engine.process_batch(scan_batch()).await.unwrap();

    assert_eq!(report.validated, 1);
    assert_eq!(report.delivered, 1);
    assert!(!report.degraded);

    let emitted = sink.all();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].threat_type(), ThreatType::PortScan);
    assert!(emitted[0].severity >= Severity::High);

    // one statistical hit gated exactly one behavioral pass
    assert_eq!(outlier.call_count(), 1);
    assert_eq!(engine.stats().batches, 1);
}

#[tokio::test]
async fn test_clean_batch_never_wakes_the_models() {
    init_tracing();
    let sink = MemorySink::shared();
    let outlier = CountingModel::new("outlier-mock", 0.99);
    let sequence = CountingModel::new("sequence-mock", 9.0);
    let engine = make_engine(sink.clone(), outlier.clone(), sequence.clone());

    let report = engine.process_batch(benign_batch()).await.unwrap();

    assert_eq!(report.statistical_hits, 0);
    assert_eq!(report.validated, 0);
    assert_eq!(outlier.call_count(), 0);
    assert_eq!(sequence.call_count(), 0);
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn test_mining_reported_after_intel_swap() {
    init_tracing();
    let sink = MemorySink::shared();
    let engine = make_engine(
        sink.clone(),
        CountingModel::new("outlier-mock", 0.1),
        CountingModel::new("sequence-mock", 0.0),
    );

    let batch: Vec<FlowRecord> = (0..4)
        .map(|i| {
            make_flow(
                "10.0.0.5",
                "198.51.100.7",
                3333,
                i * 15,
                FlowAction::Accept,
            )
        })
        .collect();

    // without the list, stratum traffic alone is not enough
    engine.process_batch(batch.clone()).await.unwrap();
    assert_eq!(sink.count(), 0);

    let mut pools = HashSet::new();
    pools.insert("198.51.100.7".parse().unwrap());
    engine.swap_intel(IntelSnapshot::new(pools, HashSet::new(), "feed-1"));

    engine.process_batch(batch).await.unwrap();
    let emitted = sink.all();
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].threat_type(), ThreatType::CryptoMining);
    assert!(emitted[0].severity >= Severity::High);
}

#[tokio::test]
async fn test_dismissal_suppresses_repeat_reports() {
    init_tracing();
    let sink = MemorySink::shared();
    let engine = make_engine(
        sink.clone(),
        CountingModel::new("outlier-mock", 0.1),
        CountingModel::new("sequence-mock", 0.0),
    );

    engine.process_batch(scan_batch()).await.unwrap();
    assert_eq!(sink.count(), 1);

    engine.record_dismissal(ThreatType::PortScan, "10.0.0.1".parse().unwrap());
    engine.process_batch(scan_batch()).await.unwrap();

    // same scan, same source: suppressed by analyst feedback
    assert_eq!(sink.count(), 1);
    assert_eq!(engine.stats().validation.suppressed_false_positive, 1);
}

#[tokio::test]
async fn test_reports_reach_subscribers() {
    init_tracing();
    let sink = MemorySink::shared();
    let engine = make_engine(
        sink,
        CountingModel::new("outlier-mock", 0.1),
        CountingModel::new("sequence-mock", 0.0),
    );

    let mut reports = engine.subscribe_reports();
    let returned = engine.process_batch(scan_batch()).await.unwrap();

    let received = reports.recv().await.unwrap();
    assert_eq!(received.batch_id, returned.batch_id);
    assert_eq!(received.validated, returned.validated);
}
