//! Feature extraction for the behavioral models
//!
//! The outlier model sees one fixed-width vector per flow. The sequence
//! model sees flattened sliding windows of those vectors, one window
//! stream per source address, stepping by one record.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Timelike, Utc};

use crate::core::FlowRecord;

/// Width of the per-flow vector
pub const FLOW_FEATURES: usize = 6;

/// Fixed per-flow feature vector: payload shape, destination, protocol,
/// time of day, duration, and accept/reject outcome.
pub fn flow_features(record: &FlowRecord) -> Vec<f32> {
    vec![
        record.bytes_per_packet() as f32,
        record.dst_port as f32,
        record.protocol.feature_value(),
        time_of_day(record.window_start),
        record.duration_secs() as f32,
        if record.action.is_accept() { 1.0 } else { 0.0 },
    ]
}

/// Fraction of the day elapsed at the timestamp, in [0, 1)
fn time_of_day(ts: DateTime<Utc>) -> f32 {
    ts.time().num_seconds_from_midnight() as f32 / 86_400.0
}

/// One flattened sliding window plus the identity of its newest record
#[derive(Debug, Clone)]
pub struct SequenceWindow {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub timestamp: DateTime<Utc>,
    /// `length * FLOW_FEATURES` values, oldest record first
    pub features: Vec<f32>,
}

/// Build per-source sliding windows of `length` records. Sources with
/// fewer records than one window produce nothing.
pub fn sequence_windows(batch: &[FlowRecord], length: usize) -> Vec<SequenceWindow> {
    if length == 0 || batch.len() < length {
        return Vec::new();
    }

    let mut per_source: BTreeMap<IpAddr, Vec<usize>> = BTreeMap::new();
    for (index, record) in batch.iter().enumerate() {
        per_source.entry(record.src_ip).or_default().push(index);
    }

    let mut windows = Vec::new();
    for (src_ip, indices) in per_source {
        if indices.len() < length {
            continue;
        }
        for span in indices.windows(length) {
            let mut features = Vec::with_capacity(length * FLOW_FEATURES);
            for &i in span {
                features.extend(flow_features(&batch[i]));
            }
            let last = &batch[span[length - 1]];
            windows.push(SequenceWindow {
                src_ip,
                dst_ip: last.dst_ip,
                dst_port: last.dst_port,
                timestamp: last.window_start,
                features,
            });
        }
    }

    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FlowAction, Protocol};
    use chrono::TimeZone;

    fn make_flow(src: &str, offset_secs: i64) -> FlowRecord {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 6, 0, 0).unwrap()
            + chrono::Duration::seconds(offset_secs);
        FlowRecord {
            src_ip: src.parse().unwrap(),
            dst_ip: "192.0.2.44".parse().unwrap(),
            src_port: 47000,
            dst_port: 443,
            protocol: Protocol::Tcp,
            packets: 20,
            bytes: 3000,
            window_start: start,
            window_end: start + chrono::Duration::seconds(10),
            action: FlowAction::Accept,
            geo_country: None,
            resource_tag: None,
            dns_name: None,
        }
    }

    #[test]
    fn test_flow_feature_width() {
        let features = flow_features(&make_flow("10.0.0.1", 0));
        assert_eq!(features.len(), FLOW_FEATURES);
        assert!((features[0] - 150.0).abs() < f64::EPSILON as f32);
        assert!((features[1] - 443.0).abs() < f32::EPSILON);
        // 06:00 UTC is a quarter of the day
        assert!((features[3] - 0.25).abs() < 0.001);
        assert_eq!(features[5], 1.0);
    }

    #[test]
    fn test_sequence_windows_step_by_one() {
        let batch: Vec<FlowRecord> = (0..7).map(|i| make_flow("10.0.0.1", i * 60)).collect();

        let windows = sequence_windows(&batch, 5);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].features.len(), 5 * FLOW_FEATURES);
        // each window ends one record later than the previous
        assert!(windows[0].timestamp < windows[1].timestamp);
        assert!(windows[1].timestamp < windows[2].timestamp);
    }

    #[test]
    fn test_sources_do_not_mix() {
        let mut batch: Vec<FlowRecord> = (0..4).map(|i| make_flow("10.0.0.1", i * 60)).collect();
        batch.extend((0..4).map(|i| make_flow("10.0.0.2", i * 60 + 5)));

        // 8 records total but neither source alone fills a window of 5
        assert!(sequence_windows(&batch, 5).is_empty());

        let windows = sequence_windows(&batch, 4);
        assert_eq!(windows.len(), 2);
        assert_ne!(windows[0].src_ip, windows[1].src_ip);
    }

    #[test]
    fn test_short_batch_yields_nothing() {
        let batch: Vec<FlowRecord> = (0..3).map(|i| make_flow("10.0.0.1", i * 60)).collect();
        assert!(sequence_windows(&batch, 50).is_empty());
    }
}
