//! Enriched network flow records
//!
//! A `FlowRecord` is one aggregated flow-log line after upstream enrichment
//! (geo lookup, resource tagging, reverse DNS). The engine never mutates
//! records; batches are borrowed for the duration of one pipeline pass.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    /// Anything else, carried by IANA protocol number
    Other(u8),
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Other(_) => "other",
        }
    }

    /// Numeric stand-in used when building model feature vectors
    pub fn feature_value(&self) -> f32 {
        match self {
            Protocol::Tcp => 6.0,
            Protocol::Udp => 17.0,
            Protocol::Icmp => 1.0,
            Protocol::Other(n) => *n as f32,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Other(n) => write!(f, "proto/{}", n),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Whether the flow was accepted or rejected by the network fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowAction {
    Accept,
    Reject,
}

impl FlowAction {
    pub fn is_accept(&self) -> bool {
        matches!(self, FlowAction::Accept)
    }
}

/// Directional grouping key: (source, destination, destination port, protocol)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: Protocol,
}

/// One enriched flow-log record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    /// Packets observed in the aggregation window
    pub packets: u64,
    /// Bytes observed in the aggregation window
    pub bytes: u64,
    /// Start of the aggregation window
    pub window_start: DateTime<Utc>,
    /// End of the aggregation window
    pub window_end: DateTime<Utc>,
    pub action: FlowAction,

    // Enrichment, populated upstream; absent fields mean lookup failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
}

impl FlowRecord {
    /// Grouping key for windowed per-destination analysis
    pub fn key(&self) -> FlowKey {
        FlowKey {
            src_ip: self.src_ip,
            dst_ip: self.dst_ip,
            dst_port: self.dst_port,
            protocol: self.protocol,
        }
    }

    /// Window length in seconds
    pub fn duration_secs(&self) -> f64 {
        let ms = (self.window_end - self.window_start).num_milliseconds();
        (ms.max(0) as f64) / 1000.0
    }

    /// Packets per second over the aggregation window
    pub fn packet_rate(&self) -> f64 {
        let dur = self.duration_secs();
        if dur > 0.0 {
            self.packets as f64 / dur
        } else {
            self.packets as f64
        }
    }

    /// Mean payload size per packet
    pub fn bytes_per_packet(&self) -> f64 {
        if self.packets > 0 {
            self.bytes as f64 / self.packets as f64
        } else {
            0.0
        }
    }

    /// Structural sanity check. Records failing this are skipped and
    /// counted rather than processed.
    pub fn is_wellformed(&self) -> bool {
        self.window_end >= self.window_start && self.packets > 0 && self.bytes > 0
    }
}

/// Compute (min, max, mean, stddev) over a value slice.
/// Returns zeros for an empty slice.
pub fn compute_stats(values: &[f64]) -> (f64, f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }

    let mut min = f64::MAX;
    let mut max = f64::MIN;
    let mut sum = 0.0;

    for &v in values {
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
        sum += v;
    }

    let mean = sum / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;

    (min, max, mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_flow(packets: u64, bytes: u64, duration_secs: i64) -> FlowRecord {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        FlowRecord {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "192.0.2.10".parse().unwrap(),
            src_port: 49152,
            dst_port: 443,
            protocol: Protocol::Tcp,
            packets,
            bytes,
            window_start: start,
            window_end: start + chrono::Duration::seconds(duration_secs),
            action: FlowAction::Accept,
            geo_country: None,
            resource_tag: None,
            dns_name: None,
        }
    }

    #[test]
    fn test_derived_rates() {
        let flow = make_flow(600, 90_000, 60);
        assert!((flow.duration_secs() - 60.0).abs() < f64::EPSILON);
        assert!((flow.packet_rate() - 10.0).abs() < f64::EPSILON);
        assert!((flow.bytes_per_packet() - 150.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_duration_rate_falls_back_to_count() {
        let flow = make_flow(42, 1000, 0);
        assert!((flow.packet_rate() - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_wellformed_rejects_inverted_window() {
        let mut flow = make_flow(10, 1000, 30);
        assert!(flow.is_wellformed());

        flow.window_end = flow.window_start - chrono::Duration::seconds(1);
        assert!(!flow.is_wellformed());
    }

    #[test]
    fn test_wellformed_rejects_empty_counts() {
        assert!(!make_flow(0, 1000, 30).is_wellformed());
        assert!(!make_flow(10, 0, 30).is_wellformed());
    }

    #[test]
    fn test_key_ignores_source_port() {
        let mut a = make_flow(10, 1000, 30);
        let mut b = make_flow(10, 1000, 30);
        a.src_port = 50001;
        b.src_port = 50002;
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_compute_stats() {
        let (min, max, mean, std) = compute_stats(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((min - 2.0).abs() < f64::EPSILON);
        assert!((max - 9.0).abs() < f64::EPSILON);
        assert!((mean - 5.0).abs() < f64::EPSILON);
        assert!((std - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_compute_stats_empty() {
        assert_eq!(compute_stats(&[]), (0.0, 0.0, 0.0, 0.0));
    }
}
