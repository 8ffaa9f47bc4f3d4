//! Threat list snapshots and benign-entity allowlists
//!
//! The engine only reads list snapshots; an external refresh job builds a
//! new `IntelSnapshot` (hourly for Tor exits) and swaps it in whole. Reads
//! during a swap keep the old snapshot via its `Arc`, so a detector never
//! sees a half-updated list.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Which list a lookup hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListKind {
    MiningPool,
    TorExit,
}

/// One successful list lookup
#[derive(Debug, Clone, Serialize)]
pub struct ListMatch {
    pub kind: ListKind,
    /// Label of the feed the snapshot came from
    pub source: String,
    pub matched: IpAddr,
}

/// Immutable result of one list refresh cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelSnapshot {
    pub mining_pools: HashSet<IpAddr>,
    pub tor_exits: HashSet<IpAddr>,
    /// Label of the refresh job that produced this snapshot
    pub source: String,
    pub refreshed_at: DateTime<Utc>,
}

impl IntelSnapshot {
    pub fn new(
        mining_pools: HashSet<IpAddr>,
        tor_exits: HashSet<IpAddr>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            mining_pools,
            tor_exits,
            source: source.into(),
            refreshed_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(HashSet::new(), HashSet::new(), "none")
    }

    /// Load a snapshot from the JSON file a refresh job writes
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read intel snapshot: {}", path.as_ref().display()))?;
        let snapshot: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse intel snapshot: {}", path.as_ref().display()))?;
        Ok(snapshot)
    }
}

/// Counters and freshness info for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct IntelStatus {
    pub mining_pool_count: usize,
    pub tor_exit_count: usize,
    pub source: String,
    pub refreshed_at: DateTime<Utc>,
    pub lookups: u64,
    pub hits: u64,
}

/// Shared read handle over the current list snapshot
#[derive(Debug)]
pub struct IntelStore {
    snapshot: RwLock<Arc<IntelSnapshot>>,
    lookups: AtomicU64,
    hits: AtomicU64,
}

impl Default for IntelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IntelStore {
    pub fn new() -> Self {
        Self::with_snapshot(IntelSnapshot::empty())
    }

    pub fn with_snapshot(snapshot: IntelSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Replace the active snapshot. Called by the external refresh job.
    pub fn swap_snapshot(&self, snapshot: IntelSnapshot) {
        info!(
            source = %snapshot.source,
            mining_pools = snapshot.mining_pools.len(),
            tor_exits = snapshot.tor_exits.len(),
            "intel snapshot swapped"
        );
        *self.snapshot.write() = Arc::new(snapshot);
    }

    pub fn current(&self) -> Arc<IntelSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn check_mining_pool(&self, ip: &IpAddr) -> Option<ListMatch> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.current();
        if snapshot.mining_pools.contains(ip) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(%ip, "mining pool list hit");
            return Some(ListMatch {
                kind: ListKind::MiningPool,
                source: snapshot.source.clone(),
                matched: *ip,
            });
        }
        None
    }

    pub fn check_tor_exit(&self, ip: &IpAddr) -> Option<ListMatch> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.current();
        if snapshot.tor_exits.contains(ip) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(%ip, "tor exit list hit");
            return Some(ListMatch {
                kind: ListKind::TorExit,
                source: snapshot.source.clone(),
                matched: *ip,
            });
        }
        None
    }

    /// Time since the active snapshot was built
    pub fn snapshot_age(&self) -> chrono::Duration {
        Utc::now() - self.current().refreshed_at
    }

    pub fn status(&self) -> IntelStatus {
        let snapshot = self.current();
        IntelStatus {
            mining_pool_count: snapshot.mining_pools.len(),
            tor_exit_count: snapshot.tor_exits.len(),
            source: snapshot.source.clone(),
            refreshed_at: snapshot.refreshed_at,
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }
}

/// Known-benign entities, matched by exact IP or CIDR block
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    exact: HashSet<IpAddr>,
    networks: Vec<IpNetwork>,
}

impl Allowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ip(&mut self, ip: IpAddr) {
        self.exact.insert(ip);
    }

    pub fn add_network(&mut self, network: IpNetwork) {
        if !self.networks.contains(&network) {
            self.networks.push(network);
        }
    }

    /// Parse one entry, accepting a bare IP or a CIDR block.
    /// Returns false for lines that parse as neither.
    pub fn add_entry(&mut self, entry: &str) -> bool {
        let entry = entry.trim();
        if let Ok(ip) = entry.parse::<IpAddr>() {
            self.add_ip(ip);
            true
        } else if let Ok(network) = entry.parse::<IpNetwork>() {
            self.add_network(network);
            true
        } else {
            false
        }
    }

    /// Load entries from a file, one IP or CIDR block per line. Blank
    /// lines and `#` comments are skipped; unparseable lines are logged
    /// and dropped.
    pub async fn load_file<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<usize> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read allowlist: {}", path.as_ref().display()))?;

        let mut added = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if self.add_entry(line) {
                added += 1;
            } else {
                debug!(line, "skipping unparseable allowlist line");
            }
        }
        info!(
            added,
            path = %path.as_ref().display(),
            "allowlist entries loaded"
        );
        Ok(added)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.exact.contains(ip) || self.networks.iter().any(|n| n.contains(*ip))
    }

    pub fn entry_count(&self) -> usize {
        self.exact.len() + self.networks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_lookup_hits_and_misses() {
        let mut pools = HashSet::new();
        pools.insert(ip("198.51.100.7"));
        let mut exits = HashSet::new();
        exits.insert(ip("203.0.113.50"));

        let store = IntelStore::with_snapshot(IntelSnapshot::new(pools, exits, "unit"));

        let hit = store.check_mining_pool(&ip("198.51.100.7")).unwrap();
        assert_eq!(hit.kind, ListKind::MiningPool);
        assert_eq!(hit.source, "unit");

        assert!(store.check_mining_pool(&ip("203.0.113.50")).is_none());
        assert!(store.check_tor_exit(&ip("203.0.113.50")).is_some());
        assert!(store.check_tor_exit(&ip("10.0.0.1")).is_none());

        let status = store.status();
        assert_eq!(status.lookups, 4);
        assert_eq!(status.hits, 2);
    }

    #[test]
    fn test_swap_replaces_whole_snapshot() {
        let store = IntelStore::new();
        assert!(store.check_tor_exit(&ip("203.0.113.50")).is_none());

        let mut exits = HashSet::new();
        exits.insert(ip("203.0.113.50"));
        store.swap_snapshot(IntelSnapshot::new(HashSet::new(), exits, "refresh-1"));

        assert!(store.check_tor_exit(&ip("203.0.113.50")).is_some());
        assert_eq!(store.status().source, "refresh-1");
        // old entries are gone, not merged
        assert_eq!(store.status().mining_pool_count, 0);
    }

    #[test]
    fn test_allowlist_exact_and_cidr() {
        let mut allow = Allowlist::new();
        assert!(allow.add_entry("10.1.2.3"));
        assert!(allow.add_entry("192.168.0.0/16"));
        assert!(!allow.add_entry("not-an-ip"));

        assert!(allow.contains(&ip("10.1.2.3")));
        assert!(allow.contains(&IpAddr::V4(Ipv4Addr::new(192, 168, 44, 9))));
        assert!(!allow.contains(&ip("10.1.2.4")));
        assert_eq!(allow.entry_count(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");

        let mut pools = HashSet::new();
        pools.insert(ip("198.51.100.7"));
        let snapshot = IntelSnapshot::new(pools, HashSet::new(), "feed-2");
        std::fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();

        let loaded = IntelSnapshot::load(&path).await.unwrap();
        assert!(loaded.mining_pools.contains(&ip("198.51.100.7")));
        assert_eq!(loaded.source, "feed-2");

        let missing = IntelSnapshot::load(dir.path().join("absent.json")).await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_allowlist_file_skips_comments_and_junk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allow.txt");
        std::fs::write(&path, "# corp ranges\n10.0.0.0/8\n\n192.0.2.7\nnot-an-ip\n").unwrap();

        let mut allow = Allowlist::new();
        let added = allow.load_file(&path).await.unwrap();
        assert_eq!(added, 2);
        assert!(allow.contains(&ip("10.3.4.5")));
        assert!(allow.contains(&ip("192.0.2.7")));
        assert!(!allow.contains(&ip("8.8.8.8")));
    }
}
