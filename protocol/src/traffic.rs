//! # Traffic Accounting
//!
//! Lock-free per-key counters for tunneled traffic. The agent keys by rule
//! id; the broker keys by `(rule_id, agent_id)`. Byte and connection totals
//! are deltas drained by the periodic [`TrafficStats::snapshot`]; the active
//! connection count is a gauge read without reset.

use std::hash::Hash;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

#[derive(Debug, Default)]
struct Counters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    connections: AtomicU64,
    active: AtomicI64,
}

/// One drained row; zero-delta keys with no active connections are omitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSnapshot<K> {
    pub key: K,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connections: u64,
    pub active: i64,
}

/// Concurrent counter table, atomic on the hot path.
pub struct TrafficStats<K: Eq + Hash + Clone> {
    counters: DashMap<K, Arc<Counters>>,
}

impl<K: Eq + Hash + Clone> Default for TrafficStats<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> TrafficStats<K> {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    fn entry(&self, key: K) -> Arc<Counters> {
        self.counters.entry(key).or_default().clone()
    }

    pub fn add_bytes_in(&self, key: K, n: u64) {
        self.entry(key).bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, key: K, n: u64) {
        self.entry(key).bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    /// Counts a new connection: total opened plus the active gauge.
    pub fn increment_conn(&self, key: K) {
        let c = self.entry(key);
        c.connections.fetch_add(1, Ordering::Relaxed);
        c.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops the active gauge, saturating at zero.
    pub fn decrement_conn(&self, key: K) {
        let c = self.entry(key);
        let _ = c
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            });
    }

    pub fn active_conns(&self, key: &K) -> i64 {
        self.counters
            .get(key)
            .map(|c| c.active.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Swaps the three deltas to zero and reads the gauge. Rows where every
    /// delta is zero and nothing is active are left out.
    pub fn snapshot(&self) -> Vec<TrafficSnapshot<K>> {
        let mut rows = Vec::new();
        for entry in self.counters.iter() {
            let c = entry.value();
            let bytes_in = c.bytes_in.swap(0, Ordering::Relaxed);
            let bytes_out = c.bytes_out.swap(0, Ordering::Relaxed);
            let connections = c.connections.swap(0, Ordering::Relaxed);
            let active = c.active.load(Ordering::Relaxed);
            if bytes_in == 0 && bytes_out == 0 && connections == 0 && active == 0 {
                continue;
            }
            rows.push(TrafficSnapshot {
                key: entry.key().clone(),
                bytes_in,
                bytes_out,
                connections,
                active,
            });
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_drains_deltas_but_keeps_the_gauge() {
        let stats: TrafficStats<String> = TrafficStats::new();
        stats.increment_conn("r1".into());
        stats.add_bytes_in("r1".into(), 31);
        stats.add_bytes_out("r1".into(), 31);

        let rows = stats.snapshot();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!((row.bytes_in, row.bytes_out, row.connections, row.active), (31, 31, 1, 1));

        // Deltas are gone, the gauge survives.
        let rows = stats.snapshot();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!((row.bytes_in, row.bytes_out, row.connections, row.active), (0, 0, 0, 1));
    }

    #[test]
    fn idle_keys_are_omitted() {
        let stats: TrafficStats<String> = TrafficStats::new();
        stats.increment_conn("r1".into());
        stats.decrement_conn("r1".into());
        stats.snapshot();
        assert!(stats.snapshot().is_empty());
    }

    #[test]
    fn decrement_never_goes_negative() {
        let stats: TrafficStats<String> = TrafficStats::new();
        stats.decrement_conn("r1".into());
        stats.decrement_conn("r1".into());
        assert_eq!(stats.active_conns(&"r1".into()), 0);

        stats.increment_conn("r1".into());
        stats.decrement_conn("r1".into());
        stats.decrement_conn("r1".into());
        assert_eq!(stats.active_conns(&"r1".into()), 0);
    }

    #[test]
    fn composite_keys_stay_independent() {
        let stats: TrafficStats<(String, String)> = TrafficStats::new();
        stats.add_bytes_out(("r1".into(), "agent-a".into()), 10);
        stats.add_bytes_out(("r1".into(), "agent-b".into()), 20);

        let mut rows = stats.snapshot();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bytes_out, 10);
        assert_eq!(rows[1].bytes_out, 20);
    }
}
