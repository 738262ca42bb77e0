//! Usage statistics side channel.
//!
//! Every backend keeps a set of relaxed atomic counters and reports them as a
//! [`UsageStatsNode`]. Wrappers and hierarchies attach their inner backends
//! as children so the whole graph can be inspected from the root.

use std::sync::atomic::{AtomicU64, Ordering};

use ddc_core::PutStatus;

/// Counters for one backend.
#[derive(Debug, Default)]
pub struct UsageStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub puts_cached: AtomicU64,
    pub puts_executing: AtomicU64,
    pub puts_skipped: AtomicU64,
    pub puts_not_cached: AtomicU64,
    pub removes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl UsageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_get(&self, hit: Option<usize>) {
        match hit {
            Some(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_put(&self, status: PutStatus, bytes: usize) {
        let counter = match status {
            PutStatus::Cached => &self.puts_cached,
            PutStatus::Executing => &self.puts_executing,
            PutStatus::Skipped => &self.puts_skipped,
            PutStatus::NotCached => &self.puts_not_cached,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if status == PutStatus::Cached {
            self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts_cached: self.puts_cached.load(Ordering::Relaxed),
            puts_executing: self.puts_executing.load(Ordering::Relaxed),
            puts_skipped: self.puts_skipped.load(Ordering::Relaxed),
            puts_not_cached: self.puts_not_cached.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of backend counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub puts_cached: u64,
    pub puts_executing: u64,
    pub puts_skipped: u64,
    pub puts_not_cached: u64,
    pub removes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl StatsSnapshot {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn total_puts(&self) -> u64 {
        self.puts_cached + self.puts_executing + self.puts_skipped + self.puts_not_cached
    }
}

/// Stats for one backend and the backends it wraps.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageStatsNode {
    pub name: String,
    pub kind: &'static str,
    pub stats: StatsSnapshot,
    pub children: Vec<UsageStatsNode>,
}

impl UsageStatsNode {
    pub fn leaf(name: impl Into<String>, kind: &'static str, stats: StatsSnapshot) -> Self {
        Self {
            name: name.into(),
            kind,
            stats,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: UsageStatsNode) -> Self {
        self.children.push(child);
        self
    }

    /// Depth-first search by backend name.
    pub fn find(&self, name: &str) -> Option<&UsageStatsNode> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Number of nodes in this subtree.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.node_count()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = UsageStats::new();
        stats.record_get(Some(10));
        stats.record_get(Some(5));
        stats.record_get(None);
        stats.record_put(PutStatus::Cached, 7);
        stats.record_put(PutStatus::NotCached, 7);
        stats.record_remove();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.bytes_read, 15);
        assert_eq!(snapshot.bytes_written, 7);
        assert_eq!(snapshot.total_puts(), 2);
        assert_eq!(snapshot.removes, 1);
        assert!((snapshot.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_hit_rate_empty() {
        assert_eq!(StatsSnapshot::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_node_tree_find() {
        let tree = UsageStatsNode::leaf("Hierarchy", "hierarchical", StatsSnapshot::default())
            .with_child(UsageStatsNode::leaf("Boot", "memory", StatsSnapshot::default()))
            .with_child(
                UsageStatsNode::leaf("AsyncPut(Local)", "async_put", StatsSnapshot::default())
                    .with_child(UsageStatsNode::leaf("Local", "lmdb", StatsSnapshot::default())),
            );
        assert_eq!(tree.node_count(), 4);
        assert_eq!(tree.find("Local").map(|n| n.kind), Some("lmdb"));
        assert!(tree.find("Missing").is_none());
    }
}
