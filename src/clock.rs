//! Vector Clock Management
//!
//! Per-node logical clocks providing the happens-before relation that
//! orders replication activity across the fleet. The manager owns the
//! authoritative clock snapshot for every registered node; consumers only
//! ever receive immutable copies.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Node identifier, unique across the cluster lifetime
pub type NodeId = String;

/// Relationship between two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Left clock happened before the right
    Before,
    /// Left clock happened after the right
    After,
    /// Clocks are incomparable (conflict potential)
    Concurrent,
    /// Clocks are identical
    Equal,
}

impl std::fmt::Display for ClockOrdering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClockOrdering::Before => write!(f, "before"),
            ClockOrdering::After => write!(f, "after"),
            ClockOrdering::Concurrent => write!(f, "concurrent"),
            ClockOrdering::Equal => write!(f, "equal"),
        }
    }
}

/// Vector clock: a map from node id to a logical counter.
///
/// Absent entries read as zero, so clocks over disjoint node sets compare
/// the same way as if both carried explicit zeroes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    /// Create an empty clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the counter for a node (0 if absent)
    pub fn get(&self, node: &str) -> u64 {
        self.entries.get(node).copied().unwrap_or(0)
    }

    /// Set the counter for a node
    pub fn set(&mut self, node: impl Into<NodeId>, value: u64) {
        self.entries.insert(node.into(), value);
    }

    /// Increment the counter for a node by one
    pub fn increment(&mut self, node: &str) {
        *self.entries.entry(node.to_string()).or_insert(0) += 1;
    }

    /// Raise every entry to the pointwise maximum with `other`
    pub fn merge_from(&mut self, other: &VectorClock) {
        for (node, value) in &other.entries {
            let entry = self.entries.entry(node.clone()).or_insert(0);
            if *value > *entry {
                *entry = *value;
            }
        }
    }

    /// Drop a node's entry entirely
    pub fn remove(&mut self, node: &str) {
        self.entries.remove(node);
    }

    /// Compare with another clock under pointwise ordering
    pub fn ordering(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_greater = false;
        let mut other_greater = false;

        for node in self.entries.keys().chain(other.entries.keys()) {
            let a = self.get(node);
            let b = other.get(node);
            if a > b {
                self_greater = true;
            } else if b > a {
                other_greater = true;
            }
        }

        match (self_greater, other_greater) {
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (false, false) => ClockOrdering::Equal,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Check whether this clock is incomparable with another
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.ordering(other) == ClockOrdering::Concurrent
    }

    /// Check whether every entry is >= the corresponding entry in `other`
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.ordering(other),
            ClockOrdering::After | ClockOrdering::Equal
        )
    }

    /// Check whether this clock descends from `other` (equal counts as descent)
    pub fn descends_from(&self, other: &VectorClock) -> bool {
        self.dominates(other)
    }

    /// Iterate over explicit entries
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        self.entries.iter()
    }

    /// Number of explicit entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entry has been recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|(node, value)| format!("{}:{}", node, value))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

impl FromIterator<(NodeId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (NodeId, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Items that carry a vector clock and can be causally ordered.
///
/// `sequence_key` breaks ties between concurrent items; the produced
/// total order refines happens-before.
pub trait CausallyOrdered {
    fn vector_clock(&self) -> &VectorClock;
    fn timestamp(&self) -> DateTime<Utc>;
    fn tie_breaker(&self) -> &str;
}

/// Sort items into an order consistent with happens-before.
///
/// Kahn topological sort over the DAG with an edge u -> v iff
/// `u.clock < v.clock`; among ready items the one with the smallest
/// `(timestamp, tie_breaker)` is emitted first.
pub fn causal_sort<T: CausallyOrdered>(items: Vec<T>) -> Vec<T> {
    let n = items.len();
    if n <= 1 {
        return items;
    }

    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];

    for i in 0..n {
        for j in (i + 1)..n {
            match items[i].vector_clock().ordering(items[j].vector_clock()) {
                ClockOrdering::Before => {
                    successors[i].push(j);
                    indegree[j] += 1;
                }
                ClockOrdering::After => {
                    successors[j].push(i);
                    indegree[i] += 1;
                }
                ClockOrdering::Concurrent | ClockOrdering::Equal => {}
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<(DateTime<Utc>, String, usize)>> = BinaryHeap::new();
    for (idx, item) in items.iter().enumerate() {
        if indegree[idx] == 0 {
            ready.push(Reverse((
                item.timestamp(),
                item.tie_breaker().to_string(),
                idx,
            )));
        }
    }

    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let mut sorted = Vec::with_capacity(n);

    while let Some(Reverse((_, _, idx))) = ready.pop() {
        for &next in &successors[idx] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                let item = slots[next].as_ref().expect("unvisited item");
                ready.push(Reverse((
                    item.timestamp(),
                    item.tie_breaker().to_string(),
                    next,
                )));
            }
        }
        sorted.push(slots[idx].take().expect("item emitted twice"));
    }

    sorted
}

/// Authoritative per-node clock snapshot.
///
/// Clock advancement is atomic under the manager's lock; callers always
/// receive a detached copy. When an advance must be observed together
/// with its persisted event, take [`ClockManager::lock`] and hold the
/// guard across the append so no other advance can slip between the two.
pub struct ClockManager {
    clocks: RwLock<HashMap<NodeId, VectorClock>>,
}

/// Exclusive access to the clock table.
///
/// Advances made through the guard become visible only when it drops,
/// so "advance the clock, persist an event carrying it" is one atomic
/// step for every other writer.
pub struct LockedClocks<'a> {
    clocks: tokio::sync::RwLockWriteGuard<'a, HashMap<NodeId, VectorClock>>,
}

impl LockedClocks<'_> {
    /// Increment a node's own counter and return the new snapshot
    pub fn tick(&mut self, node: &str) -> VectorClock {
        let clock = self.clocks.entry(node.to_string()).or_default();
        clock.increment(node);
        clock.clone()
    }

    /// Merge an incoming clock into a node's clock, then tick
    pub fn merge(&mut self, node: &str, incoming: &VectorClock) -> VectorClock {
        let clock = self.clocks.entry(node.to_string()).or_default();
        clock.merge_from(incoming);
        clock.increment(node);
        clock.clone()
    }
}

impl ClockManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self {
            clocks: RwLock::new(HashMap::new()),
        }
    }

    /// Register a node, initializing its clock if unknown
    pub async fn register_node(&self, node: &str) -> VectorClock {
        let mut clocks = self.clocks.write().await;
        clocks
            .entry(node.to_string())
            .or_insert_with(|| {
                let mut clock = VectorClock::new();
                clock.set(node, 0);
                clock
            })
            .clone()
    }

    /// Seed a node's clock from persisted state
    pub async fn restore_node(&self, node: &str, clock: VectorClock) {
        let mut clocks = self.clocks.write().await;
        clocks.insert(node.to_string(), clock);
    }

    /// Forget a node's clock
    pub async fn remove_node(&self, node: &str) {
        let mut clocks = self.clocks.write().await;
        clocks.remove(node);
    }

    /// Take exclusive access for an advance that must stay coupled to
    /// whatever gets persisted with it
    pub async fn lock(&self) -> LockedClocks<'_> {
        LockedClocks {
            clocks: self.clocks.write().await,
        }
    }

    /// Increment a node's own counter and return the new snapshot.
    /// Call before any locally originated event.
    pub async fn tick(&self, node: &str) -> VectorClock {
        self.lock().await.tick(node)
    }

    /// Merge an incoming clock into a node's clock, then tick.
    /// Call when the node receives a message from a peer.
    pub async fn merge(&self, node: &str, incoming: &VectorClock) -> VectorClock {
        self.lock().await.merge(node, incoming)
    }

    /// Current snapshot for a node
    pub async fn snapshot(&self, node: &str) -> Option<VectorClock> {
        let clocks = self.clocks.read().await;
        clocks.get(node).cloned()
    }

    /// Snapshot of every registered clock
    pub async fn all_clocks(&self) -> HashMap<NodeId, VectorClock> {
        self.clocks.read().await.clone()
    }

    /// True iff `clock` is concurrent with at least one of `heads`
    pub fn is_concurrent_with_any<'a>(
        clock: &VectorClock,
        heads: impl IntoIterator<Item = &'a VectorClock>,
    ) -> bool {
        heads.into_iter().any(|head| clock.is_concurrent_with(head))
    }
}

impl Default for ClockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        entries
            .iter()
            .map(|(node, value)| (node.to_string(), *value))
            .collect()
    }

    #[test]
    fn test_ordering_basics() {
        let a = clock(&[("n1", 1), ("n2", 2)]);
        let b = clock(&[("n1", 2), ("n2", 2)]);

        assert_eq!(a.ordering(&b), ClockOrdering::Before);
        assert_eq!(b.ordering(&a), ClockOrdering::After);
        assert_eq!(a.ordering(&a.clone()), ClockOrdering::Equal);
    }

    #[test]
    fn test_disjoint_nodes_are_concurrent() {
        // Absent entries read as zero: {A:2} vs {B:3} are incomparable.
        let a = clock(&[("a", 2)]);
        let b = clock(&[("b", 3)]);

        assert_eq!(a.ordering(&b), ClockOrdering::Concurrent);
        assert!(a.is_concurrent_with(&b));
    }

    #[test]
    fn test_merge_takes_pointwise_max() {
        let mut a = clock(&[("n1", 3), ("n2", 1)]);
        let b = clock(&[("n2", 5), ("n3", 2)]);

        a.merge_from(&b);
        assert_eq!(a.get("n1"), 3);
        assert_eq!(a.get("n2"), 5);
        assert_eq!(a.get("n3"), 2);
    }

    #[tokio::test]
    async fn test_tick_advances_strictly() {
        let manager = ClockManager::new();
        manager.register_node("n1").await;

        let before = manager.snapshot("n1").await.unwrap();
        let once = manager.tick("n1").await;
        let twice = manager.tick("n1").await;

        assert_eq!(once.ordering(&before), ClockOrdering::After);
        assert_eq!(twice.ordering(&before), ClockOrdering::After);
        assert_eq!(twice.ordering(&once), ClockOrdering::After);
        assert_eq!(twice.get("n1"), before.get("n1") + 2);
    }

    #[tokio::test]
    async fn test_merge_then_tick_dominates_both() {
        let manager = ClockManager::new();
        manager.register_node("n1").await;
        manager.tick("n2").await;
        let incoming = manager.tick("n2").await;

        let merged = manager.merge("n1", &incoming).await;
        assert_eq!(merged.ordering(&incoming), ClockOrdering::After);
        assert_eq!(merged.get("n1"), 1);
        assert_eq!(merged.get("n2"), 2);
    }

    #[tokio::test]
    async fn test_concurrent_with_any() {
        let heads = vec![clock(&[("n1", 2), ("n2", 1)]), clock(&[("n1", 1), ("n3", 4)])];
        let candidate = clock(&[("n2", 2)]);

        assert!(ClockManager::is_concurrent_with_any(&candidate, heads.iter()));

        let descendant = clock(&[("n1", 2), ("n2", 2), ("n3", 4)]);
        assert!(!ClockManager::is_concurrent_with_any(&descendant, heads.iter()));
    }

    struct Stamped {
        id: String,
        at: DateTime<Utc>,
        vc: VectorClock,
    }

    impl CausallyOrdered for Stamped {
        fn vector_clock(&self) -> &VectorClock {
            &self.vc
        }

        fn timestamp(&self) -> DateTime<Utc> {
            self.at
        }

        fn tie_breaker(&self) -> &str {
            &self.id
        }
    }

    #[test]
    fn test_causal_sort_respects_happens_before() {
        let base = Utc::now();
        let items = vec![
            Stamped {
                id: "c".into(),
                at: base,
                vc: clock(&[("n1", 3)]),
            },
            Stamped {
                id: "a".into(),
                at: base + chrono::Duration::seconds(10),
                vc: clock(&[("n1", 1)]),
            },
            Stamped {
                id: "b".into(),
                at: base + chrono::Duration::seconds(5),
                vc: clock(&[("n1", 2)]),
            },
        ];

        let sorted = causal_sort(items);
        let ids: Vec<&str> = sorted.iter().map(|s| s.id.as_str()).collect();
        // Clock order wins over timestamps.
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_causal_sort_breaks_ties_by_timestamp() {
        let base = Utc::now();
        let items = vec![
            Stamped {
                id: "late".into(),
                at: base + chrono::Duration::seconds(1),
                vc: clock(&[("n2", 1)]),
            },
            Stamped {
                id: "early".into(),
                at: base,
                vc: clock(&[("n1", 1)]),
            },
        ];

        let sorted = causal_sort(items);
        let ids: Vec<&str> = sorted.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }
}
