use ahash::AHashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use prefix_router::scheduler::allocation::AllocationMap;
use prefix_router::scheduler::radix_tree::NodeId;

#[derive(Debug)]
struct HistogramEntry {
    /// Sum of observed leaves' context lengths over the window
    weighted_count: u64,
    event_count: u64,
    /// Insertion sequence, pins FIFO tie-breaking in the rebalancer heap
    first_seen: u64,
}

/// Popularity histogram over important nodes, bounded by a sliding window.
///
/// Events arrive in monotonic time order; expired events are purged from the
/// head of the FIFO on every update, so queries between updates never see
/// stale contributions.
#[derive(Debug)]
pub struct SlidingWindowHistogram {
    window: Duration,
    counters: AHashMap<NodeId, HistogramEntry>,
    /// `(timestamp, important node, leaf context length)` in arrival order
    events: VecDeque<(Instant, NodeId, u64)>,
    next_seq: u64,
}

impl SlidingWindowHistogram {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            counters: AHashMap::new(),
            events: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Records one routed request against `important`, weighted by the
    /// routed leaf's context length.
    ///
    /// Returns the nodes whose counters decayed to zero during the purge;
    /// the caller must reset their allocation sets.
    pub fn update(&mut self, now: Instant, important: NodeId, leaf_context_length: u64) -> Vec<NodeId> {
        self.events.push_back((now, important, leaf_context_length));
        let seq = self.next_seq;
        let entry = self.counters.entry(important).or_insert(HistogramEntry {
            weighted_count: 0,
            event_count: 0,
            first_seen: seq,
        });
        entry.weighted_count += leaf_context_length;
        entry.event_count += 1;
        self.next_seq += 1;

        self.purge(now)
    }

    fn purge(&mut self, now: Instant) -> Vec<NodeId> {
        let mut decayed = Vec::new();
        while let Some(&(timestamp, important, weight)) = self.events.front() {
            if now.duration_since(timestamp) <= self.window {
                break;
            }
            self.events.pop_front();
            let entry = self
                .counters
                .get_mut(&important)
                .expect("histogram counter missing for recorded event");
            entry.weighted_count -= weight;
            entry.event_count -= 1;
            if entry.weighted_count == 0 {
                self.counters.remove(&important);
                decayed.push(important);
            }
        }
        decayed
    }

    /// Relabels every reference to `old` as `new`; used when a tree split
    /// shifts the important-node identity onto the new intermediate.
    pub fn rename(&mut self, old: NodeId, new: NodeId) {
        if let Some(entry) = self.counters.remove(&old) {
            self.counters.insert(new, entry);
            for event in self.events.iter_mut() {
                if event.1 == old {
                    event.1 = new;
                }
            }
        }
    }

    /// Distributes each node's weighted count evenly across its allocated
    /// workers. Nodes with no allocation entry (or an empty one) contribute
    /// nothing.
    pub fn per_worker_load(&self, allocations: &AllocationMap, num_workers: usize) -> Vec<f64> {
        let mut load = vec![0.0; num_workers];
        for (&node, entry) in &self.counters {
            self.distribute(&mut load, allocations, node, entry.weighted_count);
        }
        load
    }

    /// Same as [`per_worker_load`](Self::per_worker_load) but skips nodes
    /// with fewer than `min_events` recorded events.
    pub fn per_worker_load_min_events(
        &self,
        allocations: &AllocationMap,
        num_workers: usize,
        min_events: u64,
    ) -> Vec<f64> {
        let mut load = vec![0.0; num_workers];
        for (&node, entry) in &self.counters {
            if entry.event_count < min_events {
                continue;
            }
            self.distribute(&mut load, allocations, node, entry.weighted_count);
        }
        load
    }

    fn distribute(
        &self,
        load: &mut [f64],
        allocations: &AllocationMap,
        node: NodeId,
        weighted_count: u64,
    ) {
        let Some(workers) = allocations.get(node) else {
            return;
        };
        if workers.is_empty() {
            return;
        }
        let share = weighted_count as f64 / workers.len() as f64;
        for &w in workers {
            load[w] += share;
        }
    }

    pub fn weighted_count(&self, node: NodeId) -> Option<u64> {
        self.counters.get(&node).map(|e| e.weighted_count)
    }

    pub fn event_count(&self, node: NodeId) -> Option<u64> {
        self.counters.get(&node).map(|e| e.event_count)
    }

    /// Iterates `(node, weighted_count, event_count, first_seen)` for the
    /// rebalancer's candidate heap.
    pub fn entries(&self) -> impl Iterator<Item = (NodeId, u64, u64, u64)> + '_ {
        self.counters
            .iter()
            .map(|(&node, e)| (node, e.weighted_count, e.event_count, e.first_seen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prefix_router::scheduler::radix_tree::RadixTree;

    fn node_pair() -> (RadixTree, NodeId, NodeId) {
        let mut tree = RadixTree::new(2);
        let mut splits = Vec::new();
        let a = tree.insert(&[1, 2, 3], Instant::now(), &mut splits);
        let b = tree.insert(&[7, 8, 9], Instant::now(), &mut splits);
        (tree, a, b)
    }

    #[test]
    fn test_update_accumulates_weight_and_events() {
        let (_tree, a, _) = node_pair();
        let mut histogram = SlidingWindowHistogram::new(Duration::from_secs(180));
        let t0 = Instant::now();
        histogram.update(t0, a, 3);
        histogram.update(t0 + Duration::from_secs(1), a, 5);
        assert_eq!(histogram.weighted_count(a), Some(8));
        assert_eq!(histogram.event_count(a), Some(2));
    }

    #[test]
    fn test_expired_events_are_purged_and_reported() {
        let (_tree, a, b) = node_pair();
        let mut histogram = SlidingWindowHistogram::new(Duration::from_secs(10));
        let t0 = Instant::now();
        histogram.update(t0, a, 3);
        let decayed = histogram.update(t0 + Duration::from_secs(5), b, 9);
        assert!(decayed.is_empty());
        // `a`'s only event now falls outside the window.
        let decayed = histogram.update(t0 + Duration::from_secs(11), b, 9);
        assert_eq!(decayed, vec![a]);
        assert_eq!(histogram.weighted_count(a), None);
        assert_eq!(histogram.weighted_count(b), Some(18));
    }

    #[test]
    fn test_rename_moves_counters_and_pending_events() {
        let (_tree, a, b) = node_pair();
        let mut histogram = SlidingWindowHistogram::new(Duration::from_secs(10));
        let t0 = Instant::now();
        histogram.update(t0, a, 4);
        histogram.rename(a, b);
        assert_eq!(histogram.weighted_count(a), None);
        assert_eq!(histogram.weighted_count(b), Some(4));
        // The relabelled event expires against the new key without panicking.
        let decayed = histogram.update(t0 + Duration::from_secs(11), b, 4);
        assert!(decayed.is_empty());
        assert_eq!(histogram.weighted_count(b), Some(4));
    }

    #[test]
    fn test_per_worker_load_splits_across_allocation() {
        let (_tree, a, b) = node_pair();
        let mut histogram = SlidingWindowHistogram::new(Duration::from_secs(180));
        let t0 = Instant::now();
        histogram.update(t0, a, 6);
        histogram.update(t0, b, 4);

        let mut allocations = AllocationMap::new(2);
        allocations.set(a, [0, 1].into_iter().collect());
        allocations.set(b, [1].into_iter().collect());

        let load = histogram.per_worker_load(&allocations, 2);
        assert_eq!(load, vec![3.0, 7.0]);
    }

    #[test]
    fn test_min_events_query_skips_cold_nodes() {
        let (_tree, a, b) = node_pair();
        let mut histogram = SlidingWindowHistogram::new(Duration::from_secs(180));
        let t0 = Instant::now();
        histogram.update(t0, a, 6);
        histogram.update(t0, a, 6);
        histogram.update(t0, b, 4);

        let mut allocations = AllocationMap::new(2);
        allocations.set(a, [0].into_iter().collect());
        allocations.set(b, [1].into_iter().collect());

        let load = histogram.per_worker_load_min_events(&allocations, 2, 2);
        assert_eq!(load, vec![12.0, 0.0]);
    }

    #[test]
    fn test_unallocated_nodes_contribute_nothing() {
        let (_tree, a, _) = node_pair();
        let mut histogram = SlidingWindowHistogram::new(Duration::from_secs(180));
        histogram.update(Instant::now(), a, 6);
        let allocations = AllocationMap::new(2);
        assert_eq!(histogram.per_worker_load(&allocations, 2), vec![0.0, 0.0]);
    }
}
