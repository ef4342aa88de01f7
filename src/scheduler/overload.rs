use ahash::AHashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use prefix_router::models::WorkerId;
use prefix_router::scheduler::radix_tree::NodeId;

/// TTFT-based overload detector.
///
/// TTFT is a good indicator of an overloaded worker: a prefix whose
/// time-to-first-token doubled between the two halves of the window is
/// being served slower than it just was. The verdict is advisory; only the
/// rebalancer consults it, and only to decide whether to replicate a single
/// hot node.
#[derive(Debug)]
pub struct OverloadDetector {
    window: Duration,
    data: AHashMap<(NodeId, WorkerId), VecDeque<(Instant, f64)>>,
}

impl OverloadDetector {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            data: AHashMap::new(),
        }
    }

    /// Add a new data point and drop entries that fell out of the window.
    pub fn add_sample(&mut self, now: Instant, node: NodeId, worker: WorkerId, ttft: f64) {
        let series = self.data.entry((node, worker)).or_default();
        series.push_back((now, ttft));
        while let Some(&(timestamp, _)) = series.front() {
            if now.duration_since(timestamp) <= self.window {
                break;
            }
            series.pop_front();
        }
    }

    /// Mean TTFT of the first and second half of the window, or `None` when
    /// either half is empty.
    fn half_window_averages(&self, now: Instant, key: (NodeId, WorkerId)) -> Option<(f64, f64)> {
        let series = self.data.get(&key)?;
        let cutoff = now.checked_sub(self.window / 2)?;
        let mut first = (0.0, 0u32);
        let mut second = (0.0, 0u32);
        for &(timestamp, value) in series {
            if timestamp < cutoff {
                first.0 += value;
                first.1 += 1;
            } else {
                second.0 += value;
                second.1 += 1;
            }
        }
        if first.1 == 0 || second.1 == 0 {
            return None;
        }
        Some((first.0 / first.1 as f64, second.0 / second.1 as f64))
    }

    /// True iff both window halves hold samples and the recent mean is at
    /// least twice the older mean.
    pub fn is_overloaded(&self, now: Instant, node: NodeId, worker: WorkerId) -> bool {
        match self.half_window_averages(now, (node, worker)) {
            Some((first, second)) => second >= 2.0 * first,
            None => false,
        }
    }

    /// Relabels a series after a tree split shifted the node identity.
    pub fn rename(&mut self, old: NodeId, new: NodeId, worker: WorkerId) {
        if let Some(series) = self.data.remove(&(old, worker)) {
            self.data.insert((new, worker), series);
        }
    }

    /// Erases the series for `(node, worker)`; called when the node was
    /// replicated off that worker so the ratio does not keep flagging it.
    pub fn delete_after_allocation(&mut self, node: NodeId, worker: WorkerId) {
        self.data.remove(&(node, worker));
    }

    pub fn sample_count(&self, node: NodeId, worker: WorkerId) -> usize {
        self.data.get(&(node, worker)).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prefix_router::scheduler::radix_tree::RadixTree;

    const WINDOW: Duration = Duration::from_secs(180);

    fn some_node() -> NodeId {
        let mut tree = RadixTree::new(2);
        let mut splits = Vec::new();
        tree.insert(&[1, 2, 3], Instant::now(), &mut splits)
    }

    fn two_nodes() -> (NodeId, NodeId) {
        let mut tree = RadixTree::new(2);
        let mut splits = Vec::new();
        let a = tree.insert(&[1, 2, 3], Instant::now(), &mut splits);
        let b = tree.insert(&[7, 8, 9], Instant::now(), &mut splits);
        (a, b)
    }

    #[test]
    fn test_empty_halves_are_not_overloaded() {
        let mut detector = OverloadDetector::new(WINDOW);
        let node = some_node();
        let t0 = Instant::now();
        let now = t0 + WINDOW;
        // No samples at all.
        assert!(!detector.is_overloaded(now, node, 0));
        // Samples only in the second half.
        detector.add_sample(t0 + Duration::from_secs(150), node, 0, 9.0);
        assert!(!detector.is_overloaded(now, node, 0));
    }

    #[test]
    fn test_doubled_ttft_flags_overload() {
        let mut detector = OverloadDetector::new(WINDOW);
        let node = some_node();
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(150);
        // First half (before now - 90s): mean 1.0.
        detector.add_sample(t0, node, 0, 0.8);
        detector.add_sample(t0 + Duration::from_secs(10), node, 0, 1.2);
        // Second half: mean 2.5.
        detector.add_sample(t0 + Duration::from_secs(100), node, 0, 2.0);
        detector.add_sample(t0 + Duration::from_secs(120), node, 0, 3.0);
        assert!(detector.is_overloaded(now, node, 0));
        // The other worker has no series and stays clean.
        assert!(!detector.is_overloaded(now, node, 1));
    }

    #[test]
    fn test_sub_double_ttft_is_not_overloaded() {
        let mut detector = OverloadDetector::new(WINDOW);
        let node = some_node();
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(150);
        detector.add_sample(t0, node, 0, 1.0);
        detector.add_sample(t0 + Duration::from_secs(120), node, 0, 1.9);
        assert!(!detector.is_overloaded(now, node, 0));
    }

    #[test]
    fn test_samples_expire_with_the_window() {
        let mut detector = OverloadDetector::new(WINDOW);
        let node = some_node();
        let t0 = Instant::now();
        detector.add_sample(t0, node, 0, 1.0);
        detector.add_sample(t0 + WINDOW + Duration::from_secs(1), node, 0, 2.0);
        assert_eq!(detector.sample_count(node, 0), 1);
    }

    #[test]
    fn test_rename_and_delete() {
        let mut detector = OverloadDetector::new(WINDOW);
        let (node, other) = two_nodes();
        let t0 = Instant::now();
        detector.add_sample(t0, node, 0, 1.0);
        detector.rename(node, other, 0);
        assert_eq!(detector.sample_count(node, 0), 0);
        assert_eq!(detector.sample_count(other, 0), 1);
        detector.delete_after_allocation(other, 0);
        assert_eq!(detector.sample_count(other, 0), 0);
    }
}
