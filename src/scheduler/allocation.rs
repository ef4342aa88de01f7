use ahash::{AHashMap, AHashSet};

use prefix_router::models::WorkerId;
use prefix_router::scheduler::radix_tree::{NodeId, RadixTree};

/// Advisory map from tree nodes to the workers chosen to serve them.
///
/// Entries exist only where a placement was explicitly decided. A missing or
/// empty entry means the node inherits from its nearest allocated ancestor;
/// with no allocated ancestor at all, the full worker set applies.
#[derive(Debug)]
pub struct AllocationMap {
    map: AHashMap<NodeId, AHashSet<WorkerId>>,
    num_workers: usize,
}

impl AllocationMap {
    pub fn new(num_workers: usize) -> Self {
        Self {
            map: AHashMap::new(),
            num_workers,
        }
    }

    pub fn get(&self, node: NodeId) -> Option<&AHashSet<WorkerId>> {
        self.map.get(&node)
    }

    pub fn contains(&self, node: NodeId, worker: WorkerId) -> bool {
        self.map.get(&node).is_some_and(|set| set.contains(&worker))
    }

    /// Overwrites the entry for `node`.
    pub fn set(&mut self, node: NodeId, workers: AHashSet<WorkerId>) {
        self.map.insert(node, workers);
    }

    /// Adds one worker to the entry for `node` (replication).
    pub fn insert_worker(&mut self, node: NodeId, worker: WorkerId) {
        self.map.entry(node).or_default().insert(worker);
    }

    /// Resets the entry for `node` to the empty set; inheritance then skips
    /// it. Used when the node's histogram counter decays to zero.
    pub fn clear(&mut self, node: NodeId) {
        self.map.insert(node, AHashSet::new());
    }

    /// Removes `worker` from the entry for `node`, if present.
    pub fn remove_worker(&mut self, node: NodeId, worker: WorkerId) {
        if let Some(set) = self.map.get_mut(&node) {
            set.remove(&worker);
        }
    }

    /// Worker set governing `node`: its own entry if non-empty, else the
    /// nearest allocated ancestor's, else the full worker set.
    pub fn parent_allocation(&self, tree: &RadixTree, node: NodeId) -> AHashSet<WorkerId> {
        let mut cur = Some(node);
        while let Some(id) = cur {
            if let Some(set) = self.map.get(&id) {
                if !set.is_empty() {
                    return set.clone();
                }
            }
            cur = tree.parent(id);
        }
        (0..self.num_workers).collect()
    }

    /// Unions `workers` into the entry of `node` and every ancestor up to
    /// and including the root.
    pub fn propagate_upwards(&mut self, tree: &RadixTree, node: NodeId, workers: &AHashSet<WorkerId>) {
        let mut cur = Some(node);
        while let Some(id) = cur {
            self.map.entry(id).or_default().extend(workers.iter().copied());
            cur = tree.parent(id);
        }
    }

    /// Copies each split child's entry onto its new intermediate so the
    /// reshaped path keeps the placement decided for the old node.
    pub fn handle_splits(&mut self, splits: &[(NodeId, NodeId)]) {
        for &(child, intermediate) in splits {
            if let Some(set) = self.map.get(&child).cloned() {
                self.map.insert(intermediate, set);
            }
        }
    }

    /// Overwrites every descendant of `node` (excluding `node` itself) to
    /// `{worker}`; reassignment cascades so a stolen subtree belongs to a
    /// single worker afterwards.
    pub fn overwrite_subtree(&mut self, tree: &RadixTree, node: NodeId, worker: WorkerId) {
        let children: Vec<NodeId> = tree.children(node).collect();
        for child in children {
            self.map.insert(child, std::iter::once(worker).collect());
            self.overwrite_subtree(tree, child, worker);
        }
    }

    /// Removes `worker` from `node` and its descendants, pruning the walk at
    /// the first node that does not carry the worker.
    pub fn remove_worker_subtree(&mut self, tree: &RadixTree, node: NodeId, worker: WorkerId) {
        if !self.contains(node, worker) {
            return;
        }
        if let Some(set) = self.map.get_mut(&node) {
            set.remove(&worker);
        }
        let children: Vec<NodeId> = tree.children(node).collect();
        for child in children {
            self.remove_worker_subtree(tree, child, worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn worker_set<const N: usize>(workers: [WorkerId; N]) -> AHashSet<WorkerId> {
        workers.into_iter().collect()
    }

    #[test]
    fn test_parent_allocation_inherits_and_defaults() {
        let mut tree = RadixTree::new(3);
        let mut splits = Vec::new();
        let leaf = tree.insert(&[1, 2, 3, 4, 5], Instant::now(), &mut splits);
        let mut allocations = AllocationMap::new(3);

        // Nothing allocated anywhere: full worker set.
        assert_eq!(
            allocations.parent_allocation(&tree, leaf),
            worker_set([0, 1, 2])
        );

        // An empty entry is skipped, a non-empty ancestor entry wins.
        allocations.clear(leaf);
        allocations.set(tree.root(), worker_set([2]));
        assert_eq!(allocations.parent_allocation(&tree, leaf), worker_set([2]));

        // The node's own non-empty entry takes precedence.
        allocations.set(leaf, worker_set([0]));
        assert_eq!(allocations.parent_allocation(&tree, leaf), worker_set([0]));
    }

    #[test]
    fn test_propagate_upwards_unions_along_path() {
        let mut tree = RadixTree::new(2);
        let mut splits = Vec::new();
        tree.insert(&[1, 2], Instant::now(), &mut splits);
        let leaf = tree.insert(&[1, 2, 3, 4, 5], Instant::now(), &mut splits);
        let mut allocations = AllocationMap::new(2);

        allocations.propagate_upwards(&tree, leaf, &worker_set([0]));
        allocations.propagate_upwards(&tree, leaf, &worker_set([1]));

        let mut cur = Some(leaf);
        while let Some(id) = cur {
            assert_eq!(allocations.get(id), Some(&worker_set([0, 1])));
            cur = tree.parent(id);
        }
    }

    #[test]
    fn test_handle_splits_copies_child_entry() {
        let mut tree = RadixTree::new(2);
        let mut splits = Vec::new();
        let first = tree.insert(&[1, 2, 3, 4], Instant::now(), &mut splits);
        let mut allocations = AllocationMap::new(2);
        allocations.set(first, worker_set([1]));

        tree.insert(&[1, 2, 9], Instant::now(), &mut splits);
        allocations.handle_splits(&splits);
        let (child, intermediate) = splits[0];
        assert_eq!(allocations.get(intermediate), Some(&worker_set([1])));
        assert_eq!(allocations.get(child), Some(&worker_set([1])));
    }

    #[test]
    fn test_overwrite_subtree_rewrites_descendants_only() {
        let mut tree = RadixTree::new(2);
        let mut splits = Vec::new();
        let a = tree.insert(&[1, 2, 3, 4], Instant::now(), &mut splits);
        let b = tree.insert(&[1, 2, 3, 4, 5, 6, 7, 8, 9], Instant::now(), &mut splits);
        let mut allocations = AllocationMap::new(2);
        allocations.set(a, worker_set([0]));
        allocations.set(b, worker_set([0]));

        allocations.overwrite_subtree(&tree, a, 1);
        assert_eq!(allocations.get(a), Some(&worker_set([0])));
        assert_eq!(allocations.get(b), Some(&worker_set([1])));
    }

    #[test]
    fn test_remove_worker_subtree_prunes_at_missing_worker() {
        let mut tree = RadixTree::new(2);
        let mut splits = Vec::new();
        let a = tree.insert(&[1, 2], Instant::now(), &mut splits);
        let b = tree.insert(&[1, 2, 3], Instant::now(), &mut splits);
        let c = tree.insert(&[1, 2, 3, 4], Instant::now(), &mut splits);
        let mut allocations = AllocationMap::new(2);
        allocations.set(a, worker_set([0, 1]));
        allocations.set(b, worker_set([1]));
        allocations.set(c, worker_set([0, 1]));

        allocations.remove_worker_subtree(&tree, a, 0);
        assert_eq!(allocations.get(a), Some(&worker_set([1])));
        // `b` never carried worker 0, so the walk pruned there and `c`
        // keeps its entry.
        assert_eq!(allocations.get(c), Some(&worker_set([0, 1])));
    }
}
