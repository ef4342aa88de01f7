use ahash::AHashSet;
use chrono::Utc;
use rand::seq::SliceRandom;
use std::borrow::Cow;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info, warn};

use prefix_router::config::RouterConfig;
use prefix_router::errors::RouterError;
use prefix_router::models::{RequestInput, RouteRecord, Token, WorkerId};
use prefix_router::scheduler::allocation::AllocationMap;
use prefix_router::scheduler::histogram::SlidingWindowHistogram;
use prefix_router::scheduler::overload::OverloadDetector;
use prefix_router::scheduler::radix_tree::{NodeId, RadixTree};
use prefix_router::tokenizer;

/// Prefix-cache-aware router for a fleet of inference workers.
///
/// One coarse mutex guards the whole placement datum (tree, histogram,
/// allocation map, overload detector, per-worker counters); `route` and
/// `finish` hold it for their full duration. Each critical section is
/// O(depth + num_workers), so the lock is never the bottleneck next to the
/// inference work downstream.
#[derive(Debug)]
pub struct PrefixRouter {
    config: RouterConfig,
    state: Mutex<RouterState>,
    /// In-memory observability log, appended outside the placement lock
    records: Mutex<Vec<RouteRecord>>,
}

#[derive(Debug)]
struct RouterState {
    tree: RadixTree,
    histogram: SlidingWindowHistogram,
    overload: OverloadDetector,
    allocations: AllocationMap,
    /// Requests routed per worker since startup; gates the rebalancer
    per_worker_requests: Vec<u64>,
}

impl PrefixRouter {
    pub fn new(config: RouterConfig) -> Result<Self, RouterError> {
        config.validate()?;
        let state = RouterState {
            tree: RadixTree::new(config.num_workers),
            histogram: SlidingWindowHistogram::new(config.window()),
            overload: OverloadDetector::new(config.window()),
            allocations: AllocationMap::new(config.num_workers),
            per_worker_requests: vec![0; config.num_workers],
        };
        Ok(Self {
            config,
            state: Mutex::new(state),
            records: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Picks a worker for the request and records the placement.
    ///
    /// `preferred_worker` short-circuits the cost computation (e.g. a
    /// highest-hit-rate hint from the caller); small leaves inherit their
    /// parent's placement regardless of the hint.
    pub fn route(
        &self,
        input: RequestInput<'_>,
        request_id: &str,
        preferred_worker: Option<WorkerId>,
    ) -> Result<WorkerId, RouterError> {
        let started = Instant::now();
        let tokens = resolve_tokens(input);
        if tokens.is_empty() {
            return Err(RouterError::EmptyTokenSequence);
        }
        if let Some(worker) = preferred_worker {
            if worker >= self.config.num_workers {
                return Err(RouterError::UnknownWorker {
                    worker,
                    num_workers: self.config.num_workers,
                });
            }
        }

        let worker = {
            let mut state = self.state.lock().expect("placement state poisoned");
            state.place(&self.config, &tokens, preferred_worker, started)
        };

        let record = RouteRecord {
            request_id: request_id.to_string(),
            worker,
            overhead_seconds: started.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
            text: match input {
                RequestInput::Text(text) => Some(text.to_string()),
                RequestInput::Tokens(_) => None,
            },
        };
        self.records.lock().expect("record log poisoned").push(record);
        Ok(worker)
    }

    /// Reports a completed request: feeds the TTFT sample to the overload
    /// detector and releases the cached tokens.
    ///
    /// Must be called exactly once per successful `route`; a second call for
    /// the same `(sequence, worker)` underflows the reference counters and
    /// panics.
    pub fn finish(
        &self,
        input: RequestInput<'_>,
        request_id: &str,
        worker: WorkerId,
        ttft_seconds: f64,
        output_len: usize,
    ) -> Result<(), RouterError> {
        let now = Instant::now();
        let tokens = resolve_tokens(input);
        if tokens.is_empty() {
            return Err(RouterError::EmptyTokenSequence);
        }
        if worker >= self.config.num_workers {
            return Err(RouterError::UnknownWorker {
                worker,
                num_workers: self.config.num_workers,
            });
        }
        let mut state = self.state.lock().expect("placement state poisoned");
        state.complete(&tokens, worker, ttft_seconds, now)?;
        drop(state);
        debug!(
            "request {request_id} finished on worker {worker}: ttft {ttft_seconds:.3}s, {output_len} output tokens"
        );
        Ok(())
    }

    /// Snapshot of the per-request observability log.
    pub fn records(&self) -> Vec<RouteRecord> {
        self.records.lock().expect("record log poisoned").clone()
    }

    /// Renders the prefix tree with per-node cache and allocation state, one
    /// line per node. Debugging aid.
    pub fn dump_tree(&self) -> String {
        let state = self.state.lock().expect("placement state poisoned");
        let mut out = String::new();
        state.dump_node(state.tree.root(), 0, &mut out);
        out
    }
}

fn resolve_tokens(input: RequestInput<'_>) -> Cow<'_, [Token]> {
    match input {
        RequestInput::Text(text) => Cow::Owned(tokenizer::encode(text)),
        RequestInput::Tokens(tokens) => Cow::Borrowed(tokens),
    }
}

/// Uniform pick from the candidate set; deterministic for a single
/// candidate.
fn pick_worker(candidates: &AHashSet<WorkerId>) -> WorkerId {
    let mut workers: Vec<WorkerId> = candidates.iter().copied().collect();
    if workers.len() == 1 {
        return workers[0];
    }
    workers.sort_unstable();
    *workers
        .choose(&mut rand::thread_rng())
        .expect("candidate set is never empty")
}

impl RouterState {
    fn place(
        &mut self,
        config: &RouterConfig,
        tokens: &[Token],
        preferred: Option<WorkerId>,
        now: Instant,
    ) -> WorkerId {
        let mut splits = Vec::new();
        let leaf = self.tree.insert(tokens, now, &mut splits);
        self.allocations.handle_splits(&splits);
        self.handle_split_renames(&splits);

        let important = self.tree.important_node(leaf);
        let num_tokens = self.tree.num_tokens(leaf);
        let context_length = self.tree.context_length(leaf);
        let leaf_is_small = num_tokens < context_length - num_tokens;

        let candidates: AHashSet<WorkerId> = if leaf_is_small {
            // The leaf extends an established prefix; follow its placement.
            self.allocations.parent_allocation(&self.tree, leaf)
        } else if let Some(worker) = preferred {
            std::iter::once(worker).collect()
        } else {
            std::iter::once(self.min_cost_worker(config, leaf)).collect()
        };
        let candidates: AHashSet<WorkerId> = if candidates.is_empty() {
            (0..config.num_workers).collect()
        } else {
            candidates
        };

        for node in self.histogram.update(now, important, context_length as u64) {
            debug!("histogram entry decayed; resetting allocation for {node:?}");
            self.allocations.clear(node);
        }

        let worker = pick_worker(&candidates);
        debug!(
            "placed request on worker {worker} (small={leaf_is_small}, context={context_length})"
        );
        let chosen: AHashSet<WorkerId> = std::iter::once(worker).collect();
        self.allocations.propagate_upwards(&self.tree, leaf, &chosen);
        self.per_worker_requests[worker] += 1;
        self.tree.mark_cached_upwards(leaf, worker);

        if config.enable_eviction {
            self.handle_eviction(worker, config);
        }
        if config.enable_rebalancing {
            self.rebalance(config, now);
        }
        worker
    }

    fn complete(
        &mut self,
        tokens: &[Token],
        worker: WorkerId,
        ttft: f64,
        now: Instant,
    ) -> Result<(), RouterError> {
        let Some(leaf) = self.tree.find(tokens) else {
            return Err(RouterError::UnknownSequence);
        };
        let important = self.tree.important_node(leaf);
        self.overload.add_sample(now, important, worker, ttft);
        self.tree.remove_completed(tokens, worker, now);
        Ok(())
    }

    /// Basic recompute cost: walk ancestors until the root or a node already
    /// cached on `worker`, summing `num_tokens * ref_counter[worker]` over
    /// the uncached prefix.
    fn recompute_cost_basic(&self, node: Option<NodeId>, worker: WorkerId) -> u64 {
        let mut cost = 0u64;
        let mut cur = node;
        while let Some(id) = cur {
            if self.tree.has_cached(id, worker) {
                break;
            }
            cost += self.tree.num_tokens(id) as u64 * self.tree.ref_count(id, worker);
            cur = self.tree.parent(id);
        }
        cost
    }

    /// Argmin over recompute cost plus current histogram load; ties go to
    /// the lowest worker id.
    fn min_cost_worker(&self, config: &RouterConfig, leaf: NodeId) -> WorkerId {
        let load = self
            .histogram
            .per_worker_load(&self.allocations, config.num_workers);
        let parent = self.tree.parent(leaf);
        let mut best = 0;
        let mut best_cost = f64::INFINITY;
        for worker in 0..config.num_workers {
            let recompute = self.recompute_cost_basic(parent, worker) as f64;
            let cost = recompute + load[worker];
            if cost < best_cost {
                best = worker;
                best_cost = cost;
            }
        }
        best
    }

    /// After a split, popularity accounting follows the structure: when the
    /// new intermediate is large and the old child no longer is, the
    /// important-node identity moved and histogram plus overload series are
    /// relabelled.
    fn handle_split_renames(&mut self, splits: &[(NodeId, NodeId)]) {
        for &(child, intermediate) in splits {
            if self.tree.is_large(intermediate) && !self.tree.is_large(child) {
                debug!("split shifted importance: renaming {child:?} -> {intermediate:?}");
                self.histogram.rename(child, intermediate);
                if let Some(workers) = self.allocations.get(child) {
                    let workers: Vec<WorkerId> = workers.iter().copied().collect();
                    for worker in workers {
                        self.overload.rename(child, intermediate, worker);
                    }
                }
            }
        }
    }

    /// Important-node stealing: move (or replicate) hot prefixes from the
    /// most loaded worker to the least loaded one.
    fn rebalance(&mut self, config: &RouterConfig, now: Instant) {
        let total: u64 = self.per_worker_requests.iter().sum();
        if total < config.rebalance_min_total_load {
            return;
        }
        let load = self
            .histogram
            .per_worker_load(&self.allocations, config.num_workers);
        let mut ranked: Vec<(WorkerId, f64)> = load.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        self.steal_recursive(&mut ranked, config, now);
    }

    fn steal_recursive(
        &mut self,
        ranked: &mut [(WorkerId, f64)],
        config: &RouterConfig,
        now: Instant,
    ) {
        if ranked.len() <= 1 {
            return;
        }
        let (hot_id, mut hot) = ranked[0];
        let last = ranked.len() - 1;
        let (cold_id, mut cold) = ranked[last];
        if hot < config.high_load_threshold * cold {
            return;
        }

        // Min-heap of candidate nodes on the hot worker; FIFO insertion
        // order breaks cost ties.
        let mut heap: BinaryHeap<Reverse<(u64, u64, NodeId)>> = BinaryHeap::new();
        for (node, weighted_count, event_count, first_seen) in self.histogram.entries() {
            if event_count > 1 && self.allocations.contains(node, hot_id) {
                heap.push(Reverse((weighted_count, first_seen, node)));
            }
        }

        if heap.len() == 1 {
            let Some(Reverse((cost, _, node))) = heap.pop() else {
                unreachable!();
            };
            // Replication splits the node's future load in two.
            let half = cost as f64 / 2.0;
            if !self.allocations.contains(node, cold_id)
                && self.overload.is_overloaded(now, node, hot_id)
            {
                hot -= half;
                cold += half;
                self.allocations.insert_worker(node, cold_id);
                self.overload.delete_after_allocation(node, hot_id);
                info!(
                    "replicated overloaded node {node:?} from worker {hot_id} to worker {cold_id}"
                );
            }
        } else {
            while let Some(Reverse((cost, _, node))) = heap.pop() {
                if !self.tree.is_large(node) {
                    // A later split can leave a histogram key on a node
                    // whose own segment no longer dominates; skip it.
                    debug!("skipping non-large steal candidate {node:?}");
                    continue;
                }
                if self.allocations.contains(node, cold_id) {
                    continue;
                }
                let cost = cost as f64;
                if hot - cost < cold + cost {
                    break;
                }
                hot -= cost;
                cold += cost;
                self.allocations
                    .set(node, std::iter::once(cold_id).collect());
                self.allocations.overwrite_subtree(&self.tree, node, cold_id);
                info!("reassigned node {node:?} from worker {hot_id} to worker {cold_id}");
            }
        }

        ranked[0] = (hot_id, hot);
        ranked[last] = (cold_id, cold);
        self.steal_recursive(&mut ranked[1..], config, now);
    }

    /// Evicts least-recently-used prefixes once the worker exceeds its token
    /// budget, dropping the worker from the evicted nodes' allocation
    /// entries (and from whole subtrees under evicted large nodes).
    fn handle_eviction(&mut self, worker: WorkerId, config: &RouterConfig) {
        let allocated = self.tree.allocated_size(worker);
        let capacity = config.per_worker_capacity_tokens;
        if allocated <= capacity {
            return;
        }
        let evicted = self.tree.evict(worker, allocated - capacity);
        for &node in &evicted {
            self.allocations.remove_worker(node, worker);
            if self.tree.is_large(node) {
                let children: Vec<NodeId> = self.tree.children(node).collect();
                for child in children {
                    self.allocations
                        .remove_worker_subtree(&self.tree, child, worker);
                }
            }
        }
        let remaining = self.tree.allocated_size(worker);
        if remaining > capacity {
            warn!(
                "eviction on worker {worker} freed too little: {remaining} tokens still cached \
                 (budget {capacity}); continuing to serve"
            );
        } else {
            debug!("evicted {} node(s) from worker {worker}", evicted.len());
        }
    }

    fn dump_node(&self, node: NodeId, indent: usize, out: &mut String) {
        let mut children: Vec<NodeId> = self.tree.children(node).collect();
        children.sort_by_key(|&child| self.tree.value(child)[0]);
        for child in children {
            let allocated = self
                .allocations
                .get(child)
                .map(|set| {
                    let mut workers: Vec<WorkerId> = set.iter().copied().collect();
                    workers.sort_unstable();
                    workers
                })
                .unwrap_or_default();
            let value = self.tree.value(child);
            let shown = &value[..value.len().min(8)];
            let _ = writeln!(
                out,
                "{}{shown:?} cached={:?} allocated={allocated:?} evicted={:?} {}",
                "  ".repeat(indent),
                self.tree.cached_workers(child),
                self.tree.evicted_workers(child),
                self.tree.num_tokens(child),
            );
            self.dump_node(child, indent + 1, out);
        }
    }
}
