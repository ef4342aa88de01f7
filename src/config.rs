use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use prefix_router::errors::RouterError;

/// Configuration for the placement engine.
///
/// Everything except `num_workers` has a default matching the production
/// deployment the defaults were lifted from. Configs can be built
/// programmatically with [`RouterConfig::new`] or loaded from a JSON file
/// with [`RouterConfig::from_file`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Number of workers in the fleet (required, >= 1)
    pub num_workers: usize,

    /// Sliding window shared by the popularity histogram and the TTFT
    /// overload detector, in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Rebalance trigger: hottest worker load must exceed this multiple of
    /// the coldest worker load
    #[serde(default = "default_high_load_threshold")]
    pub high_load_threshold: f64,

    /// Per-worker KV-cache budget in tokens; eviction threshold
    #[serde(default = "default_per_worker_capacity_tokens")]
    pub per_worker_capacity_tokens: u64,

    /// Evict least-recently-used prefixes once a worker exceeds its token
    /// budget
    #[serde(default)]
    pub enable_eviction: bool,

    /// Run the important-node stealing rebalancer after each placement
    #[serde(default = "default_true")]
    pub enable_rebalancing: bool,

    /// Warm-up guard: total routed requests before rebalancing kicks in
    #[serde(default = "default_rebalance_min_total_load")]
    pub rebalance_min_total_load: u64,

    /// Minimum event count for a prefix to contribute to the min-events
    /// per-worker load query
    #[serde(default = "default_min_events_for_load")]
    pub min_events_for_load: u64,
}

fn default_window_secs() -> u64 {
    180
}

fn default_high_load_threshold() -> f64 {
    1.4
}

fn default_per_worker_capacity_tokens() -> u64 {
    198_516
}

fn default_true() -> bool {
    true
}

fn default_rebalance_min_total_load() -> u64 {
    50
}

fn default_min_events_for_load() -> u64 {
    2
}

impl RouterConfig {
    /// Create a configuration with defaults for the given fleet size
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            window_secs: default_window_secs(),
            high_load_threshold: default_high_load_threshold(),
            per_worker_capacity_tokens: default_per_worker_capacity_tokens(),
            enable_eviction: false,
            enable_rebalancing: true,
            rebalance_min_total_load: default_rebalance_min_total_load(),
            min_events_for_load: default_min_events_for_load(),
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: RouterConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// The sliding window as a [`Duration`]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Validate field ranges; called by the router constructor
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.num_workers < 1 {
            return Err(RouterError::InvalidConfig(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(RouterError::InvalidConfig(
                "window_secs must be positive".to_string(),
            ));
        }
        if self.high_load_threshold < 1.0 {
            return Err(RouterError::InvalidConfig(format!(
                "high_load_threshold must be >= 1.0, got {}",
                self.high_load_threshold
            )));
        }
        Ok(())
    }
}
