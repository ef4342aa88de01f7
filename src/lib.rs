//! # Prefix Router
//!
//! A prefix-cache-aware request router for fleets of LLM inference workers.
//!
//! Each worker in the fleet holds a local KV-cache keyed by token prefixes.
//! For every incoming request the router decides which worker should serve it
//! so that prefix-cache hits are maximized, worker load stays balanced, and
//! hot prefixes get replicated when a single worker becomes overloaded.
//!
//! ## Features
//!
//! - Shared radix tree over token sequences with split-aware bookkeeping
//! - Sliding-window popularity histogram driving load-aware placement
//! - TTFT-based overload detection and hot-prefix replication
//! - Important-node stealing rebalancer and optional LRU eviction
//!
//! ## Examples
//!
//! ### Routing a request
//!
//! ```no_run
//! use prefix_router::{PrefixRouter, RequestInput, RouterConfig};
//!
//! let router = PrefixRouter::new(RouterConfig::new(2)).unwrap();
//!
//! // Route by raw token ids...
//! let worker = router
//!     .route(RequestInput::Tokens(&[10, 11, 12, 13]), "req-1", None)
//!     .unwrap();
//!
//! // ...or by text, tokenized internally.
//! let other = router
//!     .route(RequestInput::Text("What is the capital of France?"), "req-2", None)
//!     .unwrap();
//!
//! // Workers report back on completion.
//! router
//!     .finish(RequestInput::Tokens(&[10, 11, 12, 13]), "req-1", worker, 0.042, 128)
//!     .unwrap();
//! # let _ = other;
//! ```

// Allow internal modules to reference the crate by its library name
extern crate self as prefix_router;

pub mod config;
pub mod errors;
pub mod models;
pub mod scheduler;
pub mod tokenizer;

// Re-export commonly used types for convenience
pub use config::RouterConfig;
pub use errors::RouterError;
pub use models::{RequestInput, RouteRecord, Token, WorkerId};
pub use scheduler::PrefixRouter;

// Tests are defined in their respective modules with #[cfg(test)]
