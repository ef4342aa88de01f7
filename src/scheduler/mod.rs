// Re-export all scheduler module components
pub mod allocation;
pub mod histogram;
pub mod overload;
pub mod radix_tree;
mod router;

// Public exports
pub use router::PrefixRouter;
