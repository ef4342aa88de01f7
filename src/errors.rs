// Error types for the router API

/// Errors reported to callers of [`crate::PrefixRouter`].
///
/// These cover invalid input only; internal inconsistencies (ref-count
/// underflow, allocation accounting going negative) panic instead, since the
/// router is ephemeral and a restart loses nothing durable.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("empty token sequence")]
    EmptyTokenSequence,

    #[error("unknown worker id {worker} (fleet has {num_workers} workers)")]
    UnknownWorker { worker: usize, num_workers: usize },

    #[error("sequence was never routed")]
    UnknownSequence,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
