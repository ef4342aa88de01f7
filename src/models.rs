use chrono::{DateTime, Utc};
use serde::Serialize;

/// A token id as produced by the tokenizer (tiktoken rank).
pub type Token = u32;

/// Opaque id of an inference worker, in `[0, num_workers)`.
pub type WorkerId = usize;

/// Request body accepted by `route`/`finish`: either raw text (tokenized
/// internally) or a pre-tokenized sequence.
#[derive(Debug, Clone, Copy)]
pub enum RequestInput<'a> {
    Text(&'a str),
    Tokens(&'a [Token]),
}

impl<'a> From<&'a str> for RequestInput<'a> {
    fn from(text: &'a str) -> Self {
        RequestInput::Text(text)
    }
}

impl<'a> From<&'a [Token]> for RequestInput<'a> {
    fn from(tokens: &'a [Token]) -> Self {
        RequestInput::Tokens(tokens)
    }
}

// Structure to hold one entry of the in-memory observability log
#[derive(Debug, Clone, Serialize)]
pub struct RouteRecord {
    /// Caller-supplied request identifier
    pub request_id: String,
    /// Worker the request was placed on
    pub worker: WorkerId,
    /// Time spent inside the router for this placement
    pub overhead_seconds: f64,
    /// Wall-clock time of the decision (logging only; all scheduling state
    /// is keyed by a monotonic clock)
    pub timestamp: DateTime<Utc>,
    /// Original request text, when the caller routed by text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}
