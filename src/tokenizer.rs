use std::sync::OnceLock;
use tiktoken_rs::{cl100k_base, CoreBPE};

use prefix_router::models::Token;

/// Returns a reference to the process-wide tiktoken tokenizer
pub fn get_tokenizer() -> &'static CoreBPE {
    static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();
    TOKENIZER.get_or_init(|| cl100k_base().expect("Failed to initialize tiktoken tokenizer"))
}

/// Encodes text into the token ids the placement engine operates on.
///
/// The concrete tokenizer only needs to be stable for the lifetime of the
/// router process; workers key their KV-caches by the same ids.
pub fn encode(text: &str) -> Vec<Token> {
    get_tokenizer().encode_with_special_tokens(text)
}
