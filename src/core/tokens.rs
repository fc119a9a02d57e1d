// src/core/tokens.rs — Token estimates for streams without vendor usage

use crate::provider::Message;

/// Whitespace word count. Rough, but stable and vendor-neutral.
pub fn estimate_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

/// Estimated prompt size: every message in the request counts.
pub fn estimate_input(messages: &[Message]) -> u32 {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}
