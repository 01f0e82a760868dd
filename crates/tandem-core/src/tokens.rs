//! Token cost estimation without a real tokenizer
//!
//! Wide characters (CJK ideographs, kana, hangul, full-width forms) cost one
//! token each, everything else three quarters of a token. Sums are kept in
//! quarter-token units so rounding up is exact.

use crate::types::Message;

/// Fixed cost charged per message for role and formatting metadata
pub const MESSAGE_OVERHEAD: u64 = 4;

const WIDE_QUARTERS: u64 = 4;
const NARROW_QUARTERS: u64 = 3;

/// Estimate the token cost of a text blob
pub fn estimate(text: &str) -> u64 {
    let quarters: u64 = text
        .chars()
        .map(|c| if is_wide(c) { WIDE_QUARTERS } else { NARROW_QUARTERS })
        .sum();
    quarters.div_ceil(4)
}

/// Estimated cost of a single message including its overhead
pub fn estimate_message(message: &Message) -> u64 {
    estimate(&message.content) + MESSAGE_OVERHEAD
}

/// Estimated cost of a whole history
pub fn estimate_history(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message).sum()
}

fn is_wide(c: char) -> bool {
    matches!(
        c as u32,
        0x3000..=0x303F       // CJK symbols and punctuation
            | 0x3040..=0x30FF // hiragana, katakana
            | 0x3400..=0x4DBF // CJK extension A
            | 0x4E00..=0x9FFF // CJK unified ideographs
            | 0xAC00..=0xD7AF // hangul syllables
            | 0xF900..=0xFAFF // CJK compatibility ideographs
            | 0xFF00..=0xFFEF // half-width and full-width forms
            | 0x20000..=0x2FA1F
    )
}
