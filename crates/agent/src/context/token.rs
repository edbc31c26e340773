//! Token estimation strategies.
//!
//! The context window never counts tokens itself; it asks a
//! [`TokenEstimator`]. Swapping in an exact tokenizer only means
//! implementing the trait.

use agentloom_core::message::Turn;

/// Fixed cost of a turn on the wire: role name, delimiters, formatting markers.
pub const TURN_OVERHEAD: usize = 4;

/// Estimates how many model tokens a piece of text costs.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;

    /// Estimate a whole turn, including any tool calls it carries.
    fn estimate_turn(&self, turn: &Turn) -> usize {
        let calls: usize = turn
            .tool_calls
            .iter()
            .map(|tc| self.estimate(tc.name()) + self.estimate(tc.arguments()))
            .sum();
        TURN_OVERHEAD + self.estimate(&turn.content) + calls
    }
}

/// Script-aware heuristic.
///
/// Logographic and syllabic East-Asian scripts pack more meaning per
/// character than space-delimited scripts, so each class gets its own
/// divisor: ~1.5 chars/token for CJK, ~2 for other non-ASCII, ~4 for ASCII.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> usize {
        let (mut cjk, mut other, mut ascii) = (0usize, 0usize, 0usize);
        for c in text.chars() {
            if c.is_ascii() {
                ascii += 1;
            } else if is_cjk(c) {
                cjk += 1;
            } else {
                other += 1;
            }
        }
        let tokens = cjk as f64 / 1.5 + other as f64 / 2.0 + ascii as f64 / 4.0;
        tokens.ceil() as usize
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF     // hiragana, katakana
        | 0x3400..=0x4DBF   // CJK extension A
        | 0x4E00..=0x9FFF   // CJK unified
        | 0xAC00..=0xD7AF   // hangul syllables
        | 0xF900..=0xFAFF   // CJK compatibility
        | 0x20000..=0x2A6DF)
}

/// Plain characters-per-token ratio. Rounds up.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}
