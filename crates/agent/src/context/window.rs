//! Bounded conversational memory.
//!
//! A [`ContextWindow`] is an append-only log of turns with incrementally
//! maintained token/character totals. When the turn count exceeds
//! `max_history` the oldest turns are evicted; turns evicted before they were
//! folded into the running summary are counted as *lossy* evictions.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use agentloom_config::ContextConfig;
use agentloom_core::message::{Role, Turn};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::token::{HeuristicEstimator, TokenEstimator};

/// Limits applied by a [`ContextWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSettings {
    /// Maximum number of turns retained
    pub max_history: usize,
    /// Token budget for the history handed to the model
    pub max_tokens: usize,
    /// Converts the token budget into a character budget
    pub chars_per_token: usize,
    /// Unsummarized turns that trigger summarization; 0 disables it
    pub summary_threshold: usize,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self::from(&ContextConfig::default())
    }
}

impl From<&ContextConfig> for WindowSettings {
    fn from(config: &ContextConfig) -> Self {
        Self {
            max_history: config.max_history.max(1),
            max_tokens: config.max_tokens,
            chars_per_token: config.chars_per_token.max(1),
            summary_threshold: config.summary_threshold,
        }
    }
}

/// What a single append evicted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Eviction {
    pub evicted: usize,
    /// Evicted turns that were never covered by the summary
    pub lossy: usize,
}

/// Point-in-time accounting of a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStats {
    pub turns: usize,
    pub total_tokens: usize,
    pub total_chars: usize,
    pub summarized_count: usize,
    pub lossy_evictions: usize,
    pub evicted_turns: usize,
}

#[derive(Clone)]
pub struct ContextWindow {
    turns: VecDeque<Turn>,
    total_tokens: usize,
    total_chars: usize,
    summary: Option<String>,
    summarized_count: usize,
    lossy_evictions: usize,
    evicted_turns: usize,
    settings: WindowSettings,
    estimator: Arc<dyn TokenEstimator>,
}

impl ContextWindow {
    pub fn new(settings: WindowSettings) -> Self {
        Self::with_estimator(settings, Arc::new(HeuristicEstimator))
    }

    pub fn with_estimator(settings: WindowSettings, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            turns: VecDeque::new(),
            total_tokens: 0,
            total_chars: 0,
            summary: None,
            summarized_count: 0,
            lossy_evictions: 0,
            evicted_turns: 0,
            settings,
            estimator,
        }
    }

    pub fn settings(&self) -> &WindowSettings {
        &self.settings
    }

    /// Create a turn from its parts and append it.
    pub fn add_turn(
        &mut self,
        role: Role,
        content: impl Into<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Eviction {
        self.push(Turn::new(role, content).with_metadata(metadata))
    }

    /// Append a prepared turn, caching its token estimate, then evict the
    /// oldest turns beyond `max_history`.
    pub fn push(&mut self, mut turn: Turn) -> Eviction {
        turn.token_estimate = self.estimator.estimate_turn(&turn);
        self.total_tokens += turn.token_estimate;
        self.total_chars += turn_chars(&turn);
        self.turns.push_back(turn);

        let excess = self.turns.len().saturating_sub(self.settings.max_history);
        self.evict_oldest(excess)
    }

    fn evict_oldest(&mut self, count: usize) -> Eviction {
        let mut eviction = Eviction::default();
        for _ in 0..count {
            let Some(turn) = self.turns.pop_front() else {
                break;
            };
            self.total_tokens -= turn.token_estimate;
            self.total_chars -= turn_chars(&turn);
            eviction.evicted += 1;

            // The summary covers a leading prefix, so the front turn is
            // summarized iff that prefix is non-empty.
            if self.summarized_count > 0 {
                self.summarized_count -= 1;
            } else {
                eviction.lossy += 1;
            }
        }

        self.evicted_turns += eviction.evicted;
        self.lossy_evictions += eviction.lossy;
        if eviction.lossy > 0 {
            warn!(
                lossy = eviction.lossy,
                total_lossy = self.lossy_evictions,
                "Evicted turns that were never summarized"
            );
        } else if eviction.evicted > 0 {
            debug!(evicted = eviction.evicted, "Evicted summarized turns");
        }
        eviction
    }

    /// The most recent turns that fit the character budget
    /// (`max_tokens * chars_per_token`), in chronological order.
    ///
    /// Selection walks newest-first and stops at the first turn that would
    /// overflow, so older context is always dropped before newer.
    pub fn history_within_budget(&self) -> Vec<&Turn> {
        self.select_within(self.turns.len(), self.char_budget())
    }

    fn char_budget(&self) -> usize {
        self.settings
            .max_tokens
            .saturating_mul(self.settings.chars_per_token)
    }

    /// Budgeted selection over `turns[..end]`.
    fn select_within(&self, end: usize, budget: usize) -> Vec<&Turn> {
        let mut used = 0usize;
        let mut selected = Vec::new();

        for turn in self.turns.range(..end).rev() {
            let chars = turn_chars(turn);
            if used + chars > budget {
                break;
            }
            used += chars;
            selected.push(turn);
        }

        selected.reverse();
        selected
    }

    /// Length of the newest exchange: the last turn, or when that is a tool
    /// observation, the assistant turn that requested it plus every
    /// observation after it.
    fn newest_exchange_len(&self) -> usize {
        let observations = self
            .turns
            .iter()
            .rev()
            .take_while(|t| t.role == Role::Tool)
            .count();
        if observations == 0 {
            return usize::from(!self.turns.is_empty());
        }
        let requester = self
            .turns
            .iter()
            .rev()
            .nth(observations)
            .is_some_and(|t| t.role == Role::Assistant && !t.tool_calls.is_empty());
        observations + usize::from(requester)
    }

    pub fn needs_summarization(&self) -> bool {
        self.settings.summary_threshold > 0
            && self.turns.len() - self.summarized_count >= self.settings.summary_threshold
    }

    /// Turns not yet covered by the summary.
    pub fn unsummarized(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().skip(self.summarized_count)
    }

    /// Record a summary covering every turn currently held.
    pub fn set_summary(&mut self, text: impl Into<String>) {
        self.summary = Some(text.into());
        self.summarized_count = self.turns.len();
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    /// Assemble the turn list handed to the model, in fixed order:
    /// system prompt, summary note, budgeted history, current turn.
    ///
    /// Tool observations at the head of the history are skipped; their
    /// originating tool call fell outside the window.
    pub fn build_model_input(&self, system_prompt: Option<&str>, current: Option<Turn>) -> Vec<Turn> {
        let mut input = self.preamble(system_prompt);

        input.extend(
            self.history_within_budget()
                .into_iter()
                .skip_while(|t| t.role == Role::Tool)
                .cloned(),
        );

        if let Some(turn) = current {
            input.push(turn);
        }

        input
    }

    /// Model input for the next step of a run, where the newest exchange
    /// already in the window is the current turn.
    ///
    /// The newest exchange is always sent, even when it alone exceeds the
    /// character budget; only older turns compete for what is left.
    pub fn build_latest_input(&self, system_prompt: Option<&str>) -> Vec<Turn> {
        let split = self.turns.len() - self.newest_exchange_len();
        let current_chars: usize = self.turns.range(split..).map(turn_chars).sum();
        let budget = self.char_budget().saturating_sub(current_chars);

        let mut input = self.preamble(system_prompt);
        input.extend(
            self.select_within(split, budget)
                .into_iter()
                .chain(self.turns.range(split..))
                .skip_while(|t| t.role == Role::Tool)
                .cloned(),
        );
        input
    }

    fn preamble(&self, system_prompt: Option<&str>) -> Vec<Turn> {
        let mut input = Vec::new();

        if let Some(prompt) = system_prompt.filter(|p| !p.is_empty()) {
            input.push(Turn::system(prompt));
        }

        if let Some(summary) = &self.summary {
            input.push(Turn::system(format!(
                "Summary of the earlier conversation:\n{summary}"
            )));
        }

        input
    }

    pub fn turns(&self) -> impl ExactSizeIterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.back()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn total_chars(&self) -> usize {
        self.total_chars
    }

    pub fn summarized_count(&self) -> usize {
        self.summarized_count
    }

    pub fn lossy_evictions(&self) -> usize {
        self.lossy_evictions
    }

    /// Drop every turn and the summary. Eviction counters are kept.
    pub fn clear(&mut self) {
        self.turns.clear();
        self.total_tokens = 0;
        self.total_chars = 0;
        self.summary = None;
        self.summarized_count = 0;
    }

    pub fn stats(&self) -> WindowStats {
        WindowStats {
            turns: self.turns.len(),
            total_tokens: self.total_tokens,
            total_chars: self.total_chars,
            summarized_count: self.summarized_count,
            lossy_evictions: self.lossy_evictions,
            evicted_turns: self.evicted_turns,
        }
    }
}

impl fmt::Debug for ContextWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextWindow")
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .field("has_summary", &self.summary.is_some())
            .finish()
    }
}

fn turn_chars(turn: &Turn) -> usize {
    turn.char_count()
        + turn
            .tool_calls
            .iter()
            .map(|tc| tc.name().chars().count() + tc.arguments().chars().count())
            .sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::token::CharRatioEstimator;
    use agentloom_core::message::TurnToolCall;

    fn settings(max_history: usize) -> WindowSettings {
        WindowSettings {
            max_history,
            max_tokens: 4096,
            chars_per_token: 4,
            summary_threshold: 4,
        }
    }

    fn sum_of_estimates(window: &ContextWindow) -> usize {
        window.turns().map(|t| t.token_estimate).sum()
    }

    #[test]
    fn add_turn_caches_estimate_and_totals() {
        let mut window = ContextWindow::new(settings(10));
        window.add_turn(Role::User, "hello", Default::default());
        let turn = window.last().unwrap();
        assert_eq!(turn.token_estimate, 6); // 4 overhead + 2
        assert_eq!(window.total_tokens(), 6);
        assert_eq!(window.total_chars(), 5);
    }

    #[test]
    fn eviction_keeps_last_max_history_turns() {
        let mut window = ContextWindow::new(settings(3));
        let contents = ["u1", "a1", "u2", "a2", "u3"];
        for (i, c) in contents.iter().enumerate() {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            window.add_turn(role, *c, Default::default());
            assert!(window.len() <= 3);
            assert_eq!(window.total_tokens(), sum_of_estimates(&window));
        }
        let kept: Vec<_> = window.turns().map(|t| t.content.as_str()).collect();
        assert_eq!(kept, vec!["u2", "a2", "u3"]);
        assert_eq!(window.stats().evicted_turns, 2);
    }

    #[test]
    fn totals_stay_consistent_under_long_append_runs() {
        let mut window = ContextWindow::new(settings(5));
        for i in 0..50 {
            let text = "x".repeat(i * 7 % 23) + "你好";
            window.add_turn(Role::User, text, Default::default());
            assert_eq!(window.total_tokens(), sum_of_estimates(&window));
            let chars: usize = window.turns().map(|t| t.char_count()).sum();
            assert_eq!(window.total_chars(), chars);
        }
        assert_eq!(window.len(), 5);
    }

    #[test]
    fn totals_include_tool_call_names_and_arguments() {
        let mut window = ContextWindow::new(settings(4));
        for i in 0..20 {
            let turn = if i % 3 == 0 {
                Turn::assistant("calling").with_tool_calls(vec![TurnToolCall::function(
                    format!("c{i}"),
                    "search",
                    format!(r#"{{"q":"{}"}}"#, "é".repeat(i)),
                )])
            } else {
                Turn::tool_result(format!("c{i}"), "z".repeat(i))
            };
            window.push(turn);
            assert_eq!(window.total_tokens(), sum_of_estimates(&window));
            let chars: usize = window.turns().map(turn_chars).sum();
            assert_eq!(window.total_chars(), chars);
        }

        window.clear();
        window.push(Turn::assistant("ab").with_tool_calls(vec![TurnToolCall::function(
            "c1", "echo", "{}",
        )]));
        // "ab" + "echo" + "{}"
        assert_eq!(window.total_chars(), 8);
    }

    #[test]
    fn budget_selects_newest_first_in_chronological_order() {
        let mut window = ContextWindow::new(WindowSettings {
            max_history: 10,
            max_tokens: 5,
            chars_per_token: 2,
            summary_threshold: 0,
        });
        // budget = 10 chars
        window.add_turn(Role::User, "aaaa", Default::default());
        window.add_turn(Role::Assistant, "bbbb", Default::default());
        window.add_turn(Role::User, "cccc", Default::default());

        let selected: Vec<_> = window
            .history_within_budget()
            .iter()
            .map(|t| t.content.as_str())
            .collect();
        assert_eq!(selected, vec!["bbbb", "cccc"]);
    }

    #[test]
    fn budget_never_drops_newest_turn_that_fits() {
        let mut window = ContextWindow::new(WindowSettings {
            max_history: 100,
            max_tokens: 10,
            chars_per_token: 4,
            summary_threshold: 0,
        });
        for _ in 0..50 {
            window.add_turn(Role::User, "x".repeat(30), Default::default());
        }
        window.add_turn(Role::User, "x".repeat(40), Default::default());
        let selected = window.history_within_budget();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].char_count(), 40);
    }

    #[test]
    fn budget_stops_at_first_overflow() {
        let mut window = ContextWindow::new(WindowSettings {
            max_history: 10,
            max_tokens: 3,
            chars_per_token: 4,
            summary_threshold: 0,
        });
        // budget = 12 chars: newest (2) fits, the 20-char turn overflows,
        // and the older small turn is not considered
        window.add_turn(Role::User, "ab", Default::default());
        window.add_turn(Role::Assistant, "y".repeat(20), Default::default());
        window.add_turn(Role::User, "cd", Default::default());
        let selected: Vec<_> = window.history_within_budget().iter().map(|t| t.content.clone()).collect();
        assert_eq!(selected, vec!["cd".to_string()]);
    }

    #[test]
    fn summarization_threshold_and_snapshot() {
        let mut window = ContextWindow::new(settings(10));
        for i in 0..3 {
            window.add_turn(Role::User, format!("m{i}"), Default::default());
        }
        assert!(!window.needs_summarization());
        window.add_turn(Role::User, "m3", Default::default());
        assert!(window.needs_summarization());

        window.set_summary("four messages");
        assert_eq!(window.summarized_count(), 4);
        assert!(!window.needs_summarization());
        assert_eq!(window.unsummarized().count(), 0);

        window.add_turn(Role::User, "m4", Default::default());
        assert_eq!(window.unsummarized().count(), 1);
    }

    #[test]
    fn zero_threshold_disables_summarization() {
        let mut window = ContextWindow::new(WindowSettings {
            summary_threshold: 0,
            ..settings(10)
        });
        window.add_turn(Role::User, "a", Default::default());
        assert!(!window.needs_summarization());
    }

    #[test]
    fn evicting_summarized_turns_is_not_lossy() {
        let mut window = ContextWindow::new(settings(3));
        for c in ["a", "b", "c"] {
            window.add_turn(Role::User, c, Default::default());
        }
        window.set_summary("a b c");
        window.add_turn(Role::User, "d", Default::default());

        assert_eq!(window.lossy_evictions(), 0);
        assert_eq!(window.summarized_count(), 2);
        assert!(window.summarized_count() <= window.len());
        assert_eq!(window.summary(), Some("a b c"));
    }

    #[test]
    fn evicting_unsummarized_turns_is_counted_as_lossy() {
        let mut window = ContextWindow::new(settings(2));
        for c in ["a", "b", "c", "d"] {
            window.add_turn(Role::User, c, Default::default());
        }
        assert_eq!(window.lossy_evictions(), 2);

        let eviction = window.add_turn(Role::User, "e", Default::default());
        assert_eq!(eviction, Eviction { evicted: 1, lossy: 1 });
        assert_eq!(window.stats().lossy_evictions, 3);
    }

    #[test]
    fn summary_survives_partial_eviction_of_its_prefix() {
        let mut window = ContextWindow::new(settings(3));
        for c in ["a", "b"] {
            window.add_turn(Role::User, c, Default::default());
        }
        window.set_summary("a b");
        for c in ["c", "d", "e"] {
            window.add_turn(Role::User, c, Default::default());
        }
        // "a", "b" were summarized; nothing lost yet
        assert_eq!(window.lossy_evictions(), 0);
        assert_eq!(window.summarized_count(), 0);

        window.add_turn(Role::User, "f", Default::default());
        assert_eq!(window.lossy_evictions(), 1);
        assert_eq!(window.summary(), Some("a b"));
    }

    #[test]
    fn model_input_order_is_fixed() {
        let mut window = ContextWindow::new(settings(10));
        window.add_turn(Role::User, "earlier", Default::default());
        window.add_turn(Role::Assistant, "reply", Default::default());
        window.set_summary("we talked");

        let input = window.build_model_input(Some("You are helpful"), Some(Turn::user("now")));
        let roles: Vec<_> = input.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::System, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(input[0].content, "You are helpful");
        assert!(input[1].content.contains("we talked"));
        assert_eq!(input[4].content, "now");
    }

    #[test]
    fn model_input_skips_orphaned_tool_observations() {
        let mut window = ContextWindow::new(settings(2));
        window.push(Turn::assistant("").with_tool_calls(vec![
            TurnToolCall::function("c1", "echo", "{}"),
        ]));
        window.push(Turn::tool_result("c1", "ok"));
        window.push(Turn::assistant("done"));

        let input = window.build_model_input(None, None);
        assert_eq!(input.len(), 1);
        assert_eq!(input[0].content, "done");
    }

    #[test]
    fn oversized_newest_turn_is_still_sent() {
        let mut window = ContextWindow::new(WindowSettings {
            max_history: 10,
            max_tokens: 5,
            chars_per_token: 2,
            summary_threshold: 0,
        });
        // budget = 10 chars
        window.add_turn(Role::User, "aaaa", Default::default());
        window.add_turn(Role::Assistant, "bbbb", Default::default());
        window.add_turn(Role::User, "r".repeat(50), Default::default());

        assert!(window.history_within_budget().is_empty());
        let input = window.build_latest_input(Some("sys"));
        assert_eq!(input.len(), 2);
        assert_eq!(input[0].role, Role::System);
        assert_eq!(input[1].content, "r".repeat(50));
    }

    #[test]
    fn newest_exchange_keeps_its_tool_call_pairing() {
        let mut window = ContextWindow::new(WindowSettings {
            max_history: 10,
            max_tokens: 5,
            chars_per_token: 2,
            summary_threshold: 0,
        });
        window.add_turn(Role::User, "q", Default::default());
        window.push(
            Turn::assistant("").with_tool_calls(vec![TurnToolCall::function("c1", "echo", "{}")]),
        );
        window.push(Turn::tool_result("c1", "x".repeat(100)));

        let input = window.build_latest_input(None);
        let roles: Vec<_> = input.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::Assistant, Role::Tool]);
        assert_eq!(input[0].tool_calls[0].id, "c1");
    }

    #[test]
    fn latest_input_matches_plain_input_within_budget() {
        let mut window = ContextWindow::new(settings(10));
        window.add_turn(Role::User, "hi", Default::default());
        window.push(
            Turn::assistant("").with_tool_calls(vec![TurnToolCall::function("c1", "echo", "{}")]),
        );
        window.push(Turn::tool_result("c1", "ok"));
        window.set_summary("earlier");

        let shape = |turns: Vec<Turn>| -> Vec<(Role, String)> {
            turns.into_iter().map(|t| (t.role, t.content)).collect()
        };
        let latest = shape(window.build_latest_input(Some("sys")));
        assert_eq!(latest, shape(window.build_model_input(Some("sys"), None)));
        assert_eq!(latest.len(), 5);
    }

    #[test]
    fn orphaned_newest_observations_are_dropped() {
        let mut window = ContextWindow::new(settings(1));
        window.push(
            Turn::assistant("").with_tool_calls(vec![TurnToolCall::function("c1", "echo", "{}")]),
        );
        window.push(Turn::tool_result("c1", "ok"));
        assert!(window.build_latest_input(None).is_empty());
    }

    #[test]
    fn clear_resets_turns_and_totals() {
        let mut window = ContextWindow::new(settings(2));
        for c in ["a", "b", "c"] {
            window.add_turn(Role::User, c, Default::default());
        }
        window.set_summary("s");
        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.total_tokens(), 0);
        assert_eq!(window.summary(), None);
        assert_eq!(window.stats().evicted_turns, 1);
    }

    #[test]
    fn custom_estimator_is_used() {
        let mut window =
            ContextWindow::with_estimator(settings(10), Arc::new(CharRatioEstimator::new(1)));
        window.add_turn(Role::User, "abcd", Default::default());
        assert_eq!(window.total_tokens(), 8);
    }

    #[test]
    fn settings_from_config() {
        let config = ContextConfig {
            max_history: 0,
            max_tokens: 100,
            chars_per_token: 0,
            summary_threshold: 5,
        };
        let settings = WindowSettings::from(&config);
        assert_eq!(settings.max_history, 1);
        assert_eq!(settings.chars_per_token, 1);
        assert_eq!(settings.max_tokens, 100);
    }
}
