//! Tool-call assembler.
//!
//! Streaming backends send tool calls as index-addressed fragments: the id
//! and function name usually arrive once, the arguments JSON arrives in
//! arbitrarily small pieces. The assembler folds those fragments back into
//! complete tool-call records. One instance lives for exactly one model turn.

use std::collections::BTreeMap;

use agentloom_core::message::TurnToolCall;
use agentloom_core::provider::{FinishReason, ToolCallDelta};

/// Accumulated state of one tool-call slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingToolCall {
    pub index: u32,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl PendingToolCall {
    fn is_blank(&self) -> bool {
        self.id.is_empty() && self.name.is_empty() && self.arguments.is_empty()
    }
}

/// Whether the assembled output can be acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// No slots yet, or arguments still incomplete
    NotReady,
    /// Every built call has well-formed arguments, or the stream ended
    Ready,
    /// The stream ended but these calls' arguments never became valid JSON
    Malformed(Vec<String>),
}

#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    slots: BTreeMap<u32, PendingToolCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold fragments into their slots. Empty input is a no-op.
    pub fn ingest(&mut self, deltas: &[ToolCallDelta]) {
        for delta in deltas {
            let slot = self
                .slots
                .entry(delta.index)
                .or_insert_with(|| PendingToolCall {
                    index: delta.index,
                    ..PendingToolCall::default()
                });

            // Providers send the id once; later values never overwrite it
            if slot.id.is_empty()
                && let Some(id) = delta.id.as_deref().filter(|s| !s.is_empty())
            {
                slot.id = id.to_string();
            }

            if slot.name.is_empty()
                && let Some(name) = delta.name.as_deref().filter(|s| !s.is_empty())
            {
                slot.name = name.to_string();
            }

            if let Some(fragment) = &delta.arguments {
                slot.arguments.push_str(fragment);
            }
        }
    }

    pub fn has_slots(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingToolCall> {
        self.slots.values()
    }

    /// Build public tool-call records in ascending slot order.
    ///
    /// Missing ids become `call_<index>`, empty arguments become `{}`, and
    /// slots with no id, name, or arguments are skipped.
    pub fn build(&self) -> Vec<TurnToolCall> {
        self.slots
            .values()
            .filter(|slot| !slot.is_blank())
            .map(|slot| {
                let id = if slot.id.is_empty() {
                    format!("call_{}", slot.index)
                } else {
                    slot.id.clone()
                };
                let arguments = if slot.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    slot.arguments.clone()
                };
                TurnToolCall::function(id, slot.name.clone(), arguments)
            })
            .collect()
    }

    /// True when the loop may act on the assembled calls.
    ///
    /// A terminal finish reason makes any non-empty assembler ready;
    /// otherwise at least one call must have received arguments that
    /// already parse. A slot with no argument text yet is still open.
    pub fn is_ready(&self, finish_reason: Option<&FinishReason>) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        if finish_reason.is_some_and(FinishReason::is_terminal) {
            return true;
        }
        self.slots
            .values()
            .any(|slot| !slot.arguments.is_empty() && parses(&slot.arguments))
    }

    /// Exhaustive form of [`is_ready`](Self::is_ready) that also reports
    /// calls whose arguments are still unparseable.
    ///
    /// This is the verdict once reading has stopped: a slot still streaming
    /// when it is called is reported as malformed, not pending.
    pub fn readiness(&self, finish_reason: Option<&FinishReason>) -> Readiness {
        if !self.is_ready(finish_reason) {
            return Readiness::NotReady;
        }
        let malformed: Vec<String> = self
            .build()
            .into_iter()
            .filter(|call| !parses(call.arguments()))
            .map(|call| call.id)
            .collect();
        if malformed.is_empty() {
            Readiness::Ready
        } else {
            Readiness::Malformed(malformed)
        }
    }

    /// Discard all slots ahead of the next model turn.
    pub fn reset(&mut self) {
        self.slots.clear();
    }
}

fn parses(arguments: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(arguments).is_ok()
}
