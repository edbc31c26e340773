//! Agent-level streaming events.
//!
//! `AgentStreamEvent` is the vocabulary a front door (CLI, HTTP, WebSocket)
//! consumes while a session runs:
//! - `turn_started`    — a THINK step began
//! - `chunk`           — partial text from the model
//! - `tool_dispatched` — the agent is invoking a tool
//! - `tool_result`     — a tool observation was appended
//! - `final`           — the answer is complete
//! - `step_limit`      — the step budget ran out
//! - `aborted`         — cancelled or failed unrecoverably
//! - `error`           — a recoverable error was observed

use agentloom_core::error_handler::ErrorResponse;
use agentloom_core::provider::Usage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStreamEvent {
    TurnStarted { session_id: String, step: u32 },

    /// Partial text token from the model.
    Chunk { content: String },

    ToolDispatched {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    ToolResult {
        id: String,
        name: String,
        output: String,
        success: bool,
    },

    Final {
        session_id: String,
        answer: String,
        steps: u32,
        tool_calls_made: usize,
        usage: Option<Usage>,
    },

    /// Step budget exhausted; `partial` is whatever text exists so far.
    StepLimit { partial: String, steps: u32 },

    Aborted {
        reason: String,
        partial: String,
        error: Option<ErrorResponse>,
    },

    Error { error: ErrorResponse },
}

impl AgentStreamEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TurnStarted { .. } => "turn_started",
            Self::Chunk { .. } => "chunk",
            Self::ToolDispatched { .. } => "tool_dispatched",
            Self::ToolResult { .. } => "tool_result",
            Self::Final { .. } => "final",
            Self::StepLimit { .. } => "step_limit",
            Self::Aborted { .. } => "aborted",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Final { .. } | Self::StepLimit { .. } | Self::Aborted { .. }
        )
    }
}
