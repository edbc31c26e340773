//! What a session run returns.

use agentloom_core::error_handler::ErrorResponse;
use agentloom_core::provider::Usage;
use serde::{Deserialize, Serialize};

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The model produced an answer without requesting a tool
    Final,
    /// The step budget ran out; not an error
    StepLimit,
    /// Cancelled from outside
    Cancelled,
    /// An unrecoverable error ended the run
    Aborted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Final => "final",
            Self::StepLimit => "step_limit",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,

    /// The final answer; empty unless `status` is `Final`
    pub answer: String,

    /// Most recent assistant text, kept for every terminal state
    pub partial: String,

    /// THINK steps taken
    pub steps: u32,

    pub tool_calls_made: usize,

    /// Translated error for `Aborted` runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,

    pub usage: Usage,
}

impl RunOutcome {
    pub fn is_final(&self) -> bool {
        self.status == RunStatus::Final
    }

    pub fn step_limit_reached(&self) -> bool {
        self.status == RunStatus::StepLimit
    }

    /// The answer if there is one, otherwise the partial text.
    pub fn best_text(&self) -> &str {
        if self.answer.is_empty() {
            &self.partial
        } else {
            &self.answer
        }
    }
}
