//! Error handler — the single translation point from internal failures to
//! structured, user-safe payloads.

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, ErrorContext, ErrorKind};

/// The structured payload surfaced to callers (and fed back to the model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_type: String,
    pub message: String,
    pub category: ErrorKind,
    pub context: ErrorContext,
    pub recovery_suggestions: Vec<String>,
}

impl ErrorResponse {
    /// Render as compact JSON for a tool-role observation turn.
    pub fn to_observation(&self) -> String {
        serde_json::to_string(&serde_json::json!({ "error": self }))
            .unwrap_or_else(|_| format!("Error: {}", self.message))
    }
}

/// Translates [`AgentError`]s and filters internal detail.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorHandler {
    /// Keep `context.trace` in translated payloads. Off for external callers.
    expose_internal: bool,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler that keeps trace data (for logs and local debugging).
    pub fn with_internal_detail() -> Self {
        Self {
            expose_internal: true,
        }
    }

    pub fn translate(&self, error: &AgentError) -> ErrorResponse {
        let mut context = error.context.clone();
        if !self.expose_internal {
            context.trace = None;
        }
        ErrorResponse {
            error_type: error.kind.type_name().to_string(),
            message: error.message.clone(),
            category: error.kind,
            context,
            recovery_suggestions: error.suggestions.clone(),
        }
    }

    /// Classify and translate any error in one step.
    pub fn translate_any(&self, error: impl Into<AgentError>) -> ErrorResponse {
        self.translate(&error.into())
    }
}
