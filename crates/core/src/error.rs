//! Error types for the agentloom domain.
//!
//! Uses `thiserror` for ergonomic error definitions. Two layers live here:
//!
//! - **Boundary errors** ([`ProviderError`], [`ToolError`], [`SessionError`]):
//!   what a collaborator reports in its own terms.
//! - **The agent taxonomy** ([`AgentError`] + [`ErrorKind`]): the closed set of
//!   categories the control loop reasons about. Boundary errors are wrapped
//!   into it exactly once, through the `From` impls below.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::session::SessionError;

/// The top-level error type for all agentloom operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Classified agent failures ---
    #[error(transparent)]
    Agent(#[from] AgentError),

    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Session errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {name}")]
    NotFound { name: String, available: Vec<String> },

    #[error("Tool execution failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("Permission denied: {tool_name} — {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool cancelled: {0}")]
    Cancelled(String),

    #[error("Tool handler panicked: {tool_name} — {message}")]
    Panicked { tool_name: String, message: String },
}

// --- Agent taxonomy ---

/// The closed set of failure categories the control loop distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ToolNotFound,
    ToolExecution,
    ToolValidation,
    DataNotFound,
    DataValidation,
    IntentAmbiguous,
    ModelBackend,
    ModelTimeout,
    ModelRateLimited,
    SessionExpired,
    Unknown,
}

impl ErrorKind {
    /// Stable machine tag, identical to the serde representation.
    pub fn tag(self) -> &'static str {
        match self {
            Self::ToolNotFound => "tool_not_found",
            Self::ToolExecution => "tool_execution",
            Self::ToolValidation => "tool_validation",
            Self::DataNotFound => "data_not_found",
            Self::DataValidation => "data_validation",
            Self::IntentAmbiguous => "intent_ambiguous",
            Self::ModelBackend => "model_backend",
            Self::ModelTimeout => "model_timeout",
            Self::ModelRateLimited => "model_rate_limited",
            Self::SessionExpired => "session_expired",
            Self::Unknown => "unknown",
        }
    }

    /// Human-facing error type name used in translated payloads.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::ToolNotFound => "ToolNotFoundError",
            Self::ToolExecution => "ToolExecutionError",
            Self::ToolValidation => "ToolValidationError",
            Self::DataNotFound => "DataNotFoundError",
            Self::DataValidation => "DataValidationError",
            Self::IntentAmbiguous => "IntentAmbiguousError",
            Self::ModelBackend => "ModelBackendError",
            Self::ModelTimeout => "ModelTimeoutError",
            Self::ModelRateLimited => "ModelRateLimitedError",
            Self::SessionExpired => "SessionExpiredError",
            Self::Unknown => "UnknownError",
        }
    }

    /// Whether a failure of this kind is worth retrying against the model backend.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::ModelBackend | Self::ModelTimeout | Self::ModelRateLimited
        )
    }

    /// Whether the loop can recover by feeding the failure back as an observation.
    pub fn recoverable(self) -> bool {
        matches!(
            self,
            Self::ToolNotFound
                | Self::ToolExecution
                | Self::ToolValidation
                | Self::DataNotFound
                | Self::DataValidation
                | Self::IntentAmbiguous
        )
    }

    fn default_suggestions(self) -> &'static [&'static str] {
        match self {
            Self::ToolNotFound => &["Check the tool name against the list of available tools"],
            Self::ToolExecution => &["Retry with different arguments or use another tool"],
            Self::ToolValidation => &["Provide every required argument with the declared type"],
            Self::DataNotFound => &["Verify the identifier and try again"],
            Self::DataValidation => &["Correct the input data and resubmit"],
            Self::IntentAmbiguous => &["Ask the user to clarify what they want"],
            Self::ModelBackend => &["Try again later", "Check the model backend status"],
            Self::ModelTimeout => &["Try again with a shorter request"],
            Self::ModelRateLimited => &["Wait a moment before sending another request"],
            Self::SessionExpired => &["Start a new session"],
            Self::Unknown => &["Try again; report the issue if it persists"],
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Free-form context attached to an [`AgentError`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Internal detail (source chain, backend body). Stripped before external exposure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A classified failure: category, message, context, and recovery suggestions.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct AgentError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: ErrorContext,
    pub suggestions: Vec<String>,
    retryable: bool,
}

impl AgentError {
    /// Create an error of the given kind with its default recovery suggestions.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: ErrorContext::default(),
            suggestions: kind
                .default_suggestions()
                .iter()
                .map(|s| s.to_string())
                .collect(),
            retryable: kind.retryable(),
        }
    }

    /// A requested tool is not registered. Suggests the currently known names.
    pub fn tool_not_found(name: &str, known: &[String]) -> Self {
        let mut err = Self::new(ErrorKind::ToolNotFound, format!("Tool '{name}' not found"))
            .with_tool(name);
        if !known.is_empty() {
            err.suggestions
                .push(format!("Available tools: {}", known.join(", ")));
        }
        err.context
            .extra
            .insert("available_tools".into(), serde_json::json!(known));
        err
    }

    pub fn tool_execution(name: &str, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolExecution, reason).with_tool(name)
    }

    pub fn tool_validation(name: &str, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolValidation, reason).with_tool(name)
    }

    /// The tool exists but the session's capability policy does not allow it.
    pub fn tool_not_permitted(name: &str) -> Self {
        Self::new(
            ErrorKind::ToolExecution,
            format!("Tool '{name}' is not permitted in this session"),
        )
        .with_tool(name)
        .replace_suggestions(["Tool not permitted: choose one of the tools offered to you"])
    }

    pub fn model_backend(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ModelBackend, message)
    }

    pub fn model_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ModelTimeout, message)
    }

    pub fn session_expired(session_id: &str) -> Self {
        Self::new(
            ErrorKind::SessionExpired,
            format!("Session '{session_id}' not found or expired"),
        )
        .with_session(session_id)
    }

    /// Wrap an arbitrary internal failure as `unknown`, keeping its source chain as trace.
    pub fn internal(err: &(dyn std::error::Error + 'static)) -> Self {
        Self::new(ErrorKind::Unknown, "An unexpected internal error occurred")
            .with_trace(source_chain(err))
    }

    pub fn with_tool(mut self, name: &str) -> Self {
        self.context.tool = Some(name.to_string());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.context.params = Some(params);
        self
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.context.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.context.trace = Some(trace.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn replace_suggestions<I, S>(mut self, suggestions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggestions = suggestions.into_iter().map(Into::into).collect();
        self
    }

    /// Mark this error as not worth retrying even if its kind normally is.
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.recoverable()
    }

    /// Server-provided back-off hint, if the backend sent one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.context
            .extra
            .get("retry_after_secs")
            .and_then(|v| v.as_u64())
    }
}

impl From<ProviderError> for AgentError {
    fn from(err: ProviderError) -> Self {
        match &err {
            ProviderError::RateLimited { retry_after_secs } => {
                let mut e = Self::new(ErrorKind::ModelRateLimited, err.to_string());
                e.context
                    .extra
                    .insert("retry_after_secs".into(), serde_json::json!(retry_after_secs));
                e
            }
            ProviderError::Timeout(_) => Self::new(ErrorKind::ModelTimeout, err.to_string()),
            ProviderError::AuthenticationFailed(_) | ProviderError::NotConfigured(_) => {
                Self::model_backend("The model backend rejected the configuration")
                    .with_trace(err.to_string())
                    .replace_suggestions(["Check the API key and provider settings"])
                    .non_retryable()
            }
            ProviderError::ModelNotFound(model) => {
                Self::model_backend(format!("Model '{model}' is not available"))
                    .replace_suggestions(["Configure a model the backend serves"])
                    .non_retryable()
            }
            ProviderError::ApiError { status_code, .. } if (400..500).contains(status_code) => {
                Self::model_backend("The model backend rejected the request")
                    .with_trace(err.to_string())
                    .non_retryable()
            }
            _ => Self::model_backend("The model backend failed to respond")
                .with_trace(err.to_string()),
        }
    }
}

impl From<ToolError> for AgentError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::NotFound { name, available } => Self::tool_not_found(&name, &available),
            ToolError::ExecutionFailed { tool_name, reason } => {
                Self::tool_execution(&tool_name, reason)
            }
            ToolError::Timeout {
                tool_name,
                timeout_ms,
            } => Self::tool_execution(
                &tool_name,
                format!("Tool '{tool_name}' timed out after {timeout_ms}ms"),
            )
            .with_suggestion("Try a smaller request for this tool"),
            ToolError::PermissionDenied { tool_name, reason } => {
                Self::tool_not_permitted(&tool_name).with_trace(reason)
            }
            ToolError::InvalidArguments(reason) => {
                Self::new(ErrorKind::ToolValidation, reason)
            }
            ToolError::Cancelled(tool_name) => {
                Self::tool_execution(&tool_name, format!("Tool '{tool_name}' was cancelled"))
            }
            // The panic message is internal detail; it only survives as trace
            ToolError::Panicked { ref tool_name, .. } => Self::tool_execution(
                tool_name,
                format!("Tool '{tool_name}' failed unexpectedly"),
            )
            .with_trace(source_chain(&err)),
        }
    }
}

fn source_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(s) = source {
        chain.push_str(": ");
        chain.push_str(&s.to_string());
        source = s.source();
    }
    chain
}

impl From<SessionError> for AgentError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) | SessionError::Expired(id) => Self::session_expired(&id),
            SessionError::Storage(reason) => {
                Self::new(ErrorKind::Unknown, "Session storage failed").with_trace(reason)
            }
        }
    }
}

impl From<Error> for AgentError {
    fn from(err: Error) -> Self {
        match err {
            Error::Agent(e) => e,
            Error::Provider(e) => e.into(),
            Error::Tool(e) => e.into(),
            Error::Session(e) => e.into(),
            Error::Serialization(e) => {
                Self::new(ErrorKind::DataValidation, "Malformed structured data")
                    .with_trace(e.to_string())
            }
            other => Self::internal(&other),
        }
    }
}
