//! The agent control loop — the heart of agentloom.
//!
//! The agent follows a **Think → Act → Observe** cycle:
//!
//! 1. **Receive** a user message and append it to the session window
//! 2. **Think**: send the budgeted window to the model, streaming deltas
//!    through the [`ToolCallAssembler`]
//! 3. **Act**: dispatch each assembled tool call the session may use
//! 4. **Observe**: append results (or translated errors) and loop to 2
//! 5. **Final**: a turn without tool calls ends the run
//!
//! The loop also stops when the step budget runs out, when the caller
//! cancels, or when the model backend keeps failing after retries.

pub mod assembler;
pub mod context;
pub mod loop_runner;
pub mod outcome;
pub mod session;
pub mod stream_event;

pub use assembler::{PendingToolCall, Readiness, ToolCallAssembler};
pub use context::{
    CharRatioEstimator, ContextWindow, Eviction, HeuristicEstimator, Summarizer, TokenEstimator,
    WindowSettings, WindowStats,
};
pub use loop_runner::{AgentLoop, LoopSettings};
pub use outcome::{RunOutcome, RunStatus};
pub use session::{InMemorySessionStore, Session};
pub use stream_event::AgentStreamEvent;

/// Cancellation handle accepted by [`AgentLoop::run`].
pub use tokio_util::sync::CancellationToken;
