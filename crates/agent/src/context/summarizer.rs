//! Summarization hook.

use agentloom_core::error::AgentError;
use agentloom_core::message::Turn;
use async_trait::async_trait;

/// Compresses turns the summary does not yet cover into a new summary.
///
/// The control loop calls this at the start of a run when the window
/// reports `needs_summarization()`. A failure is logged and the run
/// continues without a fresh summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        previous: Option<&str>,
        turns: &[Turn],
    ) -> Result<String, AgentError>;
}
