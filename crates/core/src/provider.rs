//! Provider trait — the abstraction over model backends.
//!
//! A Provider knows how to send a conversation to a model and get a response
//! back, either as a complete turn or as a stream of [`StreamDelta`]s.
//!
//! Deltas are the **normalized** fragment shape: whatever wire format a
//! backend speaks is decoded into this type at the provider boundary, so the
//! agent's tool-call assembler only ever sees one shape.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::message::Turn;

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "gpt-4o-mini")
    pub model: String,

    /// The conversation turns, in the order the model must see them
    pub turns: Vec<Turn>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,

    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated assistant turn (content and/or tool calls)
    pub message: Turn,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,

    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Accumulate another call's usage into this one.
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model finished emitting tool calls
    ToolCalls,
    /// Natural end of the answer
    Stop,
    /// Hit the generation length limit
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    /// Parse a backend finish-reason token.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "tool_calls" | "function_call" | "tool_use" => Self::ToolCalls,
            "stop" | "end_turn" | "stop_sequence" => Self::Stop,
            "length" | "max_tokens" => Self::Length,
            "content_filter" => Self::ContentFilter,
            other => Self::Other(other.to_string()),
        }
    }

    /// Terminal reasons mark every open tool-call slot as complete.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ToolCalls | Self::Stop | Self::Length)
    }
}

/// One incremental fragment of a tool call, addressed by slot index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Zero-based slot index supplied by the stream
    pub index: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Fragment of the arguments JSON document (appended, never replaced)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl ToolCallDelta {
    /// The opening fragment of a slot: id and function name.
    pub fn start(index: u32, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            index,
            id: Some(id.into()),
            name: Some(name.into()),
            arguments: None,
        }
    }

    /// A continuation fragment carrying only more argument text.
    pub fn args(index: u32, fragment: impl Into<String>) -> Self {
        Self {
            index,
            id: None,
            name: None,
            arguments: Some(fragment.into()),
        }
    }
}

/// A single normalized delta in a streaming response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamDelta {
    /// Partial text content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Partial tool call fragments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDelta>,

    /// Set on the final delta of a turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,

    /// Usage info (typically only in the final delta)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamDelta {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn tools(tool_calls: Vec<ToolCallDelta>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Self::default()
        }
    }
}

/// Receiving end of a provider stream.
pub type DeltaReceiver = mpsc::Receiver<std::result::Result<StreamDelta, ProviderError>>;

/// The core Provider trait.
///
/// Every model backend implements this trait. The agent loop calls
/// `stream()` (or `complete()`) without knowing which backend is in use.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openai", "scripted").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Send a request and get a stream of normalized deltas.
    ///
    /// Default implementation calls `complete()` and replays the result as a
    /// single delta, numbering tool calls by position.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<DeltaReceiver, ProviderError> {
        let response = self.complete(request).await?;
        let (tx, rx) = mpsc::channel(1);
        let tool_calls = response
            .message
            .tool_calls
            .iter()
            .enumerate()
            .map(|(i, tc)| ToolCallDelta {
                index: i as u32,
                id: Some(tc.id.clone()),
                name: Some(tc.function.name.clone()),
                arguments: Some(tc.function.arguments.clone()),
            })
            .collect();
        let content = Some(response.message.content).filter(|c| !c.is_empty());
        let finish_reason = response.finish_reason.or(Some(FinishReason::Stop));
        let _ = tx
            .send(Ok(StreamDelta {
                content,
                tool_calls,
                finish_reason,
                usage: response.usage,
            }))
            .await;
        Ok(rx)
    }

    /// Health check — can we reach the backend?
    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TurnToolCall;

    struct OneShot;

    #[async_trait]
    impl Provider for OneShot {
        fn name(&self) -> &str {
            "one_shot"
        }

        async fn complete(
            &self,
            _request: ProviderRequest,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse {
                message: Turn::assistant("").with_tool_calls(vec![
                    TurnToolCall::function("a", "search", r#"{"q":1}"#),
                    TurnToolCall::function("b", "echo", "{}"),
                ]),
                finish_reason: Some(FinishReason::ToolCalls),
                usage: None,
                model: "m".into(),
            })
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "m".into(),
            turns: vec![],
            temperature: default_temperature(),
            max_tokens: None,
            tools: vec![],
            stream: true,
            stop: vec![],
        }
    }

    #[test]
    fn finish_reason_parsing() {
        assert_eq!(FinishReason::parse("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::parse("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::parse("length"), FinishReason::Length);
        assert!(!FinishReason::parse("content_filter").is_terminal());
        assert_eq!(
            FinishReason::parse("weird"),
            FinishReason::Other("weird".into())
        );
    }

    #[tokio::test]
    async fn default_stream_replays_complete_as_single_delta() {
        let mut rx = OneShot.stream(request()).await.unwrap();
        let delta = rx.recv().await.unwrap().unwrap();
        assert!(delta.content.is_none());
        assert_eq!(delta.tool_calls.len(), 2);
        assert_eq!(delta.tool_calls[1].index, 1);
        assert_eq!(delta.tool_calls[1].name.as_deref(), Some("echo"));
        assert_eq!(delta.finish_reason, Some(FinishReason::ToolCalls));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.add(&Usage {
            prompt_tokens: 3,
            completion_tokens: 2,
            total_tokens: 5,
        });
        total.add(&Usage {
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
        });
        assert_eq!(total.total_tokens, 7);
    }
}
