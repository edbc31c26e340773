//! A provider that replays a fixed script of model turns.
//!
//! Used by tests and offline demos. Each call to `stream()` or `complete()`
//! consumes the next [`ScriptStep`]; every request is recorded so callers can
//! assert on what the model was shown.

use agentloom_core::error::ProviderError;
use agentloom_core::message::{Turn, TurnToolCall};
use agentloom_core::provider::*;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// One scripted model call.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit these deltas in order, then close the stream.
    Deltas(Vec<StreamDelta>),
    /// Emit these deltas, then fail mid-stream.
    Interrupted(Vec<StreamDelta>, ProviderError),
    /// Fail before any delta is produced.
    Fail(ProviderError),
    /// Accept the call and never answer.
    Stall,
}

impl ScriptStep {
    /// A plain-text answer, streamed word by word.
    pub fn answer(text: &str) -> Self {
        let mut deltas: Vec<StreamDelta> = text
            .split_inclusive(' ')
            .map(StreamDelta::text)
            .collect();
        deltas.push(StreamDelta::finish(FinishReason::Stop));
        Self::Deltas(deltas)
    }

    /// A single tool call with its arguments split into two fragments.
    pub fn tool_call(id: &str, name: &str, arguments: &str) -> Self {
        let mid = arguments
            .char_indices()
            .nth(arguments.chars().count() / 2)
            .map_or(arguments.len(), |(i, _)| i);
        let (head, tail) = arguments.split_at(mid);
        Self::Deltas(vec![
            StreamDelta::tools(vec![ToolCallDelta::start(0, id, name)]),
            StreamDelta::tools(vec![ToolCallDelta::args(0, head)]),
            StreamDelta::tools(vec![ToolCallDelta::args(0, tail)]),
            StreamDelta::finish(FinishReason::ToolCalls),
        ])
    }
}

/// Replays [`ScriptStep`]s in order.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<ProviderRequest>>,
    calls: AtomicUsize,
    delta_delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delta_delay: None,
        }
    }

    /// Sleep between deltas, to make streams observable mid-flight.
    pub fn with_delta_delay(mut self, delay: Duration) -> Self {
        self.delta_delay = Some(delay);
        self
    }

    /// Number of model calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_step(&self, request: ProviderRequest) -> Result<ScriptStep, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| ProviderError::NotConfigured("script exhausted".into()))
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let deltas = match self.next_step(request)? {
            ScriptStep::Deltas(deltas) => deltas,
            ScriptStep::Interrupted(_, err) | ScriptStep::Fail(err) => return Err(err),
            ScriptStep::Stall => std::future::pending().await,
        };
        Ok(collapse(deltas))
    }

    async fn stream(&self, request: ProviderRequest) -> Result<DeltaReceiver, ProviderError> {
        let (deltas, trailing_error) = match self.next_step(request)? {
            ScriptStep::Deltas(deltas) => (deltas, None),
            ScriptStep::Interrupted(deltas, err) => (deltas, Some(err)),
            ScriptStep::Fail(err) => return Err(err),
            ScriptStep::Stall => {
                let (tx, rx) = mpsc::channel(1);
                tokio::spawn(async move {
                    let _tx = tx;
                    std::future::pending::<()>().await;
                });
                return Ok(rx);
            }
        };

        let (tx, rx) = mpsc::channel(deltas.len().max(1) + 1);
        let delay = self.delta_delay;
        tokio::spawn(async move {
            for delta in deltas {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(delta)).await.is_err() {
                    return;
                }
            }
            if let Some(err) = trailing_error {
                let _ = tx.send(Err(err)).await;
            }
        });
        Ok(rx)
    }
}

/// Fold a delta script into one complete response. Tool-call fragments are
/// concatenated per index in a simple, in-order fashion.
fn collapse(deltas: Vec<StreamDelta>) -> ProviderResponse {
    let mut content = String::new();
    let mut calls: Vec<(u32, TurnToolCall)> = Vec::new();
    let mut finish_reason = None;
    let mut usage = None;

    for delta in deltas {
        if let Some(text) = delta.content {
            content.push_str(&text);
        }
        for tc in delta.tool_calls {
            let pos = match calls.iter().position(|(i, _)| *i == tc.index) {
                Some(pos) => pos,
                None => {
                    calls.push((tc.index, TurnToolCall::function("", "", "")));
                    calls.len() - 1
                }
            };
            let call = &mut calls[pos].1;
            if let Some(id) = tc.id {
                call.id = id;
            }
            if let Some(name) = tc.name {
                call.function.name = name;
            }
            if let Some(args) = tc.arguments {
                call.function.arguments.push_str(&args);
            }
        }
        finish_reason = delta.finish_reason.or(finish_reason);
        usage = delta.usage.or(usage);
    }

    calls.sort_by_key(|(i, _)| *i);
    ProviderResponse {
        message: Turn::assistant(content).with_tool_calls(calls.into_iter().map(|(_, c)| c).collect()),
        finish_reason,
        usage,
        model: "scripted".into(),
    }
}
