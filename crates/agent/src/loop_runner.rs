//! The agent control loop.
//!
//! One [`AgentLoop`] can drive many sessions; each [`run`](AgentLoop::run)
//! owns a single session's window for its duration and walks
//! `THINK → ACT → OBSERVE` until the model answers (`Final`), the step
//! budget runs out (`StepLimit`), the caller cancels (`Cancelled`), or an
//! unrecoverable error occurs (`Aborted`).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentloom_config::{AgentConfig, AppConfig};
use agentloom_core::error::{AgentError, ProviderError, ToolError};
use agentloom_core::error_handler::{ErrorHandler, ErrorResponse};
use agentloom_core::event::{DomainEvent, EventBus};
use agentloom_core::message::{SessionId, Turn, TurnToolCall};
use agentloom_core::provider::{
    FinishReason, Provider, ProviderRequest, ToolDefinition, Usage,
};
use agentloom_tools::{CapabilityPolicy, DispatchOutcome, ToolRegistry};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assembler::{Readiness, ToolCallAssembler};
use crate::context::{ContextWindow, Summarizer};
use crate::outcome::{RunOutcome, RunStatus};
use crate::session::Session;
use crate::stream_event::AgentStreamEvent;

/// Step budget, retry and timeout policy for a loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_steps: u32,
    pub stream: bool,
    /// Retries after the first failed model call
    pub max_model_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Upper bound on one whole model call, stream included
    pub model_timeout: Duration,
    pub tool_timeout: Duration,
    /// How long to keep reading once the assembler is ready; a stream
    /// that stays quiet that long is cut and its closed calls acted on
    pub tool_ready_grace: Duration,
    pub system_prompt: Option<String>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for LoopSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            max_steps: config.max_steps.max(1),
            stream: config.stream,
            max_model_retries: config.max_model_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(config.retry_max_delay_ms),
            model_timeout: Duration::from_secs(config.model_timeout_secs),
            tool_timeout: Duration::from_secs(config.tool_timeout_secs),
            tool_ready_grace: Duration::from_millis(config.tool_ready_grace_ms),
            system_prompt: config.system_prompt.clone(),
        }
    }
}

impl LoopSettings {
    /// Delay before retry number `attempt` (0-based): exponential from the
    /// base, capped at the max, but never shorter than a server-supplied
    /// `retry-after`.
    pub fn backoff(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let exponential = self
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.retry_max_delay);
        let server = Duration::from_secs(retry_after_secs.unwrap_or(0));
        exponential.max(server)
    }
}

/// The core loop that orchestrates model calls and tool execution.
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    registry: Arc<ToolRegistry>,
    policy: CapabilityPolicy,
    settings: LoopSettings,
    error_handler: ErrorHandler,
    event_bus: Option<Arc<EventBus>>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            registry,
            policy: CapabilityPolicy::allow_all(),
            settings: LoopSettings::default(),
            error_handler: ErrorHandler::new(),
            event_bus: None,
            summarizer: None,
        }
    }

    /// Build a loop with every knob taken from the application config.
    pub fn from_config(
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        config: &AppConfig,
    ) -> Self {
        Self::new(provider, config.model.clone(), registry)
            .with_temperature(config.temperature)
            .with_max_tokens(config.max_tokens)
            .with_settings(LoopSettings::from(&config.agent))
            .with_policy(CapabilityPolicy::from(&config.tools))
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_policy(mut self, policy: CapabilityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Names this session may dispatch, computed fresh from the registry.
    pub fn effective_tools(&self, session: &Session) -> BTreeSet<String> {
        let policy = match &session.policy {
            Some(own) => self.policy.merge(own),
            None => self.policy.clone(),
        };
        policy.effective(&self.registry.names())
    }

    /// Feed `input` to the session and drive it to a terminal state.
    ///
    /// Never fails: every error is translated into the returned outcome,
    /// and turns appended before a failure stay in the session window.
    pub async fn run(
        &self,
        session: &mut Session,
        input: &str,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<AgentStreamEvent>>,
    ) -> RunOutcome {
        let started = Instant::now();
        let mut run = RunState::new(session.id.clone(), events);

        self.maybe_summarize(&mut session.window, &run.session_id).await;

        self.append(&mut session.window, Turn::user(input), &run.session_id);
        session.mark_dirty();

        let effective = self.effective_tools(session);
        let definitions = self.registry.definitions_for(&effective);
        debug!(
            session_id = %run.session_id,
            tools = effective.len(),
            "Starting run"
        );

        let status = loop {
            if cancel.is_cancelled() {
                break RunStatus::Cancelled;
            }
            if run.steps >= self.settings.max_steps {
                break RunStatus::StepLimit;
            }
            run.steps += 1;
            run.emit(AgentStreamEvent::TurnStarted {
                session_id: run.session_id.to_string(),
                step: run.steps,
            })
            .await;

            // THINK
            let model_input = session
                .window
                .build_latest_input(self.settings.system_prompt.as_deref());
            let turn = match self.think(model_input, &definitions, cancel, &mut run).await {
                Ok(turn) => turn,
                Err(Halt::Cancelled) => break RunStatus::Cancelled,
                Err(Halt::Failed(err)) => {
                    let response = self.error_handler.translate(&err);
                    warn!(
                        session_id = %run.session_id,
                        step = run.steps,
                        kind = %err.kind,
                        "Model call failed permanently: {}",
                        err.message
                    );
                    run.error = Some(response);
                    break RunStatus::Aborted;
                }
            };

            if !turn.content.is_empty() {
                run.partial = turn.content.clone();
            }

            // FINAL
            if turn.tool_calls.is_empty() {
                self.append(
                    &mut session.window,
                    Turn::assistant(turn.content.clone()),
                    &run.session_id,
                );
                run.answer = turn.content;
                break RunStatus::Final;
            }

            // ACT
            self.append(
                &mut session.window,
                Turn::assistant(turn.content.clone()).with_tool_calls(turn.tool_calls.clone()),
                &run.session_id,
            );

            let mut cancelled = false;
            for call in &turn.tool_calls {
                let malformed = turn.malformed.contains(&call.id);
                let observation = if cancelled {
                    Err(AgentError::from(ToolError::Cancelled(call.name().to_string())))
                } else {
                    match self.act(call, malformed, &effective, cancel, &mut run).await {
                        Ok(observation) => observation,
                        Err(Halt::Cancelled) => {
                            cancelled = true;
                            Err(AgentError::from(ToolError::Cancelled(call.name().to_string())))
                        }
                        Err(Halt::Failed(err)) => Err(err),
                    }
                };

                // OBSERVE
                let content = match observation {
                    Ok(output) => {
                        run.emit(AgentStreamEvent::ToolResult {
                            id: call.id.clone(),
                            name: call.name().to_string(),
                            output: output.clone(),
                            success: true,
                        })
                        .await;
                        output
                    }
                    Err(err) => {
                        let err = err.with_session(run.session_id.as_str());
                        let response = self.error_handler.translate(&err);
                        let observation = response.to_observation();
                        run.emit(AgentStreamEvent::Error {
                            error: response.clone(),
                        })
                        .await;
                        run.emit(AgentStreamEvent::ToolResult {
                            id: call.id.clone(),
                            name: call.name().to_string(),
                            output: observation.clone(),
                            success: false,
                        })
                        .await;
                        observation
                    }
                };
                self.append(
                    &mut session.window,
                    Turn::tool_result(call.id.clone(), content),
                    &run.session_id,
                );
            }

            if cancelled {
                break RunStatus::Cancelled;
            }
        };

        session.mark_dirty();
        self.finish(run, status, started).await
    }

    async fn finish(&self, run: RunState<'_>, status: RunStatus, started: Instant) -> RunOutcome {
        match status {
            RunStatus::Final => {
                run.emit(AgentStreamEvent::Final {
                    session_id: run.session_id.to_string(),
                    answer: run.answer.clone(),
                    steps: run.steps,
                    tool_calls_made: run.tool_calls_made,
                    usage: Some(run.usage),
                })
                .await;
            }
            RunStatus::StepLimit => {
                warn!(
                    session_id = %run.session_id,
                    steps = run.steps,
                    "Step limit reached"
                );
                run.emit(AgentStreamEvent::StepLimit {
                    partial: run.partial.clone(),
                    steps: run.steps,
                })
                .await;
            }
            RunStatus::Cancelled => {
                info!(session_id = %run.session_id, step = run.steps, "Run cancelled");
                run.emit(AgentStreamEvent::Aborted {
                    reason: "cancelled".into(),
                    partial: run.partial.clone(),
                    error: None,
                })
                .await;
            }
            RunStatus::Aborted => {
                run.emit(AgentStreamEvent::Aborted {
                    reason: run
                        .error
                        .as_ref()
                        .map_or_else(|| "aborted".to_string(), |e| e.message.clone()),
                    partial: run.partial.clone(),
                    error: run.error.clone(),
                })
                .await;
            }
        }

        self.publish(DomainEvent::SessionFinished {
            session_id: run.session_id.to_string(),
            status: status.to_string(),
            steps: run.steps,
            tokens_used: run.usage.total_tokens,
            timestamp: Utc::now(),
        });
        debug!(
            session_id = %run.session_id,
            status = %status,
            steps = run.steps,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Run finished"
        );

        RunOutcome {
            status,
            answer: run.answer,
            partial: run.partial,
            steps: run.steps,
            tool_calls_made: run.tool_calls_made,
            error: run.error,
            usage: run.usage,
        }
    }

    /// THINK: one model turn, retried with backoff on retryable failures.
    async fn think(
        &self,
        turns: Vec<Turn>,
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
        run: &mut RunState<'_>,
    ) -> Result<ModelTurn, Halt> {
        let request = ProviderRequest {
            model: self.model.clone(),
            turns,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: tools.to_vec(),
            stream: self.settings.stream,
            stop: vec![],
        };

        let mut attempt = 0u32;
        loop {
            // Text streamed before a timeout or cancellation is already in
            // `run.partial`; dropping the call future does not lose it.
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = tokio::time::timeout(self.settings.model_timeout, self.call_model(request.clone(), run)) => Some(r),
            };
            let result = match result {
                None => return Err(Halt::Cancelled),
                Some(Ok(result)) => result,
                Some(Err(_)) => Err(ProviderError::Timeout(format!(
                    "no complete response within {}s",
                    self.settings.model_timeout.as_secs()
                ))),
            };

            let err = match result {
                Ok(turn) => return Ok(turn),
                Err(e) => AgentError::from(e),
            };

            if !err.is_retryable() || attempt >= self.settings.max_model_retries {
                return Err(Halt::Failed(err));
            }

            let delay = self.settings.backoff(attempt, err.retry_after_secs());
            attempt += 1;
            warn!(
                session_id = %run.session_id,
                step = run.steps,
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = %err.kind,
                "Model call failed, retrying"
            );
            self.publish(DomainEvent::ModelRetried {
                session_id: run.session_id.to_string(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                reason: err.message.clone(),
                timestamp: Utc::now(),
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Halt::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One model call, streamed through the assembler.
    async fn call_model(
        &self,
        request: ProviderRequest,
        run: &mut RunState<'_>,
    ) -> Result<ModelTurn, ProviderError> {
        if !self.settings.stream {
            let response = self.provider.complete(request).await?;
            if let Some(usage) = &response.usage {
                run.usage.add(usage);
            }
            return Ok(ModelTurn {
                content: response.message.content,
                tool_calls: response.message.tool_calls,
                malformed: Vec::new(),
            });
        }

        let mut rx = self.provider.stream(request).await?;
        let mut assembler = ToolCallAssembler::new();
        let mut content = String::new();
        let mut finish_reason: Option<FinishReason> = None;
        let mut usage: Option<Usage> = None;

        loop {
            // Once a call's JSON has closed, a stalled stream no longer
            // holds up the turn.
            let next = if assembler.is_ready(finish_reason.as_ref()) {
                match tokio::time::timeout(self.settings.tool_ready_grace, rx.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        debug!(
                            session_id = %run.session_id,
                            step = run.steps,
                            "Tool calls complete; not waiting for the rest of the stream"
                        );
                        break;
                    }
                }
            } else {
                rx.recv().await
            };
            let Some(item) = next else {
                break;
            };

            let delta = match item {
                Ok(delta) => delta,
                // Tool calls whose JSON already closed survive a broken stream
                Err(e) if assembler.is_ready(None) => {
                    debug!(error = %e, "Stream failed after tool calls were complete");
                    break;
                }
                Err(e) => return Err(e),
            };

            if let Some(text) = delta.content {
                run.emit(AgentStreamEvent::Chunk {
                    content: text.clone(),
                })
                .await;
                if content.is_empty() && !text.is_empty() {
                    run.partial.clear();
                }
                run.partial.push_str(&text);
                content.push_str(&text);
            }
            assembler.ingest(&delta.tool_calls);
            if delta.finish_reason.is_some() {
                finish_reason = delta.finish_reason;
            }
            if delta.usage.is_some() {
                usage = delta.usage;
            }
        }

        if let Some(usage) = &usage {
            run.usage.add(usage);
        }

        let malformed = match assembler.readiness(finish_reason.as_ref()) {
            Readiness::Ready => Vec::new(),
            Readiness::Malformed(ids) => ids,
            // Slots exist but the stream closed before any JSON completed
            Readiness::NotReady => assembler.build().into_iter().map(|c| c.id).collect(),
        };

        Ok(ModelTurn {
            content,
            tool_calls: assembler.build(),
            malformed,
        })
    }

    /// ACT: check eligibility, validate, and dispatch one tool call.
    async fn act(
        &self,
        call: &TurnToolCall,
        malformed: bool,
        effective: &BTreeSet<String>,
        cancel: &CancellationToken,
        run: &mut RunState<'_>,
    ) -> Result<Result<String, AgentError>, Halt> {
        let name = call.name();
        run.tool_calls_made += 1;

        if !effective.contains(name) {
            let known: Vec<String> = effective.iter().cloned().collect();
            let err = if self.registry.contains(name) {
                AgentError::tool_not_permitted(name)
            } else {
                AgentError::tool_not_found(name, &known)
            };
            warn!(session_id = %run.session_id, tool = name, kind = %err.kind, "Tool call rejected");
            return Ok(Err(err));
        }

        let args = match call.parsed_arguments() {
            Some(args) if !malformed => args,
            _ => {
                return Ok(Err(AgentError::tool_validation(
                    name,
                    "Arguments are not valid JSON",
                )
                .with_params(serde_json::Value::String(call.arguments().to_string()))));
            }
        };

        run.emit(AgentStreamEvent::ToolDispatched {
            id: call.id.clone(),
            name: name.to_string(),
            input: args.clone(),
        })
        .await;

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Halt::Cancelled),
            o = self.registry.dispatch(name, args.clone(), Some(self.settings.tool_timeout)) => o,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            DispatchOutcome::Completed(result) if result.success => Ok(result.output),
            DispatchOutcome::Completed(result) => Err(AgentError::tool_execution(name, result.output)),
            DispatchOutcome::Failed(e) => Err(AgentError::from(e)),
            DispatchOutcome::NotFound => Err(AgentError::tool_not_found(
                name,
                &effective.iter().cloned().collect::<Vec<_>>(),
            )),
        };
        let result = result.map_err(|e| e.with_tool(name).with_params(args));

        if let Err(err) = &result {
            warn!(
                session_id = %run.session_id,
                step = run.steps,
                tool = name,
                kind = %err.kind,
                "Tool failed: {}",
                err.message
            );
        }
        self.publish(DomainEvent::ToolExecuted {
            session_id: run.session_id.to_string(),
            tool_name: name.to_string(),
            success: result.is_ok(),
            duration_ms,
            timestamp: Utc::now(),
        });

        Ok(result)
    }

    async fn maybe_summarize(&self, window: &mut ContextWindow, session_id: &SessionId) {
        let Some(summarizer) = &self.summarizer else {
            return;
        };
        if !window.needs_summarization() {
            return;
        }
        let turns: Vec<Turn> = window.unsummarized().cloned().collect();
        match summarizer.summarize(window.summary(), &turns).await {
            Ok(summary) => {
                debug!(session_id = %session_id, turns = turns.len(), "Summarized history");
                window.set_summary(summary);
            }
            Err(e) => warn!(session_id = %session_id, "Summarization failed: {e}"),
        }
    }

    fn append(&self, window: &mut ContextWindow, turn: Turn, session_id: &SessionId) {
        let eviction = window.push(turn);
        if eviction.lossy > 0 {
            self.publish(DomainEvent::LossyEviction {
                session_id: session_id.to_string(),
                evicted: eviction.lossy,
                timestamp: Utc::now(),
            });
        }
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

/// Why THINK or ACT stopped short.
enum Halt {
    Cancelled,
    Failed(AgentError),
}

/// An assembled model turn.
struct ModelTurn {
    content: String,
    tool_calls: Vec<TurnToolCall>,
    /// Ids of calls whose arguments never became valid JSON
    malformed: Vec<String>,
}

/// Mutable bookkeeping for one run.
struct RunState<'a> {
    session_id: SessionId,
    events: Option<&'a mpsc::Sender<AgentStreamEvent>>,
    steps: u32,
    tool_calls_made: usize,
    answer: String,
    partial: String,
    usage: Usage,
    error: Option<ErrorResponse>,
}

impl<'a> RunState<'a> {
    fn new(session_id: SessionId, events: Option<&'a mpsc::Sender<AgentStreamEvent>>) -> Self {
        Self {
            session_id,
            events,
            steps: 0,
            tool_calls_made: 0,
            answer: String::new(),
            partial: String::new(),
            usage: Usage::default(),
            error: None,
        }
    }

    async fn emit(&self, event: AgentStreamEvent) {
        if let Some(tx) = self.events {
            // A dropped receiver only means nobody is listening
            let _ = tx.send(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WindowSettings;
    use agentloom_core::error::ErrorKind;
    use agentloom_core::message::Role;
    use agentloom_core::provider::{StreamDelta, ToolCallDelta};
    use agentloom_core::tool::{Tool, ToolResult};
    use agentloom_providers::{ScriptStep, ScriptedProvider};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ToolError::ExecutionFailed {
                tool_name: "flaky".into(),
                reason: "backend down".into(),
            })
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleeps for a minute"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ToolResult::ok("done"))
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        Arc::new(agentloom_tools::builtin_registry())
    }

    fn session() -> Session {
        Session::new(SessionId::from("test"), WindowSettings::default())
    }

    fn fast_settings() -> LoopSettings {
        LoopSettings {
            max_steps: 5,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_millis(1000),
            ..LoopSettings::default()
        }
    }

    fn agent(provider: Arc<ScriptedProvider>, registry: Arc<ToolRegistry>) -> AgentLoop {
        AgentLoop::new(provider, "scripted", registry).with_settings(fast_settings())
    }

    #[test]
    fn backoff_grows_and_caps() {
        let settings = fast_settings();
        assert_eq!(settings.backoff(0, None), Duration::from_millis(100));
        assert_eq!(settings.backoff(1, None), Duration::from_millis(200));
        assert_eq!(settings.backoff(3, None), Duration::from_millis(800));
        assert_eq!(settings.backoff(4, None), Duration::from_millis(1000));
        assert_eq!(settings.backoff(40, None), Duration::from_millis(1000));
        assert_eq!(settings.backoff(0, Some(5)), Duration::from_secs(5));
    }

    #[test]
    fn settings_from_config() {
        let config = AgentConfig {
            max_steps: 7,
            tool_timeout_secs: 3,
            ..AgentConfig::default()
        };
        let settings = LoopSettings::from(&config);
        assert_eq!(settings.max_steps, 7);
        assert_eq!(settings.tool_timeout, Duration::from_secs(3));
        assert_eq!(settings.retry_base_delay, Duration::from_millis(500));
        assert_eq!(settings.tool_ready_grace, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn plain_answer_is_final_on_first_step() {
        let provider = Arc::new(ScriptedProvider::new([ScriptStep::answer("The answer is 42")]));
        let agent = agent(provider.clone(), registry());
        let mut session = session();

        let outcome = agent
            .run(&mut session, "What is it?", &CancellationToken::new(), None)
            .await;

        assert_eq!(outcome.status, RunStatus::Final);
        assert_eq!(outcome.answer, "The answer is 42");
        assert_eq!(outcome.steps, 1);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(session.window.len(), 2);
        assert!(session.is_dirty());
    }

    #[tokio::test]
    async fn tool_call_then_answer() {
        let provider = Arc::new(ScriptedProvider::new([
            ScriptStep::tool_call("c1", "echo", r#"{"text":"ping"}"#),
            ScriptStep::answer("pong"),
        ]));
        let agent = agent(provider.clone(), registry());
        let mut session = session();
        let (tx, mut rx) = mpsc::channel(64);

        let outcome = agent
            .run(&mut session, "echo ping", &CancellationToken::new(), Some(&tx))
            .await;
        drop(tx);

        assert_eq!(outcome.status, RunStatus::Final);
        assert_eq!(outcome.tool_calls_made, 1);
        assert_eq!(outcome.steps, 2);

        // user, assistant(tool call), tool, assistant
        let turns: Vec<_> = session.window.turns().collect();
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[1].tool_calls[0].arguments(), r#"{"text":"ping"}"#);
        assert_eq!(turns[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(turns[2].content, "ping");

        // The second model call saw the observation
        let second = &provider.requests()[1];
        assert!(second.turns.iter().any(|t| t.content == "ping"));
        assert_eq!(second.tools.len(), 2);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.event_type());
        }
        assert_eq!(kinds.first(), Some(&"turn_started"));
        assert!(kinds.contains(&"tool_dispatched"));
        assert!(kinds.contains(&"tool_result"));
        assert_eq!(kinds.last(), Some(&"final"));
    }

    #[tokio::test]
    async fn always_failing_tool_hits_step_limit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ToolRegistry::new());
        registry.register(FailingTool {
            calls: calls.clone(),
        });
        let steps = (0..10).map(|i| ScriptStep::tool_call(&format!("c{i}"), "flaky", "{}"));
        let provider = Arc::new(ScriptedProvider::new(steps));
        let agent = agent(provider, registry).with_settings(LoopSettings {
            max_steps: 3,
            ..fast_settings()
        });
        let mut session = session();

        let outcome = agent
            .run(&mut session, "go", &CancellationToken::new(), None)
            .await;

        assert_eq!(outcome.status, RunStatus::StepLimit);
        assert_eq!(outcome.steps, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let observations: Vec<_> = session
            .window
            .turns()
            .filter(|t| t.role == agentloom_core::message::Role::Tool)
            .collect();
        assert_eq!(observations.len(), 3);
        for obs in observations {
            let json: serde_json::Value = serde_json::from_str(&obs.content).unwrap();
            assert_eq!(json["error"]["category"], "tool_execution");
        }
    }

    #[tokio::test]
    async fn unknown_tool_becomes_not_found_observation() {
        let provider = Arc::new(ScriptedProvider::new([
            ScriptStep::tool_call("c1", "teleport", "{}"),
            ScriptStep::answer("sorry"),
        ]));
        let agent = agent(provider, registry());
        let mut session = session();

        let outcome = agent
            .run(&mut session, "go", &CancellationToken::new(), None)
            .await;

        assert!(outcome.is_final());
        let obs = session.window.turns().nth(2).unwrap();
        let json: serde_json::Value = serde_json::from_str(&obs.content).unwrap();
        assert_eq!(json["error"]["error_type"], "ToolNotFoundError");
        let suggestions = json["error"]["recovery_suggestions"].to_string();
        assert!(suggestions.contains("current_time"));
        assert!(suggestions.contains("echo"));
    }

    #[tokio::test]
    async fn policy_blocks_ineligible_tool() {
        let provider = Arc::new(ScriptedProvider::new([
            ScriptStep::tool_call("c1", "echo", r#"{"text":"x"}"#),
            ScriptStep::answer("ok"),
        ]));
        let agent = agent(provider.clone(), registry())
            .with_policy(CapabilityPolicy::new(Some(["current_time"]), ["*"]));
        let mut session = session();

        agent
            .run(&mut session, "go", &CancellationToken::new(), None)
            .await;

        let obs = session.window.turns().nth(2).unwrap();
        assert!(obs.content.contains("not permitted"));
        assert!(obs.content.contains("tool_execution"));
        // Only the permitted tool was offered to the model
        let offered: Vec<_> = provider.requests()[0]
            .tools
            .iter()
            .map(|t| t.name.clone())
            .collect();
        assert_eq!(offered, vec!["current_time"]);
    }

    #[tokio::test]
    async fn session_policy_narrows_base_policy() {
        let agent = agent(Arc::new(ScriptedProvider::new([])), registry());
        let session = session().with_policy(CapabilityPolicy::new(None::<Vec<&str>>, ["echo"]));
        let effective = agent.effective_tools(&session);
        assert_eq!(effective.into_iter().collect::<Vec<_>>(), vec!["echo"]);
    }

    #[tokio::test]
    async fn invalid_arguments_become_validation_observation() {
        let provider = Arc::new(ScriptedProvider::new([
            ScriptStep::tool_call("c1", "echo", r#"{"wrong":1}"#),
            ScriptStep::answer("fixed"),
        ]));
        let agent = agent(provider, registry());
        let mut session = session();

        agent
            .run(&mut session, "go", &CancellationToken::new(), None)
            .await;

        let obs = session.window.turns().nth(2).unwrap();
        let json: serde_json::Value = serde_json::from_str(&obs.content).unwrap();
        assert_eq!(json["error"]["category"], "tool_validation");
        assert_eq!(json["error"]["context"]["tool"], "echo");
    }

    #[tokio::test]
    async fn truncated_arguments_are_not_dispatched() {
        let provider = Arc::new(ScriptedProvider::new([
            ScriptStep::Deltas(vec![
                StreamDelta::tools(vec![ToolCallDelta::start(0, "c1", "echo")]),
                StreamDelta::tools(vec![ToolCallDelta::args(0, r#"{"text":"#)]),
                StreamDelta::finish(FinishReason::Length),
            ]),
            ScriptStep::answer("done"),
        ]));
        let agent = agent(provider, registry());
        let mut session = session();

        let outcome = agent
            .run(&mut session, "go", &CancellationToken::new(), None)
            .await;

        assert!(outcome.is_final());
        let obs = session.window.turns().nth(2).unwrap();
        assert!(obs.content.contains("not valid JSON"));
    }

    #[tokio::test(start_paused = true)]
    async fn model_failures_are_retried_with_backoff() {
        let provider = Arc::new(ScriptedProvider::new([
            ScriptStep::Fail(ProviderError::Network("reset".into())),
            ScriptStep::Fail(ProviderError::RateLimited { retry_after_secs: 2 }),
            ScriptStep::answer("finally"),
        ]));
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let agent = agent(provider.clone(), registry()).with_event_bus(bus);
        let mut session = session();

        let started = tokio::time::Instant::now();
        let outcome = agent
            .run(&mut session, "go", &CancellationToken::new(), None)
            .await;

        assert!(outcome.is_final());
        assert_eq!(provider.call_count(), 3);
        // 100ms, then max(200ms, 2s retry-after)
        assert!(started.elapsed() >= Duration::from_millis(2100));

        let mut retries = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DomainEvent::ModelRetried { attempt, delay_ms, .. } = event.as_ref() {
                retries.push((*attempt, *delay_ms));
            }
        }
        assert_eq!(retries, vec![(1, 100), (2, 2000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted_aborts_with_partial() {
        let provider = Arc::new(ScriptedProvider::new([
            ScriptStep::Interrupted(
                vec![StreamDelta::text("half an ")],
                ProviderError::StreamInterrupted("reset".into()),
            ),
            ScriptStep::Fail(ProviderError::Network("down".into())),
        ]));
        let agent = agent(provider.clone(), registry()).with_settings(LoopSettings {
            max_model_retries: 1,
            ..fast_settings()
        });
        let mut session = session();

        let outcome = agent
            .run(&mut session, "go", &CancellationToken::new(), None)
            .await;

        assert_eq!(outcome.status, RunStatus::Aborted);
        assert_eq!(provider.call_count(), 2);
        assert_eq!(outcome.partial, "half an ");
        let error = outcome.error.unwrap();
        assert_eq!(error.category, ErrorKind::ModelBackend);
        assert!(error.context.trace.is_none(), "trace stripped for callers");
        // The user turn is preserved
        assert_eq!(session.window.len(), 1);
    }

    #[tokio::test]
    async fn non_retryable_model_error_aborts_immediately() {
        let provider = Arc::new(ScriptedProvider::new([ScriptStep::Fail(
            ProviderError::AuthenticationFailed("bad key".into()),
        )]));
        let agent = agent(provider.clone(), registry());
        let mut session = session();

        let outcome = agent
            .run(&mut session, "go", &CancellationToken::new(), None)
            .await;

        assert_eq!(outcome.status, RunStatus::Aborted);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_model_times_out() {
        let provider = Arc::new(ScriptedProvider::new([
            ScriptStep::Stall,
            ScriptStep::answer("recovered"),
        ]));
        let agent = agent(provider.clone(), registry()).with_settings(LoopSettings {
            model_timeout: Duration::from_secs(5),
            ..fast_settings()
        });
        let mut session = session();

        let outcome = agent
            .run(&mut session, "go", &CancellationToken::new(), None)
            .await;

        assert!(outcome.is_final());
        assert_eq!(outcome.answer, "recovered");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_stalled_model() {
        let provider = Arc::new(ScriptedProvider::new([ScriptStep::Stall]));
        let agent = agent(provider, registry());
        let mut session = session();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = agent.run(&mut session, "go", &cancel, None).await;
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.steps, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_running_tool() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(SlowTool);
        let provider = Arc::new(ScriptedProvider::new([ScriptStep::tool_call("c1", "slow", "{}")]));
        let agent = agent(provider, registry);
        let mut session = session();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let outcome = agent.run(&mut session, "go", &cancel, None).await;
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(60));

        // The tool call still has a matching observation
        let last = session.window.last().unwrap();
        assert_eq!(last.tool_call_id.as_deref(), Some("c1"));
        assert!(last.content.contains("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out_into_observation() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(SlowTool);
        let provider = Arc::new(ScriptedProvider::new([
            ScriptStep::tool_call("c1", "slow", "{}"),
            ScriptStep::answer("gave up"),
        ]));
        let agent = agent(provider, registry).with_settings(LoopSettings {
            tool_timeout: Duration::from_secs(1),
            ..fast_settings()
        });
        let mut session = session();

        let outcome = agent
            .run(&mut session, "go", &CancellationToken::new(), None)
            .await;

        assert!(outcome.is_final());
        let obs = session.window.turns().nth(2).unwrap();
        assert!(obs.content.contains("timed out"));
    }

    struct PanickingTool;

    #[async_trait]
    impl Tool for PanickingTool {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "Has a bug"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn panicking_tool_becomes_an_observation() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(PanickingTool);
        let provider = Arc::new(ScriptedProvider::new([
            ScriptStep::tool_call("c1", "boom", "{}"),
            ScriptStep::answer("sorry, that tool is broken"),
        ]));
        let agent = agent(provider, registry);
        let mut session = session();

        let outcome = agent
            .run(&mut session, "go", &CancellationToken::new(), None)
            .await;

        assert!(outcome.is_final());
        assert_eq!(outcome.tool_calls_made, 1);
        let obs = session.window.turns().nth(2).unwrap();
        assert_eq!(obs.tool_call_id.as_deref(), Some("c1"));
        assert!(obs.content.contains("ToolExecutionError"), "{}", obs.content);
        assert!(obs.content.contains("failed unexpectedly"));
        assert!(!obs.content.contains("handler bug"), "panic detail is stripped");
    }

    #[tokio::test]
    async fn oversized_input_still_reaches_model() {
        let big = "r".repeat(20_000);
        let provider = Arc::new(ScriptedProvider::new([ScriptStep::answer("ok")]));
        let agent = agent(provider.clone(), registry());
        let mut session = session();
        session.window.add_turn(Role::User, "earlier", Default::default());

        let outcome = agent
            .run(&mut session, &big, &CancellationToken::new(), None)
            .await;

        assert!(outcome.is_final());
        let sent = &provider.requests()[0].turns;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].role, Role::User);
        assert_eq!(sent[0].content, big);
    }

    #[tokio::test]
    async fn oversized_observation_still_reaches_model() {
        let big = "e".repeat(20_000);
        let provider = Arc::new(ScriptedProvider::new([
            ScriptStep::tool_call("c1", "echo", &serde_json::json!({ "text": big }).to_string()),
            ScriptStep::answer("that was long"),
        ]));
        let agent = agent(provider.clone(), registry());
        let mut session = session();

        let outcome = agent
            .run(&mut session, "shout", &CancellationToken::new(), None)
            .await;

        assert!(outcome.is_final());
        let second = &provider.requests()[1].turns;
        let roles: Vec<_> = second.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::Assistant, Role::Tool]);
        assert_eq!(second[0].tool_calls[0].id, "c1");
        assert_eq!(second[1].content, big);
    }

    fn slow_half_answer() -> ScriptStep {
        ScriptStep::Deltas(vec![
            StreamDelta::text("half an "),
            StreamDelta::text("answer"),
            StreamDelta::finish(FinishReason::Stop),
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn model_timeout_keeps_streamed_partial() {
        let provider = Arc::new(
            ScriptedProvider::new([slow_half_answer()]).with_delta_delay(Duration::from_secs(1)),
        );
        let agent = agent(provider.clone(), registry()).with_settings(LoopSettings {
            model_timeout: Duration::from_millis(1500),
            max_model_retries: 0,
            ..fast_settings()
        });
        let mut session = session();

        let outcome = agent
            .run(&mut session, "go", &CancellationToken::new(), None)
            .await;

        assert_eq!(outcome.status, RunStatus::Aborted);
        assert_eq!(outcome.partial, "half an ");
        assert_eq!(outcome.best_text(), "half an ");
        assert_eq!(outcome.error.unwrap().category, ErrorKind::ModelTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_keeps_streamed_partial() {
        let provider = Arc::new(
            ScriptedProvider::new([slow_half_answer()]).with_delta_delay(Duration::from_secs(1)),
        );
        let agent = agent(provider, registry());
        let mut session = session();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        let outcome = agent.run(&mut session, "go", &cancel, None).await;
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(outcome.partial, "half an ");
    }

    #[tokio::test(start_paused = true)]
    async fn closed_tool_call_is_acted_on_without_waiting_for_stream_end() {
        let provider = Arc::new(
            ScriptedProvider::new([
                ScriptStep::Deltas(vec![
                    StreamDelta::tools(vec![ToolCallDelta::start(0, "c1", "echo")]),
                    StreamDelta::tools(vec![ToolCallDelta::args(0, r#"{"text":"hi"}"#)]),
                    StreamDelta::tools(vec![]),
                    StreamDelta::tools(vec![]),
                    StreamDelta::tools(vec![]),
                    StreamDelta::finish(FinishReason::ToolCalls),
                ]),
                ScriptStep::answer("done"),
            ])
            .with_delta_delay(Duration::from_secs(1)),
        );
        let agent = agent(provider.clone(), registry()).with_settings(LoopSettings {
            model_timeout: Duration::from_millis(2500),
            max_model_retries: 0,
            ..fast_settings()
        });
        let mut session = session();

        let started = tokio::time::Instant::now();
        let outcome = agent
            .run(&mut session, "go", &CancellationToken::new(), None)
            .await;

        assert_eq!(outcome.status, RunStatus::Final, "{:?}", outcome.error);
        assert_eq!(outcome.tool_calls_made, 1);
        assert_eq!(session.window.turns().nth(2).unwrap().content, "hi");
        assert_eq!(provider.call_count(), 2);
        // Two deltas plus the grace period, then two deltas for the answer
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn non_streaming_mode_uses_complete() {
        let provider = Arc::new(ScriptedProvider::new([
            ScriptStep::tool_call("c1", "echo", r#"{"text":"hi"}"#),
            ScriptStep::answer("bye"),
        ]));
        let agent = agent(provider.clone(), registry()).with_settings(LoopSettings {
            stream: false,
            ..fast_settings()
        });
        let mut session = session();

        let outcome = agent
            .run(&mut session, "go", &CancellationToken::new(), None)
            .await;

        assert!(outcome.is_final());
        assert_eq!(outcome.answer, "bye");
        assert!(!provider.requests()[0].stream);
    }

    struct CountingSummarizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for CountingSummarizer {
        async fn summarize(
            &self,
            _previous: Option<&str>,
            turns: &[Turn],
        ) -> Result<String, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{} earlier turns", turns.len()))
        }
    }

    #[tokio::test]
    async fn summarizer_runs_when_threshold_reached() {
        let provider = Arc::new(ScriptedProvider::new([ScriptStep::answer("ok")]));
        let summarizer = Arc::new(CountingSummarizer {
            calls: AtomicUsize::new(0),
        });
        let agent = agent(provider.clone(), registry()).with_summarizer(summarizer.clone());
        let mut session = Session::new(
            SessionId::from("s"),
            WindowSettings {
                summary_threshold: 2,
                ..WindowSettings::default()
            },
        );
        session.window.push(Turn::user("a"));
        session.window.push(Turn::assistant("b"));

        agent
            .run(&mut session, "c", &CancellationToken::new(), None)
            .await;

        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.window.summary(), Some("2 earlier turns"));
        let first_request = &provider.requests()[0];
        assert!(first_request.turns[0].content.contains("2 earlier turns"));
    }
}
