//! `agentloom chat` — Interactive or single-message chat mode.

use std::io::Write;
use std::sync::Arc;

use agentloom_agent::{
    AgentLoop, AgentStreamEvent, CancellationToken, InMemorySessionStore, RunOutcome, RunStatus,
    Session, WindowSettings,
};
use agentloom_config::AppConfig;
use agentloom_core::event::EventBus;
use agentloom_core::message::SessionId;
use agentloom_core::session::SessionStore;
use agentloom_tools::{ToolRegistry, builtin_registry};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

pub async fn run(message: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    // Check for API key early — give a clear error
    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    AGENTLOOM_API_KEY = 'sk-...'");
        eprintln!("    OPENAI_API_KEY    = 'sk-...'");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let provider = agentloom_providers::from_config(&config)?;

    let registry = Arc::new(builtin_registry());
    if ToolRegistry::install_global(registry.clone()).is_err() {
        tracing::debug!("Global tool registry already installed");
    }

    let agent = AgentLoop::from_config(provider, registry, &config)
        .with_event_bus(Arc::new(EventBus::default()));

    let store = InMemorySessionStore::new();
    let session_id = SessionId::new();
    let settings = WindowSettings::from(&config.context);

    if let Some(msg) = message {
        // Single message mode
        let mut session = store.load_or_create(&session_id, settings).await?;
        let outcome = run_turn(&agent, &mut session, &msg).await;
        store.save(&session_id, session).await?;
        return report(&outcome);
    }

    // Interactive mode
    println!();
    println!("  agentloom — interactive mode");
    println!();
    println!("  Model:     {}", config.model);
    println!("  Session:   {session_id}");
    println!("  Max steps: {}", config.agent.max_steps);
    println!();
    println!("  Type your message and press Enter.");
    println!("  Ctrl+C cancels a running turn; type 'exit' to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        let mut session = store.load_or_create(&session_id, settings).await?;
        let outcome = run_turn(&agent, &mut session, line).await;
        store.save(&session_id, session).await?;
        store.flush().await?;

        if let Err(e) = report(&outcome) {
            eprintln!("  [Error] {e}");
        }
        println!();
    }

    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

/// Run one user message, printing streamed events as they arrive.
async fn run_turn(agent: &AgentLoop, session: &mut Session, input: &str) -> RunOutcome {
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let (tx, mut rx) = mpsc::channel(64);
    let printer = tokio::spawn(async move {
        let mut started_answer = false;
        while let Some(event) = rx.recv().await {
            match event {
                AgentStreamEvent::Chunk { content } => {
                    if !started_answer {
                        print!("  Assistant > ");
                        started_answer = true;
                    }
                    print!("{content}");
                    let _ = std::io::stdout().flush();
                }
                AgentStreamEvent::ToolDispatched { name, input, .. } => {
                    if started_answer {
                        println!();
                        started_answer = false;
                    }
                    eprintln!("  [tool] {name} {input}");
                }
                AgentStreamEvent::Error { error } => {
                    eprintln!("  [tool error] {}", error.message);
                }
                event if event.is_terminal() => {
                    if started_answer {
                        println!();
                    }
                }
                _ => {}
            }
        }
    });

    let outcome = agent.run(session, input, &cancel, Some(&tx)).await;
    drop(tx);
    let _ = printer.await;
    interrupt.abort();
    outcome
}

fn report(outcome: &RunOutcome) -> Result<(), Box<dyn std::error::Error>> {
    match outcome.status {
        RunStatus::Final => Ok(()),
        RunStatus::StepLimit => {
            eprintln!(
                "  [step limit] stopped after {} steps; partial answer shown above",
                outcome.steps
            );
            Ok(())
        }
        RunStatus::Cancelled => {
            eprintln!("  [cancelled]");
            Ok(())
        }
        RunStatus::Aborted => {
            let detail = match &outcome.error {
                Some(error) => {
                    let mut text = error.message.clone();
                    for suggestion in &error.recovery_suggestions {
                        text.push_str(&format!("\n    hint: {suggestion}"));
                    }
                    text
                }
                None => "aborted".to_string(),
            };
            Err(detail.into())
        }
    }
}
