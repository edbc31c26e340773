//! Model provider implementations for agentloom.
//!
//! All providers implement the `agentloom_core::Provider` trait and decode
//! their wire format into normalized `StreamDelta`s.

pub mod openai_compat;
pub mod scripted;

pub use openai_compat::OpenAiCompatProvider;
pub use scripted::{ScriptStep, ScriptedProvider};

use agentloom_config::AppConfig;
use agentloom_core::error::ProviderError;
use agentloom_core::provider::Provider;
use std::sync::Arc;

/// Build the provider described by the application config.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let provider = OpenAiCompatProvider::from_config(config)?;
    tracing::debug!(base_url = %config.base_url, model = %config.model, "Provider configured");
    Ok(Arc::new(provider))
}
