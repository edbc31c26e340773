//! # agentloom core
//!
//! Domain types, traits, and error definitions for the agentloom agent runtime.
//! This crate has **no framework dependencies**: it defines the domain model
//! that the provider, tool, and agent crates implement against.
//!
//! ## Design Philosophy
//!
//! Every collaborator at the edge of the runtime is a trait here:
//! - [`Provider`] for the model backend
//! - [`Tool`] for executable capabilities
//! - [`SessionStore`] for session persistence
//!
//! Implementations live in their respective crates, so tests can swap in
//! scripted stand-ins without touching the agent loop.

pub mod error;
pub mod error_handler;
pub mod event;
pub mod message;
pub mod provider;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{AgentError, Error, ErrorContext, ErrorKind, ProviderError, Result, ToolError};
pub use error_handler::{ErrorHandler, ErrorResponse};
pub use event::{DomainEvent, EventBus};
pub use message::{FunctionCall, Role, SessionId, Turn, TurnToolCall};
pub use provider::{
    DeltaReceiver, FinishReason, Provider, ProviderRequest, ProviderResponse, StreamDelta,
    ToolCallDelta, ToolDefinition, Usage,
};
pub use session::{SessionError, SessionStore};
pub use tool::{Tool, ToolDescriptor, ToolResult, ToolStatus};
