//! Tool registry and capability policy for agentloom.
//!
//! - [`ToolRegistry`]: process-wide catalog of tools, safe for concurrent
//!   dispatch, with replace-guarded registration and an instance cache.
//! - [`CapabilityPolicy`]: the whitelist/enabled sets a session applies on
//!   top of the registry.
//! - A couple of built-in tools that need no external services.

pub mod builtin;
pub mod policy;
pub mod registry;
pub mod validate;

pub use policy::CapabilityPolicy;
pub use registry::{DispatchOutcome, Registration, ToolFactory, ToolRegistry};
pub use validate::validate_arguments;

/// Create a registry holding the built-in tools.
pub fn builtin_registry() -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.register(builtin::CurrentTimeTool);
    registry.register(builtin::EchoTool);
    registry
}
