//! The tool registry: name → handler + descriptor.
//!
//! The registry is shared by every session in a process, so its tables sit
//! behind locks. Lookups clone an `Arc` out of the table and release the
//! lock before any tool code runs; registration takes the write lock.
//!
//! Capability filtering is **not** applied here. The registry always knows
//! every registered tool; the agent loop intersects its names with the
//! session's `CapabilityPolicy`.

use agentloom_core::error::ToolError;
use agentloom_core::provider::ToolDefinition;
use agentloom_core::tool::{Tool, ToolDescriptor, ToolResult};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::validate::validate_arguments;

/// Builds a tool instance from construction arguments.
pub type ToolFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn Tool>, ToolError> + Send + Sync>;

/// The two ways a name can be backed. Both resolve to an `Arc<dyn Tool>`.
#[derive(Clone)]
enum Handler {
    Instance(Arc<dyn Tool>),
    Factory(ToolFactory),
}

#[derive(Clone)]
struct Entry {
    handler: Handler,
    descriptor: ToolDescriptor,
}

/// What happened to a registration request.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// The name was new.
    Registered,
    /// The name existed and `replace` was set.
    Replaced,
    /// The name existed and `replace` was not set; the original stays.
    Kept(ToolDescriptor),
}

/// The outcome of a dispatch. A missing name is a normal outcome, not an error.
#[derive(Debug)]
pub enum DispatchOutcome {
    Completed(ToolResult),
    Failed(ToolError),
    NotFound,
}

static GLOBAL: OnceLock<Arc<ToolRegistry>> = OnceLock::new();

/// A registry of available tools.
///
/// The agent loop uses this to:
/// 1. Get descriptors to send to the model
/// 2. Resolve and execute tools when the model requests them
#[derive(Default)]
pub struct ToolRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    instances: Mutex<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own name with derived metadata.
    /// Never overwrites an existing registration.
    pub fn register(&self, tool: impl Tool + 'static) -> Registration {
        self.register_with(Arc::new(tool), None, false)
    }

    /// Register a tool instance.
    ///
    /// When `descriptor` is `None` it is derived from the tool's own
    /// description and parameter schema. The descriptor's name is forced to
    /// the tool's name so the key and metadata never disagree.
    pub fn register_with(
        &self,
        tool: Arc<dyn Tool>,
        descriptor: Option<ToolDescriptor>,
        replace: bool,
    ) -> Registration {
        let name = tool.name().to_string();
        let mut descriptor = descriptor.unwrap_or_else(|| ToolDescriptor::derive(tool.as_ref()));
        descriptor.name = name.clone();
        self.insert(
            name,
            Entry {
                handler: Handler::Instance(tool),
                descriptor,
            },
            replace,
        )
    }

    /// Register a factory that builds the tool from construction arguments.
    pub fn register_factory(
        &self,
        name: &str,
        descriptor: ToolDescriptor,
        factory: ToolFactory,
        replace: bool,
    ) -> Registration {
        let mut descriptor = descriptor;
        descriptor.name = name.to_string();
        self.insert(
            name.to_string(),
            Entry {
                handler: Handler::Factory(factory),
                descriptor,
            },
            replace,
        )
    }

    fn insert(&self, name: String, entry: Entry, replace: bool) -> Registration {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !replace && let Some(existing) = entries.get(&name) {
            warn!(tool = %name, "Tool already registered, keeping the original");
            return Registration::Kept(existing.descriptor.clone());
        }

        let replaced = entries.insert(name.clone(), entry).is_some();
        drop(entries);

        if replaced {
            info!(tool = %name, "Replacing registered tool");
            self.forget_instance(&name);
            Registration::Replaced
        } else {
            debug!(tool = %name, "Registered tool");
            Registration::Registered
        }
    }

    /// Remove a tool. Returns its descriptor if it was registered.
    pub fn unregister(&self, name: &str) -> Option<ToolDescriptor> {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .map(|e| e.descriptor);
        self.forget_instance(name);
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read_entries().contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<ToolDescriptor> {
        self.read_entries().get(name).map(|e| e.descriptor.clone())
    }

    /// All descriptors, sorted by name.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut all: Vec<_> = self
            .read_entries()
            .values()
            .map(|e| e.descriptor.clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// All registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read_entries().keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions for the given names only, in name order.
    /// Unknown names are skipped.
    pub fn definitions_for<'a, I>(&self, names: I) -> Vec<ToolDefinition>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let entries = self.read_entries();
        let mut defs: Vec<_> = names
            .into_iter()
            .filter_map(|n| entries.get(n))
            .map(|e| e.descriptor.to_definition())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    /// Resolve a name to a callable tool.
    ///
    /// Instances are returned directly; factories are invoked with `args`.
    /// `None` means the name is not registered.
    pub fn resolve(
        &self,
        name: &str,
        args: &serde_json::Value,
    ) -> Option<Result<Arc<dyn Tool>, ToolError>> {
        let handler = self.read_entries().get(name).map(|e| e.handler.clone())?;
        Some(match handler {
            Handler::Instance(tool) => Ok(tool),
            Handler::Factory(factory) => factory(args),
        })
    }

    /// Validate `args` against the tool's input schema and execute it.
    ///
    /// A `timeout` of `None` lets the tool run to completion.
    pub async fn dispatch(
        &self,
        name: &str,
        args: serde_json::Value,
        timeout: Option<Duration>,
    ) -> DispatchOutcome {
        let Some(descriptor) = self.descriptor(name) else {
            return DispatchOutcome::NotFound;
        };

        if let Err(reason) = validate_arguments(&descriptor.input_schema, &args) {
            return DispatchOutcome::Failed(ToolError::InvalidArguments(format!(
                "{name}: {reason}"
            )));
        }

        let tool = match self.resolve(name, &args) {
            Some(Ok(tool)) => tool,
            Some(Err(e)) => return DispatchOutcome::Failed(e),
            // Unregistered between the descriptor read and now
            None => return DispatchOutcome::NotFound,
        };

        // A panicking handler is a tool failure, not a crashed session
        let guarded = AssertUnwindSafe(tool.execute(args)).catch_unwind();
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(r) => r,
                Err(_) => Ok(Err(ToolError::Timeout {
                    tool_name: name.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                })),
            },
            None => guarded.await,
        };

        match result {
            Ok(Ok(r)) => DispatchOutcome::Completed(r),
            Ok(Err(e)) => DispatchOutcome::Failed(e),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(tool = %name, "Tool handler panicked: {message}");
                DispatchOutcome::Failed(ToolError::Panicked {
                    tool_name: name.to_string(),
                    message,
                })
            }
        }
    }

    /// Return the cached instance for `name`, creating it on first use.
    ///
    /// At most one instance exists per name until [`clear_instances`] is
    /// called. Later calls ignore `args`, even if they differ from the
    /// arguments the instance was built with.
    ///
    /// [`clear_instances`]: Self::clear_instances
    pub fn get_or_create(
        &self,
        name: &str,
        args: &serde_json::Value,
    ) -> Option<Result<Arc<dyn Tool>, ToolError>> {
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = instances.get(name) {
            return Some(Ok(existing.clone()));
        }
        let created = self.resolve(name, args)?;
        if let Ok(tool) = &created {
            instances.insert(name.to_string(), tool.clone());
        }
        Some(created)
    }

    pub fn clear_instances(&self) {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn forget_instance(&self, name: &str) {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the process-wide default registry.
    ///
    /// Succeeds once per process; later calls hand the registry back.
    /// Prefer injecting a registry into the agent loop; the global exists
    /// for front doors that need a shared default.
    pub fn install_global(registry: Arc<ToolRegistry>) -> Result<(), Arc<ToolRegistry>> {
        GLOBAL.set(registry)
    }

    /// The process-wide default registry, if one was installed.
    pub fn global() -> Option<Arc<ToolRegistry>> {
        GLOBAL.get().cloned()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
