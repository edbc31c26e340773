//! `agentloom tools` — List registered tools.

use agentloom_config::AppConfig;
use agentloom_tools::{CapabilityPolicy, builtin_registry};

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let policy = CapabilityPolicy::from(&config.tools);
    let registry = builtin_registry();

    println!();
    for descriptor in registry.descriptors() {
        let allowed = if policy.permits(&descriptor.name) {
            "enabled"
        } else {
            "blocked"
        };
        let tags: Vec<&str> = descriptor.capability_tags.iter().map(String::as_str).collect();
        println!(
            "  {:<14} {:<8} {:<13} [{}]",
            descriptor.name,
            allowed,
            serde_json::to_value(descriptor.status)?
                .as_str()
                .unwrap_or_default(),
            tags.join(", ")
        );
        println!("  {:<14} {}", "", descriptor.description);
    }
    println!();
    println!("  {} tools registered", registry.len());
    println!();
    Ok(())
}
