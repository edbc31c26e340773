//! Small built-in tools that need no external services.

use agentloom_core::error::ToolError;
use agentloom_core::tool::{Tool, ToolResult};
use async_trait::async_trait;
use chrono::Utc;

/// Reports the current UTC time.
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in UTC. Optionally pass a strftime format."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "format": {
                    "type": "string",
                    "description": "strftime format string, e.g. '%Y-%m-%d'. Defaults to RFC 3339."
                }
            }
        })
    }

    fn capability_tags(&self) -> Vec<String> {
        vec!["read".into(), "clock".into()]
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let now = Utc::now();
        let output = match arguments.get("format").and_then(|f| f.as_str()) {
            Some(fmt) => {
                use std::fmt::Write;
                let mut out = String::new();
                write!(out, "{}", now.format(fmt)).map_err(|_| {
                    ToolError::InvalidArguments(format!("invalid time format '{fmt}'"))
                })?;
                out
            }
            None => now.to_rfc3339(),
        };
        Ok(ToolResult::ok(output).with_data(serde_json::json!({ "unix": now.timestamp() })))
    }
}

/// Echoes its `text` argument back. Useful for checking tool plumbing.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back unchanged."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo" }
            },
            "required": ["text"]
        })
    }

    fn capability_tags(&self) -> Vec<String> {
        vec!["diagnostic".into()]
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let text = arguments["text"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'text' argument".into()))?;
        Ok(ToolResult::ok(text))
    }
}
