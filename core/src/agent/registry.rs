use crate::traits::{Tool, ToolError, ToolSpec};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// The result of one tool invocation. Failures are data, not errors: the
/// orchestrator feeds them back to the model as a tool-result message.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub tool: String,
    pub success: bool,
    pub output: String,
}

impl ToolOutcome {
    fn failure(tool: &str, reason: impl Into<String>) -> Self {
        Self {
            tool: tool.to_string(),
            success: false,
            output: reason.into(),
        }
    }

    /// Content of the tool-result message fed back to the model.
    pub fn render(&self) -> String {
        if self.success {
            self.output.clone()
        } else {
            format!("tool failed: {}", self.output)
        }
    }
}

pub struct ToolRegistry {
    tools: Mutex<Vec<Arc<dyn Tool>>>,
    invocation_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(invocation_timeout: Duration) -> Self {
        Self {
            tools: Mutex::new(Vec::new()),
            invocation_timeout,
        }
    }

    pub fn register(&self, tool: Box<dyn Tool>) {
        let mut tools = self.tools.lock().unwrap();
        tools.push(Arc::from(tool));
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        let tools = self.tools.lock().unwrap();
        tools.iter().map(|t| t.spec()).collect()
    }

    /// Validates, dispatches, and times out one invocation. Never panics and
    /// never returns an error.
    pub async fn invoke(&self, name: &str, args: &Value) -> ToolOutcome {
        let tool = {
            let tools = self.tools.lock().unwrap();
            tools.iter().find(|t| t.name() == name).cloned()
        };

        let Some(tool) = tool else {
            warn!(requested_tool = %name, "Unknown tool requested by model");
            return ToolOutcome::failure(name, format!("unknown tool '{name}'"));
        };

        if let Err(reason) = validate_args(&tool.parameters_schema(), args) {
            warn!(tool = %name, %reason, "Tool arguments rejected before dispatch");
            return ToolOutcome::failure(name, format!("invalid arguments: {reason}"));
        }

        let timeout_secs = self.invocation_timeout.as_secs();
        let outcome = match tokio::time::timeout(self.invocation_timeout, tool.execute(args.clone()))
            .await
        {
            Err(_) => ToolOutcome::failure(name, ToolError::Timeout(timeout_secs).to_string()),
            Ok(Err(e)) => ToolOutcome::failure(name, e.to_string()),
            Ok(Ok(output)) => ToolOutcome {
                tool: name.to_string(),
                success: true,
                output,
            },
        };

        info!(tool = %outcome.tool, success = outcome.success, "Tool executed");
        outcome
    }
}

/// Checks arguments against the tool's declared JSON schema: the payload
/// must be an object, every required property must be present, and only
/// declared properties are accepted.
fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(provided) = args.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !provided.contains_key(field) {
                return Err(format!("missing required field '{field}'"));
            }
        }
    }

    let declared = schema.get("properties").and_then(Value::as_object);
    for key in provided.keys() {
        let known = declared.is_some_and(|props| props.contains_key(key));
        if !known {
            return Err(format!("unknown field '{key}'"));
        }
    }

    Ok(())
}
