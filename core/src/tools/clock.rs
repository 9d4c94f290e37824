use crate::traits::{Tool, ToolError};
use async_trait::async_trait;
use serde_json::json;

pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "get_current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, _args: serde_json::Value) -> Result<String, ToolError> {
        let now = chrono::Local::now();
        Ok(format!(
            "Current date and time: {}",
            now.format("%Y-%m-%d %H:%M:%S")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_a_timestamp() {
        let out = ClockTool.execute(serde_json::json!({})).await.unwrap();
        assert!(out.starts_with("Current date and time: "));
    }
}
