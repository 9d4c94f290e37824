use crate::traits::ToolError;
use serde_json::Value;

pub mod calculator;
pub mod clock;
pub mod weather;
pub mod web_search;

pub use calculator::CalculatorTool;
pub use clock::ClockTool;
pub use weather::WeatherTool;
pub use web_search::WebSearchTool;

pub fn extract_string_arg(args: &Value, key: &str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing '{key}' parameter")))
}
