use crate::tools::extract_string_arg;
use crate::traits::{Tool, ToolError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

const DUCKDUCKGO_URL: &str = "https://api.duckduckgo.com/";

#[derive(Debug, Default, Deserialize)]
struct InstantAnswer {
    #[serde(default, rename = "Abstract")]
    abstract_text: String,
    #[serde(default, rename = "AbstractURL")]
    abstract_url: String,
    #[serde(default, rename = "Answer")]
    answer: String,
}

pub struct WebSearchTool {
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolError> {
        let query = extract_string_arg(&args, "query")?;

        let response = self
            .client
            .get(DUCKDUCKGO_URL)
            .query(&[
                ("q", query.as_str()),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await
            .map_err(|e| ToolError::Unavailable(format!("search request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ToolError::Unavailable(format!(
                "search provider returned {}",
                response.status()
            )));
        }

        // The instant-answer endpoint labels its JSON as javascript, so
        // parse from the raw body instead of relying on the content type.
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Unavailable(format!("search response unreadable: {e}")))?;
        let data: InstantAnswer = serde_json::from_str(&body)
            .map_err(|e| ToolError::Unavailable(format!("unexpected search payload: {e}")))?;

        if !data.abstract_text.is_empty() {
            let source = if data.abstract_url.is_empty() {
                "N/A".to_string()
            } else {
                data.abstract_url
            };
            Ok(format!(
                "Search results for '{}':\n\n{}\n\nSource: {}",
                query, data.abstract_text, source
            ))
        } else if !data.answer.is_empty() {
            Ok(format!("Answer for '{}':\n\n{}", query, data.answer))
        } else {
            Ok(format!(
                "I couldn't find specific information for '{}'. You might want to try a different search term.",
                query
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_query_is_invalid() {
        let tool = WebSearchTool::new();
        let result = tool.execute(serde_json::json!({})).await;
        assert!(matches!(result, Err(ToolError::InvalidArguments(_))));
    }

    #[test]
    fn instant_answer_tolerates_missing_fields() {
        let data: InstantAnswer = serde_json::from_str("{}").unwrap();
        assert!(data.abstract_text.is_empty());
        assert!(data.answer.is_empty());
    }
}
