use crate::traits::{
    ChatMessage, ChatRequest, Completion, Provider, ProviderError, Role, ToolCall, ToolSpec,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PROVIDER_NAME: &str = "ollama";

#[derive(Debug, Serialize)]
struct OllamaApiRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OllamaTool>>,
    options: OllamaOptions,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaTool {
    r#type: String,
    function: OllamaToolFunction,
}

#[derive(Debug, Serialize)]
struct OllamaToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct OllamaApiResponse {
    message: OllamaResponseMessage,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OllamaToolCallResponse>>,
}

#[derive(Debug, Deserialize)]
struct OllamaToolCallResponse {
    function: OllamaFunctionResponse,
}

#[derive(Debug, Deserialize)]
struct OllamaFunctionResponse {
    name: String,
    arguments: serde_json::Value,
}

pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f64,
    request_timeout: Duration,
}

impl OllamaProvider {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            temperature: 0.7,
            request_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let url = base_url.into();
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Ollama has no `tool` role; tool results are folded into a user
    /// message, and assistant tool requests are replayed as plain text.
    fn convert_messages(&self, messages: &[ChatMessage]) -> Vec<OllamaMessage> {
        let mut result: Vec<OllamaMessage> = Vec::new();
        let mut tool_results: Vec<String> = Vec::new();

        for m in messages {
            if m.role == Role::Tool {
                let id = m.tool_call_id.as_deref().unwrap_or("unknown");
                tool_results.push(format!(
                    "<tool_result id=\"{}\">\n{}\n</tool_result>",
                    id, m.content
                ));
                continue;
            }

            if !tool_results.is_empty() {
                result.push(OllamaMessage {
                    role: "user".to_string(),
                    content: format!("[Tool results]\n{}", tool_results.join("\n")),
                });
                tool_results.clear();
            }

            let content = match &m.tool_calls {
                Some(calls) if !calls.is_empty() => {
                    let rendered: Vec<String> = calls
                        .iter()
                        .map(|c| format!("[requested tool {} with {}]", c.name, c.arguments))
                        .collect();
                    format!("{}\n{}", m.content, rendered.join("\n"))
                }
                _ => m.content.clone(),
            };

            result.push(OllamaMessage {
                role: m.role.as_str().to_string(),
                content,
            });
        }

        if !tool_results.is_empty() {
            result.push(OllamaMessage {
                role: "user".to_string(),
                content: format!("[Tool results]\n{}", tool_results.join("\n")),
            });
        }

        result
    }

    fn convert_tools(tools: &[ToolSpec]) -> Vec<OllamaTool> {
        tools
            .iter()
            .map(|t| OllamaTool {
                r#type: "function".to_string(),
                function: OllamaToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters_schema.clone(),
                },
            })
            .collect()
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn complete(&self, request: ChatRequest<'_>) -> Result<Completion, ProviderError> {
        let api_request = OllamaApiRequest {
            model: self.model.clone(),
            messages: self.convert_messages(request.messages),
            tools: request.tools.map(Self::convert_tools),
            options: OllamaOptions {
                temperature: self.temperature,
            },
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(self.request_timeout)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::unavailable(PROVIDER_NAME, "request timed out")
                } else {
                    ProviderError::unavailable(PROVIDER_NAME, e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.as_u16() == 429 {
                ProviderError::rate_limited(PROVIDER_NAME, body)
            } else {
                ProviderError::unavailable(PROVIDER_NAME, format!("{status}: {body}"))
            });
        }

        let api_response: OllamaApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(PROVIDER_NAME, e.to_string()))?;

        let tokens_used = match (api_response.prompt_eval_count, api_response.eval_count) {
            (None, None) => None,
            (prompt, eval) => Some(prompt.unwrap_or(0) + eval.unwrap_or(0)),
        };

        if let Some(raw_calls) = api_response.message.tool_calls
            && !raw_calls.is_empty()
        {
            let calls = raw_calls
                .into_iter()
                .enumerate()
                .map(|(i, c)| ToolCall {
                    id: format!("call_{i}"),
                    name: c.function.name,
                    arguments: c.function.arguments,
                })
                .collect();
            return Ok(Completion::ToolUse { calls, tokens_used });
        }

        match api_response.message.content {
            Some(content) if !content.trim().is_empty() => Ok(Completion::Text {
                content,
                tokens_used,
            }),
            _ => Err(ProviderError::malformed(
                PROVIDER_NAME,
                "empty response: no content or tool calls",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_results_fold_into_user_messages() {
        let provider = OllamaProvider::new();
        let messages = vec![
            ChatMessage::user("what is 2+2?"),
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![ToolCall {
                    id: "call_0".to_string(),
                    name: "calculate".to_string(),
                    arguments: serde_json::json!({"expression": "2+2"}),
                }],
            ),
            ChatMessage::tool_result("call_0".to_string(), "4"),
        ];

        let converted = provider.convert_messages(&messages);
        assert_eq!(converted.len(), 3);
        assert_eq!(converted[2].role, "user");
        assert!(converted[2].content.contains("<tool_result id=\"call_0\">"));
        assert!(converted[1].content.contains("requested tool calculate"));
    }
}
