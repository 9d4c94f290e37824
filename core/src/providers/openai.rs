use crate::traits::{
    ChatMessage, ChatRequest, Completion, Provider, ProviderError, ToolCall, ToolSpec,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PROVIDER_NAME: &str = "openai";

#[derive(Debug, Serialize)]
struct OpenAiApiRequest<'a> {
    model: String,
    messages: Vec<OpenAiMessage<'a>>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCallRequest<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct OpenAiToolCallRequest<'a> {
    id: &'a str,
    r#type: &'a str,
    function: OpenAiFunctionRequest<'a>,
}

#[derive(Debug, Serialize)]
struct OpenAiFunctionRequest<'a> {
    name: &'a str,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiToolFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunction {
    name: String,
    arguments: String,
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: f64,
    request_timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key: api_key.into(),
            model: "gpt-4o".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            max_tokens: 1000,
            temperature: 0.7,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
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

    fn convert_messages<'a>(&self, messages: &'a [ChatMessage]) -> Vec<OpenAiMessage<'a>> {
        messages
            .iter()
            .map(|m| {
                let tool_calls = m.tool_calls.as_ref().map(|tool_calls| {
                    tool_calls
                        .iter()
                        .map(|tc| OpenAiToolCallRequest {
                            id: &tc.id,
                            r#type: "function",
                            function: OpenAiFunctionRequest {
                                name: &tc.name,
                                arguments: tc.arguments.to_string(),
                            },
                        })
                        .collect()
                });

                OpenAiMessage {
                    role: m.role.as_str(),
                    content: Some(m.content.as_str()),
                    tool_calls,
                    tool_call_id: m.tool_call_id.as_deref(),
                }
            })
            .collect()
    }

    fn convert_tools(&self, tools: &[ToolSpec]) -> Vec<OpenAiTool> {
        tools
            .iter()
            .map(|t| OpenAiTool {
                r#type: "function".to_string(),
                function: OpenAiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters_schema.clone(),
                },
            })
            .collect()
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn complete(&self, request: ChatRequest<'_>) -> Result<Completion, ProviderError> {
        let api_request = OpenAiApiRequest {
            model: self.model.clone(),
            messages: self.convert_messages(request.messages),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            tools: request.tools.map(|t| self.convert_tools(t)),
            tool_choice: request.tools.map(|_| "auto"),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.request_timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
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

        let api_response: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(PROVIDER_NAME, e.to_string()))?;

        let tokens_used = api_response.usage.map(|u| u.total_tokens);
        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::malformed(PROVIDER_NAME, "no choices in response"))?;

        if let Some(raw_calls) = choice.message.tool_calls
            && !raw_calls.is_empty()
        {
            let mut calls = Vec::with_capacity(raw_calls.len());
            for c in raw_calls {
                let arguments = serde_json::from_str(&c.function.arguments).map_err(|e| {
                    ProviderError::malformed(
                        PROVIDER_NAME,
                        format!("unparseable tool arguments for {}: {e}", c.function.name),
                    )
                })?;
                calls.push(ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments,
                });
            }
            return Ok(Completion::ToolUse { calls, tokens_used });
        }

        match choice.message.content {
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
