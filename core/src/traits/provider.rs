use crate::traits::ToolSpec;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One wire message in a provider round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: String, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id),
        }
    }
}

/// A tool invocation requested by the model within an assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub messages: &'a [ChatMessage],
    pub tools: Option<&'a [ToolSpec]>,
}

/// What a round-trip produced: a finished reply, or a request to run tools.
/// Callers must handle both arms.
#[derive(Debug, Clone)]
pub enum Completion {
    Text {
        content: String,
        tokens_used: Option<u32>,
    },
    ToolUse {
        calls: Vec<ToolCall>,
        tokens_used: Option<u32>,
    },
}

impl Completion {
    pub fn tokens_used(&self) -> Option<u32> {
        match self {
            Self::Text { tokens_used, .. } | Self::ToolUse { tokens_used, .. } => *tokens_used,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("API key is required for {provider}")]
    MissingApiKey { provider: String },

    #[error("{provider} unavailable: {message}")]
    Unavailable { provider: String, message: String },

    #[error("{provider} rate limited: {message}")]
    RateLimited { provider: String, message: String },

    #[error("malformed response from {provider}: {message}")]
    Malformed { provider: String, message: String },
}

impl ProviderError {
    pub fn unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn rate_limited(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RateLimited {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn malformed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProviderEvent {
    Token(String),
    ToolCall(ToolCall),
    Done,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: ChatRequest<'_>) -> Result<Completion, ProviderError>;

    /// Streaming is an interface contract only; the default implementation
    /// replays a finished completion as a one-shot stream.
    async fn complete_stream(
        &self,
        request: ChatRequest<'_>,
    ) -> Result<BoxStream<'static, ProviderEvent>, ProviderError> {
        let events = match self.complete(request).await? {
            Completion::Text { content, .. } => {
                vec![ProviderEvent::Token(content), ProviderEvent::Done]
            }
            Completion::ToolUse { calls, .. } => calls
                .into_iter()
                .map(ProviderEvent::ToolCall)
                .chain(std::iter::once(ProviderEvent::Done))
                .collect(),
        };
        Ok(stream::iter(events).boxed())
    }
}
