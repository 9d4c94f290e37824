use crate::traits::{ChatRequest, Completion, Provider, ProviderError, ToolCall};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

enum MockMode {
    /// Pop one scripted result per call; erroring once the script runs dry.
    Script(Mutex<VecDeque<Result<Completion, ProviderError>>>),
    /// Answer every call with the same text.
    Fixed(String),
    /// Answer every call with the same tool request.
    RepeatToolUse(ToolCall),
}

/// Deterministic provider for tests and offline runs: no network, canned
/// completions.
pub struct MockProvider {
    mode: MockMode,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn scripted(script: Vec<Result<Completion, ProviderError>>) -> Self {
        Self {
            mode: MockMode::Script(Mutex::new(script.into())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn text(reply: impl Into<String>) -> Self {
        Self {
            mode: MockMode::Fixed(reply.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always_tool_use(call: ToolCall) -> Self {
        Self {
            mode: MockMode::RepeatToolUse(call),
            calls: AtomicUsize::new(0),
        }
    }

    /// How many round-trips were made.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, _request: ChatRequest<'_>) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            MockMode::Script(script) => script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::malformed("mock", "script exhausted"))),
            MockMode::Fixed(reply) => Ok(Completion::Text {
                content: reply.clone(),
                tokens_used: Some(10),
            }),
            MockMode::RepeatToolUse(call) => Ok(Completion::ToolUse {
                calls: vec![call.clone()],
                tokens_used: Some(5),
            }),
        }
    }
}
