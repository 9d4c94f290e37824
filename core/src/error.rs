use crate::traits::{ProviderError, StoreError};
use thiserror::Error;

/// Errors crossing the orchestrator boundary. Tool failures never appear
/// here; they are folded into the conversation as tool-result messages.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("access denied due to suspicious activity")]
    Blocked,

    #[error("not found")]
    NotFound,

    #[error("access denied")]
    Forbidden,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Persistence(#[from] StoreError),
}

impl ChatError {
    /// Text safe to show the end user. Upstream failure detail stays in the
    /// logs; only the generic phrasing crosses the boundary.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Validation(_) => "Invalid message content or length",
            Self::RateLimited => "Rate limit exceeded. Please try again later.",
            Self::Blocked => "Access denied due to suspicious activity",
            Self::NotFound => "Session not found",
            Self::Forbidden => "Access denied",
            Self::Provider(_) => "The assistant is temporarily unavailable. Please try again later.",
            Self::Persistence(_) => {
                "I apologize, but I'm experiencing technical difficulties. Please try again later."
            }
        }
    }
}
