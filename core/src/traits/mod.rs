pub mod provider;
pub mod store;
pub mod tool;

pub use provider::{
    ChatMessage, ChatRequest, Completion, Provider, ProviderError, ProviderEvent, Role, ToolCall,
};
pub use store::{ContextStore, ConversationContext, Message, NewMessage, Session, StoreError};
pub use tool::{Tool, ToolError, ToolSpec};
