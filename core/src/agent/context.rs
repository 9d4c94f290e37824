use crate::traits::{ChatMessage, ConversationContext};

const ESTIMATED_CHARS_PER_TOKEN: usize = 4;

const SYSTEM_PREAMBLE: &str = "You are a helpful AI assistant with access to various tools. You can:
- Perform calculations using the calculate tool
- Search the web for current information using web_search
- Get current time using get_current_time
- Get weather information using weather_search

When a user asks a question that requires using tools, use the appropriate tool and then provide a helpful response based on the tool's output. Always be helpful and informative in your responses.";

/// Assembles the message sequence for a model round-trip: system preamble,
/// condensed conversation context, and as much recent transcript as fits the
/// token budget. The current user message is never dropped.
pub struct ContextBuilder {
    budget_tokens: usize,
}

impl ContextBuilder {
    pub fn new(budget_tokens: usize) -> Self {
        Self { budget_tokens }
    }

    /// Rough estimate, one token per four characters. Good enough for budget
    /// decisions; exact counts come back from the provider.
    pub fn estimate_tokens(text: &str) -> usize {
        text.chars().count().div_ceil(ESTIMATED_CHARS_PER_TOKEN)
    }

    pub fn build_messages(
        &self,
        context: Option<&ConversationContext>,
        history: &[ChatMessage],
        current_message: &str,
    ) -> Vec<ChatMessage> {
        let mut fixed = vec![ChatMessage::system(SYSTEM_PREAMBLE)];
        if let Some(context) = context
            && !context.data.is_empty()
        {
            let payload = serde_json::Value::Object(context.data.clone());
            fixed.push(ChatMessage::system(format!("User context: {payload}")));
        }

        let mut spent: usize = fixed
            .iter()
            .map(|m| Self::estimate_tokens(&m.content))
            .sum::<usize>()
            + Self::estimate_tokens(current_message);

        // Newest-first walk; whatever does not fit falls off the old end.
        let mut kept: Vec<&ChatMessage> = Vec::new();
        for message in history.iter().rev() {
            let cost = Self::estimate_tokens(&message.content);
            if spent + cost > self.budget_tokens {
                break;
            }
            spent += cost;
            kept.push(message);
        }
        kept.reverse();

        let mut messages = fixed;
        messages.extend(kept.into_iter().cloned());
        messages.push(ChatMessage::user(current_message));
        messages
    }
}
