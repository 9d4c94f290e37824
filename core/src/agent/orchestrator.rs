use crate::agent::{ContextBuilder, ToolRegistry};
use crate::config::LimitsConfig;
use crate::error::ChatError;
use crate::security::{self, SecurityGate, SecurityStats};
use crate::traits::{
    ChatMessage, ChatRequest, Completion, ContextStore, Message, NewMessage, Provider,
    ProviderError, Role, Session, StoreError, ToolCall, ToolSpec,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RETRY_BACKOFF_MS: u64 = 500;
const FALLBACK_REPLY: &str =
    "I'm sorry, I was unable to complete the request within the allowed number of tool steps.";

/// The result of one successful turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub session_id: String,
    pub tokens_used: Option<u32>,
    pub tool_calls: Vec<ToolCall>,
    pub user_message_at: DateTime<Utc>,
    pub assistant_message_at: DateTime<Utc>,
}

/// Drives a turn through its states: admission, context loading, model
/// round-trips with tool execution in between, then one atomic persist.
///
/// Turns on the same session are serialized by a per-session lock held from
/// context loading through persistence; turns on different sessions share
/// nothing but the security gate's counters.
pub struct Orchestrator {
    provider: Arc<dyn Provider>,
    store: Arc<dyn ContextStore>,
    registry: Arc<ToolRegistry>,
    gate: Arc<SecurityGate>,
    context_builder: ContextBuilder,
    limits: LimitsConfig,
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<dyn ContextStore>,
        registry: Arc<ToolRegistry>,
        gate: Arc<SecurityGate>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            provider,
            store,
            registry,
            gate,
            context_builder: ContextBuilder::new(limits.context_window_budget_tokens),
            limits,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// One full turn: the caller gets the final assistant text, or a typed
    /// error with nothing persisted.
    pub async fn submit_message(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        text: &str,
        ip: Option<&str>,
    ) -> Result<TurnOutcome, ChatError> {
        let sanitized = self.gate.admit(user_id, ip, text)?;

        let session = self.resolve_session(user_id, session_id).await?;
        let lock = self.session_lock(&session.id);
        let _guard = lock.lock().await;

        let history = self
            .store
            .get_messages(&session.id, Some(self.limits.history_limit), None)
            .await?;
        let context = self.store.get_context(&session.id).await?;
        let wire_history = wire_history(&history);

        let specs = self.registry.specs();
        let mut wire =
            self.context_builder
                .build_messages(context.as_ref(), &wire_history, &sanitized);
        let mut persist = vec![NewMessage::new(Role::User, sanitized.clone())];
        let mut all_calls: Vec<ToolCall> = Vec::new();
        let mut total_tokens: Option<u32> = None;
        let mut round_trips = 0;

        let reply = loop {
            if round_trips >= self.limits.max_tool_round_trips {
                warn!(session = %session.id, cap = self.limits.max_tool_round_trips,
                    "Tool round-trip cap reached, synthesizing fallback reply");
                break FALLBACK_REPLY.to_string();
            }
            round_trips += 1;

            let completion = self.model_round_trip(&wire, &specs).await?;
            total_tokens = add_tokens(total_tokens, completion.tokens_used());

            match completion {
                Completion::Text { content, .. } => break content,
                Completion::ToolUse { calls, .. } => {
                    debug!(session = %session.id, count = calls.len(), "Model requested tools");
                    wire.push(ChatMessage::assistant_with_tool_calls("", calls.clone()));
                    persist.push(NewMessage::new(Role::Assistant, "").with_tool_calls(calls.clone()));

                    // Sequential: result ordering must be deterministic, and
                    // later calls may depend on earlier results within the
                    // same turn.
                    for call in &calls {
                        let outcome = self.registry.invoke(&call.name, &call.arguments).await;
                        let rendered = outcome.render();
                        wire.push(ChatMessage::tool_result(call.id.clone(), rendered.clone()));
                        persist.push(NewMessage::new(Role::Tool, rendered));
                    }
                    all_calls.extend(calls);
                }
            }
        };

        persist.push(NewMessage::new(Role::Assistant, reply.clone()).with_tokens(total_tokens));
        let stored = self.store.append_turn(&session.id, persist).await?;

        info!(session = %session.id, round_trips, tokens = ?total_tokens, "Turn persisted");
        Ok(TurnOutcome {
            reply,
            session_id: session.id,
            tokens_used: total_tokens,
            tool_calls: all_calls,
            user_message_at: stored.first().map(|m| m.created_at).unwrap_or_else(Utc::now),
            assistant_message_at: stored.last().map(|m| m.created_at).unwrap_or_else(Utc::now),
        })
    }

    pub async fn create_session(
        &self,
        user_id: &str,
        title: Option<String>,
    ) -> Result<Session, ChatError> {
        Ok(self.store.create_session(user_id, title).await?)
    }

    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>, ChatError> {
        Ok(self.store.list_sessions(user_id).await?)
    }

    /// Transcript access with an ownership check.
    pub async fn session_messages(
        &self,
        user_id: &str,
        session_id: &str,
        limit: Option<usize>,
        before: Option<i64>,
    ) -> Result<Vec<Message>, ChatError> {
        let session = self.owned_session(user_id, session_id).await?;
        self.store
            .get_messages(&session.id, limit, before)
            .await
            .map_err(ChatError::from)
    }

    pub async fn delete_session(&self, user_id: &str, session_id: &str) -> Result<(), ChatError> {
        if Uuid::parse_str(session_id).is_err() {
            return Err(ChatError::Validation(
                "invalid session identifier".to_string(),
            ));
        }
        let session = self.owned_session(user_id, session_id).await?;
        match self.store.delete_session(&session.id).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound) => Err(ChatError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the session's conversation context. String values are
    /// sanitized before they are persisted or ever injected into a prompt.
    pub async fn update_context(
        &self,
        user_id: &str,
        session_id: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), ChatError> {
        let session = self.owned_session(user_id, session_id).await?;
        let clean = security::sanitize_context(&data);
        self.store.upsert_context(&session.id, clean).await?;
        Ok(())
    }

    pub fn security_stats(&self) -> SecurityStats {
        self.gate.stats()
    }

    /// Periodic maintenance: prunes idle security windows and tombstones
    /// sessions idle past the configured timeout.
    pub async fn cleanup(&self) -> Result<usize, ChatError> {
        self.gate.sweep();
        let closed = self
            .store
            .close_idle_sessions(self.limits.session_idle_timeout_hours * 3600)
            .await?;
        if closed > 0 {
            info!(closed, "Closed idle sessions");
        }
        Ok(closed)
    }

    async fn resolve_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<Session, ChatError> {
        if let Some(id) = session_id
            && let Ok(existing) = self.store.get_session(id).await
            && existing.user_id == user_id
        {
            return Ok(existing);
        }
        Ok(self.store.create_session(user_id, None).await?)
    }

    async fn owned_session(&self, user_id: &str, session_id: &str) -> Result<Session, ChatError> {
        let session = match self.store.get_session(session_id).await {
            Ok(session) => session,
            Err(StoreError::NotFound) => return Err(ChatError::NotFound),
            Err(e) => return Err(e.into()),
        };
        if session.user_id != user_id {
            return Err(ChatError::Forbidden);
        }
        Ok(session)
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.session_locks.lock().unwrap();
        locks.entry(session_id.to_string()).or_default().clone()
    }

    async fn model_round_trip(
        &self,
        messages: &[ChatMessage],
        specs: &[ToolSpec],
    ) -> Result<Completion, ChatError> {
        let request = ChatRequest {
            messages,
            tools: if specs.is_empty() { None } else { Some(specs) },
        };

        match self.timed_complete(request).await {
            Ok(completion) => Ok(completion),
            Err(e @ ProviderError::RateLimited { .. }) => {
                warn!(error = %e, "Provider rate limited, retrying once");
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
                self.timed_complete(request).await.map_err(|e| {
                    error!(error = %e, "Model round trip failed after retry");
                    ChatError::from(e)
                })
            }
            Err(e) => {
                error!(error = %e, "Model round trip failed");
                Err(e.into())
            }
        }
    }

    async fn timed_complete(&self, request: ChatRequest<'_>) -> Result<Completion, ProviderError> {
        let timeout = Duration::from_secs(self.limits.model_round_trip_timeout_secs);
        match tokio::time::timeout(timeout, self.provider.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::unavailable(
                self.provider.name(),
                "round trip timed out",
            )),
        }
    }
}

/// Persisted transcript entries replayed to the model. Tool scaffolding
/// (assistant tool requests, tool results) is intra-turn state and is not
/// replayed; only the user/assistant exchange is.
fn wire_history(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .filter(|m| {
            matches!(m.role, Role::User | Role::Assistant)
                && m.tool_calls.is_none()
                && !m.content.is_empty()
        })
        .map(|m| ChatMessage {
            role: m.role,
            content: m.content.clone(),
            tool_calls: None,
            tool_call_id: None,
        })
        .collect()
}

fn add_tokens(total: Option<u32>, step: Option<u32>) -> Option<u32> {
    match (total, step) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::providers::MockProvider;
    use crate::store::MemoryStore;
    use crate::tools::CalculatorTool;

    fn calc_call(expression: &str) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: "calculate".to_string(),
            arguments: serde_json::json!({"expression": expression}),
        }
    }

    fn orchestrator_with(provider: Arc<MockProvider>) -> (Arc<Orchestrator>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ToolRegistry::new(Duration::from_secs(5)));
        registry.register(Box::new(CalculatorTool));
        let gate = Arc::new(SecurityGate::new(SecurityConfig::default()));
        let orchestrator = Arc::new(Orchestrator::new(
            provider,
            store.clone(),
            registry,
            gate,
            LimitsConfig::default(),
        ));
        (orchestrator, store)
    }

    #[tokio::test]
    async fn tool_round_trip_produces_ordered_transcript() {
        let provider = Arc::new(MockProvider::scripted(vec![
            Ok(Completion::ToolUse {
                calls: vec![calc_call("2+2")],
                tokens_used: Some(5),
            }),
            Ok(Completion::Text {
                content: "4".to_string(),
                tokens_used: Some(10),
            }),
        ]));
        let (orchestrator, store) = orchestrator_with(provider);

        let outcome = orchestrator
            .submit_message("u1", None, "what is 2+2?", None)
            .await
            .unwrap();

        assert_eq!(outcome.reply, "4");
        assert_eq!(outcome.tokens_used, Some(15));
        assert_eq!(outcome.tool_calls.len(), 1);

        let messages = store
            .get_messages(&outcome.session_id, None, None)
            .await
            .unwrap();
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, [Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(messages[0].content, "what is 2+2?");
        assert!(messages[1].tool_calls.is_some());
        assert_eq!(messages[2].content, "Calculation: 2+2 = 4");
        assert_eq!(messages[3].content, "4");
        assert_eq!(messages[3].tokens_used, Some(15));
    }

    #[tokio::test]
    async fn round_trip_cap_forces_fallback_reply() {
        let provider = Arc::new(MockProvider::always_tool_use(calc_call("1+1")));
        let (orchestrator, store) = orchestrator_with(provider.clone());

        let outcome = orchestrator
            .submit_message("u1", None, "loop forever", None)
            .await
            .unwrap();

        assert!(outcome.reply.contains("unable to complete"));
        assert_eq!(provider.calls(), LimitsConfig::default().max_tool_round_trips);

        // user + cap * (assistant request + tool result) + final assistant
        let messages = store
            .get_messages(&outcome.session_id, None, None)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2 + 2 * LimitsConfig::default().max_tool_round_trips);
        assert_eq!(messages.last().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn gate_rejection_persists_nothing() {
        let provider = Arc::new(MockProvider::text("unused"));
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ToolRegistry::new(Duration::from_secs(5)));
        let gate = Arc::new(SecurityGate::new(SecurityConfig {
            max_message_length: 5,
            ..SecurityConfig::default()
        }));
        let orchestrator = Orchestrator::new(
            provider,
            store.clone(),
            registry,
            gate,
            LimitsConfig::default(),
        );

        let result = orchestrator
            .submit_message("u1", None, "much too long for the gate", None)
            .await;
        assert!(matches!(result, Err(ChatError::Validation(_))));
        assert!(store.list_sessions("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_aborts_without_persisting_the_turn() {
        let provider = Arc::new(MockProvider::scripted(vec![Err(
            ProviderError::unavailable("mock", "down"),
        )]));
        let (orchestrator, store) = orchestrator_with(provider.clone());
        let session = store.create_session("u1", None).await.unwrap();

        let result = orchestrator
            .submit_message("u1", Some(&session.id), "hello", None)
            .await;
        assert!(matches!(result, Err(ChatError::Provider(_))));
        assert_eq!(provider.calls(), 1);
        assert!(store.get_messages(&session.id, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rate_limited_provider_is_retried_once() {
        let provider = Arc::new(MockProvider::scripted(vec![
            Err(ProviderError::rate_limited("mock", "slow down")),
            Ok(Completion::Text {
                content: "hi".to_string(),
                tokens_used: None,
            }),
        ]));
        let (orchestrator, _) = orchestrator_with(provider.clone());

        let outcome = orchestrator
            .submit_message("u1", None, "hello", None)
            .await
            .unwrap();
        assert_eq!(outcome.reply, "hi");
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn unavailable_provider_is_not_retried() {
        let provider = Arc::new(MockProvider::scripted(vec![
            Err(ProviderError::unavailable("mock", "down")),
            Ok(Completion::Text {
                content: "never".to_string(),
                tokens_used: None,
            }),
        ]));
        let (orchestrator, _) = orchestrator_with(provider.clone());

        assert!(orchestrator
            .submit_message("u1", None, "hello", None)
            .await
            .is_err());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_session_serialize() {
        let provider = Arc::new(MockProvider::scripted(vec![
            Ok(Completion::Text {
                content: "first".to_string(),
                tokens_used: None,
            }),
            Ok(Completion::Text {
                content: "second".to_string(),
                tokens_used: None,
            }),
        ]));
        let (orchestrator, store) = orchestrator_with(provider);
        let session = store.create_session("u1", None).await.unwrap();

        let a = orchestrator.submit_message("u1", Some(&session.id), "one", None);
        let b = orchestrator.submit_message("u1", Some(&session.id), "two", None);
        let (a, b) = tokio::join!(a, b);
        a.unwrap();
        b.unwrap();

        let messages = store.get_messages(&session.id, None, None).await.unwrap();
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        // Two complete turns, never interleaved.
        assert_eq!(
            roles,
            [Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
    }

    #[tokio::test]
    async fn failed_tool_becomes_conversation_data_not_an_error() {
        let provider = Arc::new(MockProvider::scripted(vec![
            Ok(Completion::ToolUse {
                calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    name: "no_such_tool".to_string(),
                    arguments: serde_json::json!({}),
                }],
                tokens_used: None,
            }),
            Ok(Completion::Text {
                content: "recovered".to_string(),
                tokens_used: None,
            }),
        ]));
        let (orchestrator, store) = orchestrator_with(provider);

        let outcome = orchestrator
            .submit_message("u1", None, "try a tool", None)
            .await
            .unwrap();
        assert_eq!(outcome.reply, "recovered");

        let messages = store
            .get_messages(&outcome.session_id, None, None)
            .await
            .unwrap();
        assert!(messages[2].content.starts_with("tool failed: "));
    }

    #[tokio::test]
    async fn ownership_is_enforced_on_reads_and_deletes() {
        let provider = Arc::new(MockProvider::text("hi"));
        let (orchestrator, store) = orchestrator_with(provider);
        let session = store.create_session("u1", None).await.unwrap();

        assert!(matches!(
            orchestrator
                .session_messages("intruder", &session.id, None, None)
                .await,
            Err(ChatError::Forbidden)
        ));
        assert!(matches!(
            orchestrator.delete_session("intruder", &session.id).await,
            Err(ChatError::Forbidden)
        ));

        orchestrator.delete_session("u1", &session.id).await.unwrap();
        assert!(matches!(
            orchestrator
                .session_messages("u1", &session.id, None, None)
                .await,
            Err(ChatError::NotFound)
        ));
    }

    #[tokio::test]
    async fn malformed_session_id_fails_validation_on_delete() {
        let provider = Arc::new(MockProvider::text("hi"));
        let (orchestrator, _) = orchestrator_with(provider);
        assert!(matches!(
            orchestrator.delete_session("u1", "not-a-uuid").await,
            Err(ChatError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn foreign_session_id_starts_a_fresh_session() {
        let provider = Arc::new(MockProvider::text("hi"));
        let (orchestrator, store) = orchestrator_with(provider);
        let foreign = store.create_session("someone_else", None).await.unwrap();

        let outcome = orchestrator
            .submit_message("u1", Some(&foreign.id), "hello", None)
            .await
            .unwrap();
        assert_ne!(outcome.session_id, foreign.id);
        assert!(store.get_messages(&foreign.id, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn context_update_sanitizes_before_persisting() {
        let provider = Arc::new(MockProvider::text("hi"));
        let (orchestrator, store) = orchestrator_with(provider);
        let session = store.create_session("u1", None).await.unwrap();

        let mut data = serde_json::Map::new();
        data.insert(
            "user_name".to_string(),
            "<script>alert('x')</script>Ada".into(),
        );
        orchestrator
            .update_context("u1", &session.id, data)
            .await
            .unwrap();

        let context = store.get_context(&session.id).await.unwrap().unwrap();
        assert_eq!(context.data["user_name"], "alert('x')Ada");
    }
}
