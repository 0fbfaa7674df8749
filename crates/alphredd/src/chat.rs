//! Chat path: one user message in, one reply out.
//!
//! The chat process owns its own registry with the chat skill active.
//! Requests are serialized on that registry, so provider sessions are never
//! used by two conversations at once.

use std::sync::Arc;
use std::time::Duration;

use alphred_core::{ChatMessage, Config};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::llm::{ChatModel, Completion, LlmError};
use crate::memory::{MemoryStore, AI_ROLE, USER_ROLE};
use crate::registry::CapabilityRegistry;
use crate::router::ToolRouter;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("chat skill '{0}' is not registered")]
    UnknownSkill(String),
    #[error("llm request failed: {0}")]
    Llm(#[from] LlmError),
    #[error("llm request timed out after {0:?}")]
    LlmTimeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub reply: String,
    pub long_term_searched: bool,
    pub tools_used: Vec<String>,
}

pub struct ChatService {
    model: Arc<dyn ChatModel>,
    memory: Arc<dyn MemoryStore>,
    registry: Mutex<CapabilityRegistry>,
    skill: String,
    recent_limit: usize,
    llm_timeout: Duration,
}

impl std::fmt::Debug for ChatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatService")
            .field("model", &self.model.name())
            .field("skill", &self.skill)
            .finish_non_exhaustive()
    }
}

impl ChatService {
    pub fn new(
        model: Arc<dyn ChatModel>,
        memory: Arc<dyn MemoryStore>,
        registry: CapabilityRegistry,
        config: &Config,
    ) -> Self {
        Self {
            model,
            memory,
            registry: Mutex::new(registry),
            skill: config.chat_skill.clone(),
            recent_limit: config.memory_recent_limit,
            llm_timeout: config.llm_timeout(),
        }
    }

    pub async fn respond(&self, message: &str) -> Result<ChatReply, ChatError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let context = match self.memory.retrieve_context(message).await {
            Ok(context) => context,
            Err(err) => {
                warn!(error = %err, "long-term memory lookup failed");
                String::new()
            }
        };

        let mut registry = self.registry.lock().await;
        let is_active = registry.active().is_some_and(|s| s.name == self.skill);
        if !is_active && !registry.activate(&self.skill).await {
            return Err(ChatError::UnknownSkill(self.skill.clone()));
        }

        let mut system = registry
            .active()
            .map(|s| s.prompt.clone())
            .unwrap_or_default();
        if !context.is_empty() {
            system.push_str("\n\n");
            system.push_str(&context);
        }

        let mut messages = vec![ChatMessage::system(system)];
        for entry in self.memory.recent(self.recent_limit).await {
            messages.push(if entry.role == USER_ROLE {
                ChatMessage::user(entry.content)
            } else {
                ChatMessage::assistant(Some(entry.content), Vec::new())
            });
        }
        messages.push(ChatMessage::user(message));

        let mut router = ToolRouter::new(&mut registry);
        let tools = router.catalog().await;
        let first = self.complete(&messages, &tools).await?;

        let mut tools_used = Vec::new();
        let reply = if first.tool_calls.is_empty() {
            first.content.unwrap_or_default()
        } else {
            messages.push(first.to_message());
            for call in &first.tool_calls {
                tools_used.push(call.name.clone());
                let text = match call.parse_arguments() {
                    Ok(args) => router.dispatch(&call.name, &args).await.to_text(),
                    Err(e) => format!("Error: malformed arguments for '{}': {e}", call.name),
                };
                messages.push(ChatMessage::tool_result(call, text));
            }
            self.complete(&messages, &[]).await?.content.unwrap_or_default()
        };
        drop(registry);

        for (role, content) in [(USER_ROLE, message), (AI_ROLE, reply.as_str())] {
            if let Err(err) = self.memory.store(role, content).await {
                warn!(role, error = %err, "failed to store memory");
            }
        }

        info!(tools = tools_used.len(), long_term = !context.is_empty(), "chat reply sent");
        Ok(ChatReply {
            reply,
            long_term_searched: !context.is_empty(),
            tools_used,
        })
    }

    /// Close the chat skill's provider sessions.
    pub async fn shutdown(&self) {
        self.registry.lock().await.shutdown().await;
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[alphred_core::ToolSpec],
    ) -> Result<Completion, ChatError> {
        tokio::time::timeout(self.llm_timeout, self.model.complete(messages, tools))
            .await
            .map_err(|_| ChatError::LlmTimeout(self.llm_timeout))?
            .map_err(ChatError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::{tool_call, ScriptedModel};
    use crate::memory::SqliteMemory;
    use crate::session::SessionConfig;
    use crate::skills::{builtin_skills, BuiltinDeps};
    use crate::storage::tests::{create_test_storage, TestStorage};
    use alphred_core::{Role, TaskStatus};

    async fn service(ts: &TestStorage, model: Arc<ScriptedModel>) -> ChatService {
        let mut registry = CapabilityRegistry::new(SessionConfig::default());
        registry.load(
            builtin_skills(&BuiltinDeps {
                storage: Arc::clone(&ts.storage),
            }),
            &[],
        );
        let memory = SqliteMemory::load(Arc::clone(&ts.storage), 50, 5).await.unwrap();
        ChatService::new(model, Arc::new(memory), registry, &Config::default())
    }

    #[tokio::test]
    async fn plain_reply_is_stored_in_memory() {
        let ts = create_test_storage().await;
        let model = Arc::new(ScriptedModel::new(vec![Completion::text("Hello!")]));
        let chat = service(&ts, Arc::clone(&model)).await;

        let reply = chat.respond("  hi there  ").await.unwrap();
        assert_eq!(reply.reply, "Hello!");
        assert!(reply.tools_used.is_empty());
        assert!(!reply.long_term_searched);

        let request = &model.requests()[0];
        assert!(request.messages[0]
            .content
            .as_deref()
            .unwrap()
            .starts_with("You are a Concierge Agent."));
        assert_eq!(request.tools.len(), 2);

        let stored = ts.storage.recent_memories(10).await.unwrap();
        let pairs: Vec<_> = stored.iter().map(|m| (m.role.as_str(), m.content.as_str())).collect();
        assert_eq!(pairs, vec![("User", "hi there"), ("AI", "Hello!")]);
    }

    #[tokio::test]
    async fn one_tool_round_then_final_answer_without_tools() {
        let ts = create_test_storage().await;
        let model = Arc::new(ScriptedModel::new(vec![
            Completion::with_tool_calls(vec![tool_call(
                "call_1",
                "create_task",
                r#"{"title":"Draft report","description":"Quarterly numbers"}"#,
            )]),
            Completion::text("I've delegated that."),
        ]));
        let chat = service(&ts, Arc::clone(&model)).await;

        let reply = chat.respond("please draft the quarterly report").await.unwrap();
        assert_eq!(reply.reply, "I've delegated that.");
        assert_eq!(reply.tools_used, vec!["create_task"]);

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].tools.is_empty());
        let tool_msg = requests[1].messages.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert!(tool_msg
            .content
            .as_deref()
            .unwrap()
            .starts_with("Task created successfully. ID: "));

        let tasks = ts
            .storage
            .list_tasks(Some(TaskStatus::Pending), 10)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "Draft report");
    }

    #[tokio::test]
    async fn recent_conversation_and_context_are_included() {
        let ts = create_test_storage().await;
        let model = Arc::new(ScriptedModel::new(vec![
            Completion::text("Noted."),
            Completion::text("On Friday."),
        ]));
        let chat = service(&ts, Arc::clone(&model)).await;

        chat.respond("my dentist appointment is friday").await.unwrap();
        let reply = chat.respond("when is my dentist appointment").await.unwrap();
        assert_eq!(reply.reply, "On Friday.");
        assert!(reply.long_term_searched);

        let second = &model.requests()[1].messages;
        assert!(second[0]
            .content
            .as_deref()
            .unwrap()
            .contains("User: my dentist appointment is friday"));
        // system, previous user, previous assistant, new user.
        assert_eq!(second.len(), 4);
        assert_eq!(second[1].role, Role::User);
        assert_eq!(second[2].role, Role::Assistant);
        assert_eq!(second[2].content.as_deref(), Some("Noted."));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let ts = create_test_storage().await;
        let chat = service(&ts, Arc::new(ScriptedModel::new(Vec::new()))).await;
        assert!(matches!(chat.respond("   ").await, Err(ChatError::EmptyMessage)));
    }

    #[tokio::test]
    async fn llm_failure_is_an_error() {
        let ts = create_test_storage().await;
        let model = Arc::new(ScriptedModel::new(Vec::new()).then_error("rate limited"));
        let chat = service(&ts, model).await;
        let err = chat.respond("hello").await.unwrap_err();
        assert!(matches!(err, ChatError::Llm(_)));
        assert!(ts.storage.recent_memories(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unresponsive_llm_times_out() {
        let ts = create_test_storage().await;
        let mut registry = CapabilityRegistry::new(SessionConfig::default());
        registry.load(
            builtin_skills(&BuiltinDeps {
                storage: Arc::clone(&ts.storage),
            }),
            &[],
        );
        let memory = SqliteMemory::load(Arc::clone(&ts.storage), 50, 5).await.unwrap();
        let config = Config {
            llm_timeout_sec: 1,
            ..Config::default()
        };
        let chat = ChatService::new(
            Arc::new(ScriptedModel::hanging()),
            Arc::new(memory),
            registry,
            &config,
        );

        let result = tokio::time::timeout(Duration::from_secs(10), chat.respond("hello"))
            .await
            .expect("chat hung past the llm deadline");
        assert!(matches!(result, Err(ChatError::LlmTimeout(d)) if d == Duration::from_secs(1)));
        assert!(ts.storage.recent_memories(10).await.unwrap().is_empty());
    }
}
