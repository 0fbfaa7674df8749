//! Scripted model for tests.
//!
//! Each `complete` call pops the next scripted reply and records what it was
//! asked, so tests can assert on the exact conversation sent to the model.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use alphred_core::{ChatMessage, ToolCall, ToolSpec};
use async_trait::async_trait;

use super::{ChatModel, Completion, LlmError};

/// A request as seen by [`ScriptedModel`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<Completion, String>>>,
    /// Returned once the script is exhausted.
    repeat: Option<Completion>,
    /// Never answer.
    hang: bool,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Completion>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().map(Ok).collect()),
            repeat: None,
            hang: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A model that answers every request with `completion`.
    pub fn repeating(completion: Completion) -> Self {
        Self {
            repeat: Some(completion),
            ..Self::new(Vec::new())
        }
    }

    /// A model that records each request and then never answers.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new(Vec::new())
        }
    }

    /// Append a failing reply to the script.
    pub fn then_error(self, message: impl Into<String>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(message.into()));
        self
    }

    /// Snapshot of every request received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Shorthand for building a scripted tool call.
pub fn tool_call(id: &str, name: &str, arguments: &str) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<Completion, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedRequest {
                messages: messages.to_vec(),
                tools: tools.to_vec(),
            });
        if self.hang {
            std::future::pending::<()>().await;
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(Ok(completion)) => Ok(completion),
            Some(Err(message)) => Err(LlmError::InvalidResponse(message)),
            None => self
                .repeat
                .clone()
                .ok_or_else(|| LlmError::InvalidResponse("script exhausted".to_string())),
        }
    }
}
