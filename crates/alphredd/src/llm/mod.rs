//! LLM completion client.
//!
//! [`ChatModel`] is the seam the executor and chat service call through.
//! [`OpenAiCompatModel`] talks to any OpenAI-compatible `/chat/completions`
//! endpoint (a LiteLLM proxy by default) and retries once on a fallback model.

pub mod mock;

use std::time::Duration;

use alphred_core::{ChatMessage, Config, Role, ToolCall, ToolSpec};
use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Environment variable holding the bearer key for the LLM endpoint.
pub const API_KEY_ENV: &str = "ALPHRED_LLM_API_KEY";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// One assistant reply: text, tool calls, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: None,
            tool_calls,
        }
    }

    /// The assistant message to append to the conversation.
    pub fn to_message(&self) -> ChatMessage {
        ChatMessage::assistant(self.content.clone(), self.tool_calls.clone())
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier for logs.
    fn name(&self) -> &str;

    /// Request one completion. `tools` may be empty.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<Completion, LlmError>;
}

/// OpenAI-compatible HTTP client with an optional fallback model.
#[derive(Debug, Clone)]
pub struct OpenAiCompatModel {
    chat_url: String,
    model: String,
    fallback_model: Option<String>,
    api_key: Option<String>,
    /// Shared by the primary attempt and the fallback attempt.
    deadline: Option<Duration>,
    client: reqwest::Client,
}

impl OpenAiCompatModel {
    pub fn new(base_url: &str, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            chat_url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            fallback_model: None,
            api_key,
            deadline: None,
            client: reqwest::Client::new(),
        }
    }

    /// Build from config, reading the key from [`API_KEY_ENV`].
    pub fn from_config(config: &Config) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.llm_timeout())
            .build()?;
        Ok(Self {
            client,
            fallback_model: config.fallback_model.clone(),
            deadline: Some(config.llm_timeout()),
            ..Self::new(
                &config.llm_base_url,
                config.model.clone(),
                std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty()),
            )
        })
    }

    pub fn with_fallback(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }

    /// Total time for one `complete` call, split evenly across its attempts.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn attempt_timeout(&self) -> Option<Duration> {
        let attempts = if self.fallback_model.is_some() { 2 } else { 1 };
        self.deadline.map(|total| total / attempts)
    }

    async fn complete_with(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<Completion, LlmError> {
        let body = request_body(model, messages, tools);
        let mut request = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(timeout) = self.attempt_timeout() {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = response.json().await?;
        parse_completion(&value)
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<Completion, LlmError> {
        debug!(model = %self.model, messages = messages.len(), tools = tools.len(), "requesting completion");
        match self.complete_with(&self.model, messages, tools).await {
            Ok(completion) => Ok(completion),
            Err(err) => {
                let Some(fallback) = &self.fallback_model else {
                    return Err(err);
                };
                warn!(model = %self.model, fallback = %fallback, error = %err, "primary model failed, trying fallback");
                self.complete_with(fallback, messages, tools).await
            }
        }
    }
}

fn request_body(model: &str, messages: &[ChatMessage], tools: &[ToolSpec]) -> Value {
    let mut body = json!({
        "model": model,
        "messages": messages.iter().map(message_to_wire).collect::<Vec<_>>(),
    });
    if !tools.is_empty() {
        body["tools"] = tools.iter().map(ToolSpec::to_function_declaration).collect();
        body["tool_choice"] = json!("auto");
    }
    body
}

fn message_to_wire(message: &ChatMessage) -> Value {
    let mut wire = json!({
        "role": message.role.as_str(),
        "content": message.content,
    });
    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": { "name": call.name, "arguments": call.arguments }
                })
            })
            .collect();
    }
    if message.role == Role::Tool {
        wire["tool_call_id"] = json!(message.tool_call_id);
        if let Some(name) = &message.name {
            wire["name"] = json!(name);
        }
    }
    wire
}

fn parse_completion(value: &Value) -> Result<Completion, LlmError> {
    let message = value
        .pointer("/choices/0/message")
        .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message".to_string()))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .map(|(index, call)| {
                    let function = call.get("function").unwrap_or(&Value::Null);
                    let name = function
                        .get("name")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            LlmError::InvalidResponse(format!("tool call #{index} has no name"))
                        })?;
                    // Some providers send decoded objects instead of strings.
                    let arguments = match function.get("arguments") {
                        Some(Value::String(s)) => s.clone(),
                        Some(Value::Null) | None => String::new(),
                        Some(other) => other.to_string(),
                    };
                    let id = call
                        .get("id")
                        .and_then(Value::as_str)
                        .map_or_else(|| format!("call_{index}"), str::to_string);
                    Ok(ToolCall {
                        id,
                        name: name.to_string(),
                        arguments,
                    })
                })
                .collect::<Result<Vec<_>, LlmError>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(Completion {
        content,
        tool_calls,
    })
}
