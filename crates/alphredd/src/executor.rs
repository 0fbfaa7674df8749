//! Task executor: the bounded tool-calling loop for one delegated task.
//!
//! The executor borrows a registry for the duration of one task, activates
//! the worker skill, and alternates completions with sequential tool dispatch
//! until the model answers without tool calls or the turn budget runs out.
//! The terminal write goes through [`TaskQueue::finish`], which only accepts
//! IN_PROGRESS tasks.

use std::sync::Arc;
use std::time::Duration;

use alphred_core::events::{
    EventPayload, TaskCompletedPayload, TaskFailedPayload, ToolDispatchedPayload,
    TurnStartedPayload,
};
use alphred_core::{ChatMessage, Config, Task, TaskStatus};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{QueueError, TaskQueue};
use crate::llm::{ChatModel, LlmError};
use crate::registry::CapabilityRegistry;
use crate::router::ToolRouter;
use crate::session::InvokeOutcome;
use crate::storage::StorageError;

const WORKER_PROMPT: &str = "You are the Worker Agent for Alphred.\n\
Your job is to execute the following task accurately and efficiently using available tools.\n\
Report the final result clearly.";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("skill '{0}' is not registered")]
    UnknownSkill(String),
    #[error("llm request failed: {0}")]
    Llm(#[from] LlmError),
    #[error("llm request timed out after {0:?}")]
    LlmTimeout(Duration),
    #[error("malformed arguments for tool '{tool}': {error}")]
    MalformedArguments { tool: String, error: String },
    #[error("tool provider for '{tool}' crashed: {reason}")]
    ProviderLost { tool: String, reason: String },
    #[error("max turns ({0}) reached without a final answer")]
    MaxTurns(u32),
    #[error("task is no longer in progress")]
    TaskLost,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Skill activated for every task.
    pub skill: String,
    pub max_turns: u32,
    pub llm_timeout: Duration,
    pub lease: Duration,
}

impl ExecutorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            skill: config.worker_skill.clone(),
            max_turns: config.max_turns,
            llm_timeout: config.llm_timeout(),
            lease: config.task_lease(),
        }
    }
}

/// How one task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub result: String,
    /// Completion requests issued.
    pub turns: u32,
    /// Whether the terminal write was applied.
    pub recorded: bool,
}

pub struct TaskExecutor {
    model: Arc<dyn ChatModel>,
    queue: Arc<dyn TaskQueue>,
    config: ExecutorConfig,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("model", &self.model.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TaskExecutor {
    pub fn new(model: Arc<dyn ChatModel>, queue: Arc<dyn TaskQueue>, config: ExecutorConfig) -> Self {
        Self {
            model,
            queue,
            config,
        }
    }

    /// Run a claimed (IN_PROGRESS) task to a terminal state.
    ///
    /// Every failure inside the loop becomes a FAILED task; nothing propagates.
    pub async fn execute(&self, task: &Task, registry: &mut CapabilityRegistry) -> TaskOutcome {
        info!(task_id = %task.id, title = %task.title, skill = %self.config.skill, "executing task");

        let mut turns = 0;
        let (status, result) = match self.run_loop(task, registry, &mut turns).await {
            Ok(answer) => (TaskStatus::Completed, answer),
            Err(err) => {
                warn!(task_id = %task.id, turns, error = %err, "task failed");
                (TaskStatus::Failed, err.to_string())
            }
        };

        let recorded = self.finish(task, status, &result).await;
        let payload = match status {
            TaskStatus::Completed => EventPayload::TaskCompleted(TaskCompletedPayload { turns }),
            _ => EventPayload::TaskFailed(TaskFailedPayload {
                reason: result.clone(),
            }),
        };
        self.record(task, &payload).await;

        TaskOutcome {
            status,
            result,
            turns,
            recorded,
        }
    }

    /// Terminal write. Returns whether the store accepted it.
    pub(crate) async fn finish(&self, task: &Task, status: TaskStatus, result: &str) -> bool {
        match self.queue.finish(&task.id, status, result).await {
            Ok(true) => {
                info!(task_id = %task.id, status = status.as_str(), "task finished");
                true
            }
            Ok(false) => {
                warn!(
                    task_id = %task.id,
                    status = status.as_str(),
                    "task was no longer in progress, terminal write skipped"
                );
                false
            }
            Err(err) => {
                error!(task_id = %task.id, error = %err, "failed to write task result");
                false
            }
        }
    }

    async fn run_loop(
        &self,
        task: &Task,
        registry: &mut CapabilityRegistry,
        turns: &mut u32,
    ) -> Result<String, ExecutorError> {
        if !registry.activate(&self.config.skill).await {
            return Err(ExecutorError::UnknownSkill(self.config.skill.clone()));
        }

        let mut messages = vec![
            ChatMessage::system(WORKER_PROMPT),
            ChatMessage::user(format!("TASK: {}\nDETAILS: {}", task.title, task.description)),
        ];
        let mut router = ToolRouter::new(registry);

        for turn in 1..=self.config.max_turns {
            *turns = turn;
            match self.queue.renew_lease(&task.id, self.config.lease).await {
                Ok(()) => {}
                Err(QueueError::Storage(StorageError::NotInProgress(_))) => {
                    return Err(ExecutorError::TaskLost);
                }
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "failed to renew task lease");
                }
            }

            let tools = router.catalog().await;
            self.record(
                task,
                &EventPayload::TurnStarted(TurnStartedPayload {
                    turn,
                    catalog_size: tools.len(),
                }),
            )
            .await;
            debug!(task_id = %task.id, turn, tools = tools.len(), "requesting completion");

            let completion = tokio::time::timeout(
                self.config.llm_timeout,
                self.model.complete(&messages, &tools),
            )
            .await
            .map_err(|_| ExecutorError::LlmTimeout(self.config.llm_timeout))??;

            messages.push(completion.to_message());
            if completion.tool_calls.is_empty() {
                return Ok(completion.content.unwrap_or_default());
            }

            // Sequential: later calls may depend on earlier ones.
            for call in &completion.tool_calls {
                let args = call
                    .parse_arguments()
                    .map_err(|e| ExecutorError::MalformedArguments {
                        tool: call.name.clone(),
                        error: e.to_string(),
                    })?;

                let outcome = router.dispatch(&call.name, &args).await;
                debug!(task_id = %task.id, turn, tool = %call.name, outcome = outcome.kind(), "tool dispatched");
                self.record(
                    task,
                    &EventPayload::ToolDispatched(ToolDispatchedPayload {
                        turn,
                        tool: call.name.clone(),
                        outcome: outcome.kind().to_string(),
                    }),
                )
                .await;

                if let InvokeOutcome::ProviderLost(reason) = outcome {
                    return Err(ExecutorError::ProviderLost {
                        tool: call.name.clone(),
                        reason,
                    });
                }
                messages.push(ChatMessage::tool_result(call, outcome.to_text()));
            }
        }

        Err(ExecutorError::MaxTurns(self.config.max_turns))
    }

    async fn record(&self, task: &Task, payload: &EventPayload) {
        if let Err(err) = self.queue.record(&task.id, payload).await {
            warn!(task_id = %task.id, event = payload.event_type().as_str(), error = %err, "failed to record task event");
        }
    }
}
