//! alphredd - personal assistant daemon
//!
//! Two processes share one SQLite database: `serve` answers chat and task
//! requests over HTTP, and `worker` polls for delegated tasks and runs them
//! with the worker skill's tools.

pub mod chat;
pub mod dispatcher;
pub mod executor;
pub mod llm;
pub mod memory;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod skills;
pub mod storage;

use std::sync::Arc;

use alphred_core::Config;
use chat::ChatService;
use dispatcher::{PollingDispatcher, StatsSnapshot, TaskQueue};
use executor::{ExecutorConfig, TaskExecutor};
use llm::{ChatModel, OpenAiCompatModel};
use memory::SqliteMemory;
use registry::CapabilityRegistry;
use server::AppState;
use session::SessionConfig;
use skills::{builtin_skills, BuiltinDeps};
use storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Environment variable holding the HTTP API token.
pub const AUTH_TOKEN_ENV: &str = "ALPHRED_AUTH_TOKEN";

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Storage(#[from] storage::StorageError),
    #[error(transparent)]
    Memory(#[from] memory::MemoryError),
    #[error(transparent)]
    Llm(#[from] llm::LlmError),
    #[error("http server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Daemon state shared by both process roles.
pub struct Daemon {
    config: Config,
    storage: Arc<Storage>,
    model: Arc<dyn ChatModel>,
}

impl Daemon {
    /// Open the database, apply migrations and build the LLM client.
    pub async fn new(config: Config) -> Result<Self, DaemonError> {
        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;
        let model = OpenAiCompatModel::from_config(&config)?;

        Ok(Self {
            config,
            storage: Arc::new(storage),
            model: Arc::new(model),
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// A fresh registry holding the built-in skills and every discovered manifest.
    fn build_registry(&self) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new(SessionConfig::from_config(&self.config));
        let report = registry.load(
            builtin_skills(&BuiltinDeps {
                storage: Arc::clone(&self.storage),
            }),
            &self.config.skills_dirs,
        );
        for err in &report.errors {
            warn!(path = %err.path.display(), error = %err.error, "skipped skill manifest");
        }
        registry
    }

    /// Run the chat/HTTP process until `cancel` fires.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), DaemonError> {
        let memory = SqliteMemory::load(
            Arc::clone(&self.storage),
            self.config.memory_recent_limit,
            self.config.memory_top_k,
        )
        .await?;
        let chat = Arc::new(ChatService::new(
            Arc::clone(&self.model),
            Arc::new(memory),
            self.build_registry(),
            &self.config,
        ));

        let auth_token = std::env::var(AUTH_TOKEN_ENV).ok().filter(|t| !t.is_empty());
        info!(
            port = self.config.port,
            db = %self.config.db_path.display(),
            model = %self.config.model,
            skill = %self.config.chat_skill,
            auth = auth_token.is_some(),
            "alphredd serve starting"
        );

        let state = Arc::new(AppState {
            storage: Arc::clone(&self.storage),
            chat: Arc::clone(&chat),
            auth_token,
        });
        let result = server::start_server(state, self.config.port, cancel).await;
        chat.shutdown().await;
        result.map_err(DaemonError::from)
    }

    /// Run the task worker until `cancel` fires.
    pub async fn run_worker(&self, cancel: CancellationToken) -> StatsSnapshot {
        let queue: Arc<dyn TaskQueue> = Arc::clone(&self.storage) as Arc<dyn TaskQueue>;
        let executor = TaskExecutor::new(
            Arc::clone(&self.model),
            Arc::clone(&queue),
            ExecutorConfig::from_config(&self.config),
        );
        info!(
            db = %self.config.db_path.display(),
            model = %self.config.model,
            skill = %self.config.worker_skill,
            "alphredd worker starting"
        );

        PollingDispatcher::new(
            queue,
            executor,
            self.build_registry(),
            self.config.poll_interval(),
            self.config.task_lease(),
            self.config.worker_skill.clone(),
        )
        .run(cancel)
        .await
    }
}
