//! Built-in skills, selected by name from a compile-time table.

use std::sync::Arc;

use alphred_core::events::{EventPayload, TaskCreatedPayload};
use alphred_core::{Task, TaskStatus, ToolSpec};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{LocalTools, Skill};
use crate::storage::Storage;

pub const GENERAL: &str = "general";
pub const TASK_MANAGER: &str = "task-manager";

/// Rows shown by `list_tasks`.
const LIST_LIMIT: u32 = 10;

const TASK_MANAGER_PROMPT: &str = "You are a Concierge Agent.\n\
Your goal is to understand user requests and create TASKS for the Worker Agent \
if they involve file operations, coding, or complex execution.\n\
- Use 'create_task' to delegate work.\n\
- Use 'list_tasks' to check progress.\n\
- Do NOT try to execute code yourself. Always delegate.";

/// What built-in constructors may depend on.
#[derive(Debug, Clone)]
pub struct BuiltinDeps {
    pub storage: Arc<Storage>,
}

type Constructor = fn(&BuiltinDeps) -> Skill;

/// Built-in skills in registration order.
pub const BUILTIN_SKILLS: &[(&str, Constructor)] =
    &[(GENERAL, general), (TASK_MANAGER, task_manager)];

/// Construct every built-in skill.
pub fn builtin_skills(deps: &BuiltinDeps) -> Vec<Skill> {
    BUILTIN_SKILLS
        .iter()
        .map(|(_, construct)| construct(deps))
        .collect()
}

fn general(_deps: &BuiltinDeps) -> Skill {
    Skill::new(
        GENERAL,
        "General purpose assistant",
        "You are a helpful assistant. Use provided tools when necessary.",
    )
}

fn task_manager(deps: &BuiltinDeps) -> Skill {
    Skill::new(
        TASK_MANAGER,
        "Manages tasks in the task database",
        TASK_MANAGER_PROMPT,
    )
    .with_local_tools(Arc::new(TaskManagerTools::new(Arc::clone(&deps.storage))))
}

/// `create_task` / `list_tasks` backed by the task store.
#[derive(Debug)]
pub struct TaskManagerTools {
    storage: Arc<Storage>,
}

#[derive(Deserialize)]
struct CreateTaskArgs {
    title: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct ListTasksArgs {
    #[serde(default)]
    status: Option<String>,
}

impl TaskManagerTools {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    async fn create_task(&self, args: &Value) -> String {
        let args: CreateTaskArgs = match serde_json::from_value(args.clone()) {
            Ok(args) => args,
            Err(e) => return format!("Error creating task: {e}"),
        };
        if args.title.trim().is_empty() {
            return "Error creating task: title cannot be empty".to_string();
        }

        let task = Task::new(args.title, args.description);
        if let Err(e) = self.storage.insert_task(&task).await {
            return format!("Error creating task: {e}");
        }
        info!(task_id = %task.id, title = %task.title, "task delegated");

        let payload = EventPayload::TaskCreated(TaskCreatedPayload {
            title: task.title.clone(),
        });
        if let Err(e) = self.storage.append_event(&task.id, &payload).await {
            warn!(task_id = %task.id, error = %e, "failed to record task event");
        }
        format!("Task created successfully. ID: {}", task.id)
    }

    async fn list_tasks(&self, args: &Value) -> String {
        let args: ListTasksArgs = match serde_json::from_value(args.clone()) {
            Ok(args) => args,
            Err(e) => return format!("Error listing tasks: {e}"),
        };
        let status = match args.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => match TaskStatus::parse(raw) {
                Some(status) => Some(status),
                None => return format!("Error listing tasks: unknown status '{raw}'"),
            },
        };

        match self.storage.list_tasks(status, LIST_LIMIT).await {
            Ok(tasks) if tasks.is_empty() => "No tasks found.".to_string(),
            Ok(tasks) => tasks
                .iter()
                .map(|t| format!("[{}] {} (ID: {})", t.status.as_str(), t.title, t.id))
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("Error listing tasks: {e}"),
        }
    }
}

#[async_trait]
impl LocalTools for TaskManagerTools {
    fn specs(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec::new(
                "create_task",
                "Delegate a new task to the Worker Agent.",
                json!({
                    "type": "object",
                    "properties": {
                        "title": { "type": "string", "description": "Short summary of the task" },
                        "description": {
                            "type": "string",
                            "description": "Detailed step-by-step instructions for the Worker"
                        }
                    },
                    "required": ["title", "description"]
                }),
            ),
            ToolSpec::new(
                "list_tasks",
                "Check the status of recent tasks.",
                json!({
                    "type": "object",
                    "properties": {
                        "status": {
                            "type": "string",
                            "enum": ["pending", "in_progress", "completed", "failed"],
                            "description": "Filter by status"
                        }
                    }
                }),
            ),
        ]
    }

    async fn dispatch(&self, name: &str, args: &Value) -> Option<Result<String, String>> {
        match name {
            "create_task" => Some(Ok(self.create_task(args).await)),
            "list_tasks" => Some(Ok(self.list_tasks(args).await)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::create_test_storage;

    #[tokio::test]
    async fn table_lists_builtins_in_order() {
        let ts = create_test_storage().await;
        let deps = BuiltinDeps {
            storage: Arc::clone(&ts.storage),
        };
        let skills = builtin_skills(&deps);
        let names: Vec<_> = skills.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec![GENERAL, TASK_MANAGER]);
        assert!(skills[0].local.is_none());
        assert!(skills[0].launch_specs.is_empty());

        let specs = skills[1].local_specs();
        let tool_names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(tool_names, vec!["create_task", "list_tasks"]);
    }

    #[tokio::test]
    async fn create_then_list_tasks() {
        let ts = create_test_storage().await;
        let tools = TaskManagerTools::new(Arc::clone(&ts.storage));

        let empty = tools.dispatch("list_tasks", &json!({})).await.unwrap().unwrap();
        assert_eq!(empty, "No tasks found.");

        let created = tools
            .dispatch(
                "create_task",
                &json!({ "title": "Summarize inbox", "description": "Last 24h" }),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(created.starts_with("Task created successfully. ID: "));
        let id = created.trim_start_matches("Task created successfully. ID: ");

        let listed = tools.dispatch("list_tasks", &json!({})).await.unwrap().unwrap();
        assert_eq!(listed, format!("[PENDING] Summarize inbox (ID: {id})"));

        let stored = ts
            .storage
            .get_task(&alphred_core::Id::from_string(id))
            .await
            .unwrap();
        assert_eq!(stored.description, "Last 24h");
        let events = ts.storage.list_events(&stored.id).await.unwrap();
        assert_eq!(events[0].event_type, "TASK_CREATED");
    }

    #[tokio::test]
    async fn list_tasks_filters_by_status() {
        let ts = create_test_storage().await;
        let tools = TaskManagerTools::new(Arc::clone(&ts.storage));
        tools
            .dispatch("create_task", &json!({ "title": "a", "description": "" }))
            .await;

        let none = tools
            .dispatch("list_tasks", &json!({ "status": "completed" }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(none, "No tasks found.");

        let pending = tools
            .dispatch("list_tasks", &json!({ "status": "PENDING" }))
            .await
            .unwrap()
            .unwrap();
        assert!(pending.starts_with("[PENDING] a"));

        let bad = tools
            .dispatch("list_tasks", &json!({ "status": "done" }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bad, "Error listing tasks: unknown status 'done'");
    }

    #[tokio::test]
    async fn create_task_reports_bad_arguments() {
        let ts = create_test_storage().await;
        let tools = TaskManagerTools::new(Arc::clone(&ts.storage));
        let reply = tools
            .dispatch("create_task", &json!({ "description": "no title" }))
            .await
            .unwrap()
            .unwrap();
        assert!(reply.starts_with("Error creating task: "), "{reply}");
    }

    #[tokio::test]
    async fn unknown_tool_has_no_local_handler() {
        let ts = create_test_storage().await;
        let tools = TaskManagerTools::new(Arc::clone(&ts.storage));
        assert!(tools.dispatch("echo", &json!({})).await.is_none());
    }
}
