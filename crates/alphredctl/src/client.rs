//! HTTP client for the alphredd chat server.

use alphred_core::{Task, TaskEvent, TaskStatus};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("alphredd not running at {addr}\n  → start with: alphredd serve\n  → or set ALPHRED_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check ALPHRED_TOKEN env var or --token flag")]
    Unauthorized,

    #[error(
        "alphredd not ready after {timeout_ms}ms at {addr}\n  → ensure `alphredd serve` is running\n  → check ALPHRED_TOKEN if auth is enabled"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
}

/// Response from POST /chat.
#[derive(Debug, Deserialize)]
pub struct ChatReply {
    pub reply: String,
    #[serde(default)]
    pub long_term_searched: bool,
    #[serde(default)]
    pub tools_used: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CreateTaskRequest<'a> {
    title: &'a str,
    description: &'a str,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    task: Task,
}

#[derive(Debug, Deserialize)]
struct ListTasksResponse {
    tasks: Vec<Task>,
}

#[derive(Debug, Deserialize)]
struct ListEventsResponse {
    events: Vec<TaskEvent>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Total time allowed for the readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// First backoff delay of the readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.base_url
    }

    /// Probe /health. `Err` means the server could not be reached.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the server with exponential backoff (200ms initial, 5s total).
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS)
            .await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }

                    eprintln!(
                        "waiting for alphredd at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );

                    let sleep_ms = backoff_ms.min(timeout_ms.saturating_sub(elapsed));
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    async fn handle_error(&self, response: reqwest::Response, what: &str) -> ClientError {
        let status = response.status().as_u16();

        if status == 401 {
            return ClientError::Unauthorized;
        }
        if status == 404 {
            return ClientError::TaskNotFound(what.to_string());
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| "unknown error".to_string());

        ClientError::HttpError { status, message }
    }

    async fn read<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        what: &str,
    ) -> Result<T, ClientError> {
        if !response.status().is_success() {
            return Err(self.handle_error(response, what).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// POST /chat
    pub async fn chat(&self, message: &str) -> Result<ChatReply, ClientError> {
        let url = format!("{}/chat", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&ChatRequest { message })
            .send()
            .await?;
        self.read(response, "chat").await
    }

    /// POST /tasks
    pub async fn create_task(&self, title: &str, description: &str) -> Result<Task, ClientError> {
        let url = format!("{}/tasks", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&CreateTaskRequest { title, description })
            .send()
            .await?;
        let body: TaskResponse = self.read(response, title).await?;
        Ok(body.task)
    }

    /// GET /tasks?status=...&limit=...
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: Option<u32>,
    ) -> Result<Vec<Task>, ClientError> {
        let url = tasks_url(&self.base_url, status, limit);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        let body: ListTasksResponse = self.read(response, "tasks").await?;
        Ok(body.tasks)
    }

    /// GET /tasks/{id}
    pub async fn get_task(&self, task_id: &str) -> Result<Task, ClientError> {
        let url = format!("{}/tasks/{}", self.base_url, urlencoding::encode(task_id));
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        let body: TaskResponse = self.read(response, task_id).await?;
        Ok(body.task)
    }

    /// GET /tasks/{id}/events
    pub async fn list_events(&self, task_id: &str) -> Result<Vec<TaskEvent>, ClientError> {
        let url = format!(
            "{}/tasks/{}/events",
            self.base_url,
            urlencoding::encode(task_id)
        );
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        let body: ListEventsResponse = self.read(response, task_id).await?;
        Ok(body.events)
    }
}

fn tasks_url(base_url: &str, status: Option<TaskStatus>, limit: Option<u32>) -> String {
    let mut params = Vec::new();
    if let Some(status) = status {
        params.push(format!("status={}", urlencoding::encode(status.as_str())));
    }
    if let Some(limit) = limit {
        params.push(format!("limit={limit}"));
    }
    if params.is_empty() {
        format!("{base_url}/tasks")
    } else {
        format!("{base_url}/tasks?{}", params.join("&"))
    }
}
