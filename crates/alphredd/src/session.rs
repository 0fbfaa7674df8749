//! Capability sessions: one live subprocess tool provider each.
//!
//! The provider speaks newline-delimited JSON-RPC 2.0 on stdin/stdout
//! (`initialize`, `tools/list`, `tools/call`). The child is spawned with
//! kill-on-drop, so a session dropped on any path (error, cancellation,
//! registry teardown) takes its process with it. `close()` additionally waits
//! for the exit so callers can rely on the process being gone.

use std::process::Stdio;
use std::time::Duration;

use alphred_core::{Config, LaunchSpec, ToolSpec};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("provider did not expose {0}")]
    MissingPipe(&'static str),
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("provider returned error: {0}")]
    Rpc(String),
    #[error("provider lost: {0}")]
    Lost(String),
    #[error("session is closed")]
    Closed,
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to stop provider: {0}")]
    Shutdown(std::io::Error),
}

/// Deadlines applied to a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            call_timeout: config.tool_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Result of one `tools/call`. Always representable as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeOutcome {
    Content(String),
    Error(String),
    /// The provider process went away mid-call (EOF or broken pipe).
    ProviderLost(String),
}

impl InvokeOutcome {
    /// Short label used in audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Content(_) => "content",
            Self::Error(_) => "error",
            Self::ProviderLost(_) => "provider_lost",
        }
    }

    /// Text fed back to the model.
    pub fn to_text(&self) -> String {
        match self {
            Self::Content(text) => text.clone(),
            Self::Error(msg) => format!("Error: {msg}"),
            Self::ProviderLost(msg) => format!("Error: tool provider lost: {msg}"),
        }
    }
}

/// A live connection to one subprocess tool provider.
pub struct CapabilitySession {
    spec: LaunchSpec,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    next_id: i64,
    call_timeout: Duration,
    tools: Vec<ToolSpec>,
    lost: bool,
}

impl std::fmt::Debug for CapabilitySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilitySession")
            .field("command", &self.spec.command)
            .field("pid", &self.pid())
            .field("tools", &self.tools.len())
            .field("lost", &self.lost)
            .finish()
    }
}

impl CapabilitySession {
    /// Spawn the provider and complete the handshake.
    ///
    /// On failure the child is killed and reaped before the error is returned.
    /// If the returned future is dropped, kill-on-drop stops the child.
    pub async fn connect(spec: &LaunchSpec, config: &SessionConfig) -> Result<Self, SessionError> {
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SessionError::Spawn {
                command: spec.command.clone(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            let command = spec.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(provider = %command, "{line}");
                }
            });
        }

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let mut session = Self {
            spec: spec.clone(),
            child: Some(child),
            stdin,
            stdout: stdout.map(|out| BufReader::new(out).lines()),
            next_id: 1,
            call_timeout: config.call_timeout,
            tools: Vec::new(),
            lost: false,
        };

        let handshake = tokio::time::timeout(config.handshake_timeout, session.handshake()).await;
        let err = match handshake {
            Ok(Ok(())) => {
                session.list_tools().await;
                return Ok(session);
            }
            Ok(Err(err)) => err,
            Err(_) => SessionError::HandshakeTimeout(config.handshake_timeout),
        };

        if let Err(close_err) = session.close().await {
            warn!(provider = %spec, error = %close_err, "failed to stop provider after handshake failure");
        }
        Err(err)
    }

    async fn handshake(&mut self) -> Result<(), SessionError> {
        if self.stdin.is_none() {
            return Err(SessionError::MissingPipe("stdin"));
        }
        if self.stdout.is_none() {
            return Err(SessionError::MissingPipe("stdout"));
        }

        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "alphred", "version": env!("CARGO_PKG_VERSION") }
            }),
        )
        .await?;

        self.send(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    /// OS process id, or `None` once the provider has been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn is_alive(&self) -> bool {
        self.child.is_some() && !self.lost
    }

    /// The catalog from the most recent `list_tools()`.
    pub fn cached_tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    /// Query the provider's current tools.
    ///
    /// Failures are logged and yield an empty catalog.
    pub async fn list_tools(&mut self) -> Vec<ToolSpec> {
        let response = tokio::time::timeout(
            self.call_timeout,
            self.request("tools/list", json!({})),
        )
        .await;

        self.tools = match response {
            Ok(Ok(result)) => parse_tool_list(&result),
            Ok(Err(err)) => {
                warn!(provider = %self.spec, error = %err, "tools/list failed");
                Vec::new()
            }
            Err(_) => {
                warn!(provider = %self.spec, timeout = ?self.call_timeout, "tools/list timed out");
                Vec::new()
            }
        };
        self.tools.clone()
    }

    /// Call one tool. Never fails: every problem is an outcome.
    pub async fn invoke(&mut self, name: &str, args: &Value) -> InvokeOutcome {
        let params = json!({ "name": name, "arguments": args });
        let response = tokio::time::timeout(self.call_timeout, self.request("tools/call", params)).await;

        match response {
            Ok(Ok(result)) => parse_call_result(&result),
            Ok(Err(SessionError::Lost(reason))) => InvokeOutcome::ProviderLost(reason),
            Ok(Err(SessionError::Closed)) => {
                InvokeOutcome::ProviderLost("provider session is closed".to_string())
            }
            Ok(Err(err)) => InvokeOutcome::Error(err.to_string()),
            Err(_) => InvokeOutcome::Error(format!(
                "tool '{name}' timed out after {}s",
                self.call_timeout.as_secs()
            )),
        }
    }

    /// Terminate the provider and release its pipes. Idempotent.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        self.stdin = None;
        self.stdout = None;
        self.tools.clear();
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        // kill() also waits, so the process is reaped when this returns.
        match child.kill().await {
            Ok(()) => Ok(()),
            // Already exited and reaped.
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(SessionError::Shutdown(err)),
        }
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, SessionError> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .await?;

        loop {
            let message = self.read_message().await?;
            // Notifications and provider-initiated requests.
            if message.get("method").is_some() {
                continue;
            }
            let Some(message_id) = message.get("id") else {
                continue;
            };
            if message_id.as_i64() != Some(id) {
                debug!(provider = %self.spec, expected = id, got = %message_id, "skipping stale response");
                continue;
            }
            if let Some(err) = message.get("error") {
                let text = err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(SessionError::Rpc(text.to_string()));
            }
            return Ok(message.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    async fn send(&mut self, message: &Value) -> Result<(), SessionError> {
        if self.lost {
            return Err(SessionError::Lost("provider connection already lost".to_string()));
        }
        let stdin = self.stdin.as_mut().ok_or(SessionError::Closed)?;
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let written = async {
            stdin.write_all(&line).await?;
            stdin.flush().await
        }
        .await;
        if let Err(err) = written {
            self.lost = true;
            return Err(SessionError::Lost(format!("write failed: {err}")));
        }
        Ok(())
    }

    async fn read_message(&mut self) -> Result<Value, SessionError> {
        loop {
            if self.lost {
                return Err(SessionError::Lost("provider connection already lost".to_string()));
            }
            let stdout = self.stdout.as_mut().ok_or(SessionError::Closed)?;
            match stdout.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str(trimmed) {
                        Ok(value) => return Ok(value),
                        Err(_) => {
                            debug!(provider = %self.spec, line = trimmed, "ignoring non-JSON stdout line");
                        }
                    }
                }
                Ok(None) => {
                    self.lost = true;
                    return Err(SessionError::Lost("provider closed its output".to_string()));
                }
                Err(err) => {
                    self.lost = true;
                    return Err(SessionError::Lost(format!("read failed: {err}")));
                }
            }
        }
    }
}

fn parse_tool_list(result: &Value) -> Vec<ToolSpec> {
    let Some(tools) = result.get("tools").and_then(Value::as_array) else {
        return Vec::new();
    };
    tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name").and_then(Value::as_str)?;
            let description = tool
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let parameters = tool
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));
            Some(ToolSpec::new(name, description, parameters))
        })
        .collect()
}

fn parse_call_result(result: &Value) -> InvokeOutcome {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .map(|part| match part.get("text").and_then(Value::as_str) {
                    Some(text) => text.to_string(),
                    None => part.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        InvokeOutcome::Error(text)
    } else {
        InvokeOutcome::Content(text)
    }
}
