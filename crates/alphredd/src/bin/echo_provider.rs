//! Minimal stdio tool provider.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout. Useful for trying out
//! manifest skills and for integration tests. Behavior is tuned through
//! environment variables:
//!
//! - `ALPHRED_ECHO_TOOLS`: comma-separated tool names to declare (default `echo`)
//! - `ALPHRED_ECHO_FAIL_HANDSHAKE`: reject `initialize` with an error
//! - `ALPHRED_ECHO_CRASH_ON`: exit without replying when this tool is called
//! - `ALPHRED_ECHO_HANG_ON`: never reply when this tool is called
//! - `ALPHRED_ECHO_PID_FILE`: write the process id here on startup
//!
//! Tools whose name starts with `fail` reply with `isError: true`.

use std::io::{self, BufRead, Write};

use serde_json::{json, Value};

fn main() {
    let tools: Vec<String> = std::env::var("ALPHRED_ECHO_TOOLS")
        .unwrap_or_else(|_| "echo".to_string())
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    let fail_handshake = std::env::var_os("ALPHRED_ECHO_FAIL_HANDSHAKE").is_some();
    let crash_on = std::env::var("ALPHRED_ECHO_CRASH_ON").ok();
    let hang_on = std::env::var("ALPHRED_ECHO_HANG_ON").ok();

    if let Some(path) = std::env::var_os("ALPHRED_ECHO_PID_FILE") {
        if let Err(err) = std::fs::write(&path, std::process::id().to_string()) {
            eprintln!("failed to write pid file: {err}");
        }
    }

    eprintln!("echo provider started with tools {tools:?}");

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            eprintln!("ignoring malformed line");
            continue;
        };
        let Some(id) = request.get("id").cloned() else {
            // Notification.
            continue;
        };
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let response = match method {
            "initialize" if fail_handshake => error_response(&id, "initialization refused"),
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "alphred-echo-provider", "version": "0.1.0" }
                }
            }),
            "tools/list" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "tools": tools.iter().map(|name| tool_declaration(name)).collect::<Vec<_>>() }
            }),
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                if crash_on.as_deref() == Some(name) {
                    eprintln!("crashing on {name}");
                    std::process::exit(1);
                }
                if hang_on.as_deref() == Some(name) {
                    continue;
                }
                if tools.iter().any(|tool| tool == name) {
                    call_response(&id, name, &arguments)
                } else {
                    error_response(&id, &format!("unknown tool: {name}"))
                }
            }
            other => error_response(&id, &format!("method not found: {other}")),
        };

        // Interleave a notification to exercise client-side skipping.
        let progress = json!({ "jsonrpc": "2.0", "method": "notifications/message", "params": { "level": "debug" } });
        if writeln!(stdout, "{progress}\n{response}").is_err() || stdout.flush().is_err() {
            break;
        }
    }
}

fn tool_declaration(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("Echoes its arguments ({name})"),
        "inputSchema": {
            "type": "object",
            "properties": { "text": { "type": "string" } }
        }
    })
}

fn call_response(id: &Value, name: &str, arguments: &Value) -> Value {
    let text = match arguments.get("text").and_then(Value::as_str) {
        Some(text) => text.to_string(),
        None => format!("{name}: {arguments}"),
    };
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "content": [ { "type": "text", "text": text } ],
            "isError": name.starts_with("fail")
        }
    })
}

fn error_response(id: &Value, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": -32601, "message": message }
    })
}
