//! Tool routing over the active skill.
//!
//! Resolution order for a call named `name`:
//! 1. the active skill's local handler, if it has one for `name`;
//! 2. the first live session (registration order) whose current catalog lists `name`;
//! 3. otherwise a "not found" error outcome.
//!
//! The catalog is local specs followed by each session's tools, without
//! deduplication. A name listed twice only ever runs on the first match above.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use alphred_core::ToolSpec;
use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::registry::CapabilityRegistry;
use crate::session::InvokeOutcome;

/// Borrows a registry for catalog building and dispatch.
#[derive(Debug)]
pub struct ToolRouter<'a> {
    registry: &'a mut CapabilityRegistry,
}

impl<'a> ToolRouter<'a> {
    pub fn new(registry: &'a mut CapabilityRegistry) -> Self {
        Self { registry }
    }

    /// Merged catalog for the next completion request.
    pub async fn catalog(&mut self) -> Vec<ToolSpec> {
        let (active, sessions) = self.registry.parts_mut();
        let mut catalog = active.map(|skill| skill.local_specs()).unwrap_or_default();
        for session in sessions.iter_mut() {
            catalog.extend(session.list_tools().await);
        }
        catalog
    }

    /// Run one tool call. Every outcome, including failures, is text-representable.
    pub async fn dispatch(&mut self, name: &str, args: &Value) -> InvokeOutcome {
        let (active, sessions) = self.registry.parts_mut();

        if let Some(local) = active.and_then(|skill| skill.local.clone()) {
            match AssertUnwindSafe(local.dispatch(name, args)).catch_unwind().await {
                Ok(Some(Ok(text))) => return InvokeOutcome::Content(text),
                Ok(Some(Err(e))) => return InvokeOutcome::Error(e),
                Ok(None) => {}
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    warn!(tool = %name, reason = %reason, "local tool handler panicked");
                    return InvokeOutcome::Error(format!("tool '{name}' failed: {reason}"));
                }
            }
        }

        for session in sessions.iter_mut() {
            let tools = session.list_tools().await;
            if tools.iter().any(|tool| tool.name == name) {
                debug!(tool = %name, provider = %session.spec(), "dispatching to provider");
                return session.invoke(name, args).await;
            }
        }

        InvokeOutcome::Error(format!("Tool '{name}' not found in active skill sessions."))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
