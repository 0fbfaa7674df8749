//! Provider sessions, skill activation and routing against the
//! `alphred-echo-provider` binary.

use std::sync::Arc;
use std::time::Duration;

use alphred_core::LaunchSpec;
use alphredd::registry::CapabilityRegistry;
use alphredd::router::ToolRouter;
use alphredd::session::{CapabilitySession, InvokeOutcome, SessionConfig, SessionError};
use alphredd::skills::{Skill, TaskManagerTools};
use alphredd::storage::Storage;
use serde_json::json;
use tempfile::TempDir;

fn echo(tools: &str) -> LaunchSpec {
    LaunchSpec::new(env!("CARGO_BIN_EXE_alphred-echo-provider")).with_env("ALPHRED_ECHO_TOOLS", tools)
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        handshake_timeout: Duration::from_secs(5),
        call_timeout: Duration::from_millis(500),
    }
}

#[cfg(target_os = "linux")]
fn process_exists(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[tokio::test]
async fn session_lists_and_invokes_tools() {
    let mut session = CapabilitySession::connect(&echo("echo,shout"), &fast_config())
        .await
        .unwrap();
    assert!(session.is_alive());

    let names: Vec<_> = session.list_tools().await.into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["echo", "shout"]);

    let outcome = session.invoke("echo", &json!({ "text": "hello" })).await;
    assert_eq!(outcome, InvokeOutcome::Content("hello".to_string()));

    let outcome = session.invoke("nope", &json!({})).await;
    assert!(matches!(outcome, InvokeOutcome::Error(ref msg) if msg.contains("unknown tool")));

    session.close().await.unwrap();
    assert!(!session.is_alive());
    assert_eq!(session.pid(), None);
    // Closing twice is fine.
    session.close().await.unwrap();
}

#[tokio::test]
async fn tool_error_flag_becomes_error_outcome() {
    let mut session = CapabilitySession::connect(&echo("fail_always"), &fast_config())
        .await
        .unwrap();
    let outcome = session.invoke("fail_always", &json!({ "text": "boom" })).await;
    assert_eq!(outcome, InvokeOutcome::Error("boom".to_string()));
    assert_eq!(outcome.to_text(), "Error: boom");
    session.close().await.unwrap();
}

#[tokio::test]
async fn hung_call_times_out_and_session_stays_usable() {
    let spec = echo("echo,slow").with_env("ALPHRED_ECHO_HANG_ON", "slow");
    let mut session = CapabilitySession::connect(&spec, &fast_config()).await.unwrap();

    let outcome = session.invoke("slow", &json!({})).await;
    assert!(matches!(outcome, InvokeOutcome::Error(ref msg) if msg.contains("timed out")));

    let outcome = session.invoke("echo", &json!({ "text": "still here" })).await;
    assert_eq!(outcome, InvokeOutcome::Content("still here".to_string()));
    session.close().await.unwrap();
}

#[tokio::test]
async fn crash_mid_call_is_provider_lost() {
    let spec = echo("echo,explode").with_env("ALPHRED_ECHO_CRASH_ON", "explode");
    let mut session = CapabilitySession::connect(&spec, &fast_config()).await.unwrap();

    let outcome = session.invoke("explode", &json!({})).await;
    assert!(matches!(outcome, InvokeOutcome::ProviderLost(_)));
    assert!(!session.is_alive());

    let outcome = session.invoke("echo", &json!({ "text": "again" })).await;
    assert!(matches!(outcome, InvokeOutcome::ProviderLost(_)));
    session.close().await.unwrap();
}

#[tokio::test]
async fn handshake_error_is_reported() {
    let spec = echo("echo").with_env("ALPHRED_ECHO_FAIL_HANDSHAKE", "1");
    let err = CapabilitySession::connect(&spec, &fast_config())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Rpc(ref msg) if msg.contains("refused")));
}

#[tokio::test]
async fn activation_excludes_providers_that_fail_to_connect() {
    let mut registry = CapabilityRegistry::new(fast_config());
    registry.register(Skill::new("mixed", "Mixed providers", "prompt").with_launch_specs(vec![
        echo("echo"),
        echo("echo").with_env("ALPHRED_ECHO_FAIL_HANDSHAKE", "1"),
        LaunchSpec::new("/nonexistent/alphred-provider"),
    ]));

    assert!(registry.activate("mixed").await);
    assert_eq!(registry.sessions().len(), 1);

    let report = registry.last_activation().unwrap();
    assert_eq!(report.skill, "mixed");
    assert_eq!(report.connected, 1);
    assert_eq!(report.failures.len(), 2);

    registry.shutdown().await;
    assert!(registry.sessions().is_empty());
    assert!(registry.active().is_none());
}

#[tokio::test]
async fn switching_skills_reaps_previous_providers() {
    let mut registry = CapabilityRegistry::new(fast_config());
    registry.register(Skill::new("a", "Skill A", "a").with_launch_specs(vec![echo("alpha")]));
    registry.register(Skill::new("b", "Skill B", "b").with_launch_specs(vec![echo("beta")]));

    assert!(registry.activate("a").await);
    let old_pid = registry.sessions()[0].pid().unwrap();

    assert!(registry.activate("b").await);
    assert_eq!(registry.active().map(|s| s.name.as_str()), Some("b"));
    assert_eq!(registry.sessions().len(), 1);
    assert_ne!(registry.sessions()[0].pid(), Some(old_pid));

    #[cfg(target_os = "linux")]
    assert!(!process_exists(old_pid));

    let mut router = ToolRouter::new(&mut registry);
    let names: Vec<_> = router.catalog().await.into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["beta"]);
    let outcome = router.dispatch("alpha", &json!({})).await;
    assert_eq!(
        outcome,
        InvokeOutcome::Error("Tool 'alpha' not found in active skill sessions.".to_string())
    );

    registry.shutdown().await;
}

#[tokio::test]
async fn local_handler_wins_over_provider_with_same_name() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
    storage.migrate_embedded().await.unwrap();
    let storage = Arc::new(storage);

    let mut registry = CapabilityRegistry::new(fast_config());
    registry.register(
        Skill::new("shadowed", "Local and remote list_tasks", "prompt")
            .with_launch_specs(vec![echo("list_tasks,echo")])
            .with_local_tools(Arc::new(TaskManagerTools::new(Arc::clone(&storage)))),
    );
    assert!(registry.activate("shadowed").await);

    let mut router = ToolRouter::new(&mut registry);
    let names: Vec<_> = router.catalog().await.into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["create_task", "list_tasks", "list_tasks", "echo"]);

    let outcome = router.dispatch("list_tasks", &json!({})).await;
    assert_eq!(outcome, InvokeOutcome::Content("No tasks found.".to_string()));

    let outcome = router.dispatch("echo", &json!({ "text": "remote" })).await;
    assert_eq!(outcome, InvokeOutcome::Content("remote".to_string()));

    registry.shutdown().await;
}
