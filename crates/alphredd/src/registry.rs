//! Capability registry: loaded skills, the active skill, and its live sessions.
//!
//! Each process (and each concurrently executing task) owns its own registry.
//! Activation takes `&mut self`, so no dispatch can observe a half-built
//! session set.

use std::path::PathBuf;

use alphred_core::LaunchSpec;
use tracing::{debug, info, warn};

use crate::session::{CapabilitySession, SessionConfig};
use crate::skills::{discover_manifests, DiscoveryError, Skill};

/// Outcome of [`CapabilityRegistry::load`].
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Names registered, in order.
    pub loaded: Vec<String>,
    pub errors: Vec<DiscoveryError>,
}

/// One launch spec that failed to connect during activation.
#[derive(Debug, Clone)]
pub struct ActivationFailure {
    pub spec: LaunchSpec,
    pub error: String,
}

/// Outcome of the most recent activation.
#[derive(Debug, Clone)]
pub struct ActivationReport {
    pub skill: String,
    pub connected: usize,
    pub failures: Vec<ActivationFailure>,
}

#[derive(Debug)]
pub struct CapabilityRegistry {
    skills: Vec<Skill>,
    active: Option<Skill>,
    sessions: Vec<CapabilitySession>,
    session_config: SessionConfig,
    last_activation: Option<ActivationReport>,
}

impl CapabilityRegistry {
    pub fn new(session_config: SessionConfig) -> Self {
        Self {
            skills: Vec::new(),
            active: None,
            sessions: Vec::new(),
            session_config,
            last_activation: None,
        }
    }

    /// Register a skill. The first registration of a name wins.
    pub fn register(&mut self, skill: Skill) -> bool {
        if self.get(&skill.name).is_some() {
            debug!(skill = %skill.name, "skill already registered, skipping");
            return false;
        }
        self.skills.push(skill);
        true
    }

    /// Register `builtins`, then every manifest found under `skills_dirs`.
    ///
    /// Malformed manifests are reported, never fatal.
    pub fn load(&mut self, builtins: Vec<Skill>, skills_dirs: &[PathBuf]) -> LoadReport {
        let mut report = LoadReport::default();
        for skill in builtins {
            let name = skill.name.clone();
            if self.register(skill) {
                report.loaded.push(name);
            }
        }

        let discovered = discover_manifests(skills_dirs);
        for manifest in discovered.manifests {
            let name = manifest.name.clone();
            if self.register(Skill::from_manifest(manifest)) {
                report.loaded.push(name);
            }
        }
        report.errors = discovered.errors;

        info!(
            loaded = report.loaded.len(),
            errors = report.errors.len(),
            "skills loaded"
        );
        report
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.iter().find(|s| s.name == name)
    }

    pub fn skill_names(&self) -> Vec<&str> {
        self.skills.iter().map(|s| s.name.as_str()).collect()
    }

    /// Make `name` the active skill.
    ///
    /// Every session of the previous skill is closed (and its process reaped)
    /// first. Providers that fail to connect are logged and left out; the
    /// skill is still active. Returns `false` only for an unknown name.
    pub async fn activate(&mut self, name: &str) -> bool {
        let Some(skill) = self.get(name).cloned() else {
            warn!(skill = %name, "cannot activate unknown skill");
            return false;
        };

        self.teardown().await;
        self.active = Some(skill.clone());

        let mut failures = Vec::new();
        for spec in &skill.launch_specs {
            match CapabilitySession::connect(spec, &self.session_config).await {
                Ok(session) => {
                    debug!(
                        skill = %skill.name,
                        provider = %spec,
                        tools = session.cached_tools().len(),
                        "provider connected"
                    );
                    self.sessions.push(session);
                }
                Err(e) => {
                    warn!(
                        skill = %skill.name,
                        provider = %spec,
                        error = %e,
                        "provider failed to connect, excluding it"
                    );
                    failures.push(ActivationFailure {
                        spec: spec.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            skill = %skill.name,
            connected = self.sessions.len(),
            failed = failures.len(),
            "skill activated"
        );
        self.last_activation = Some(ActivationReport {
            skill: skill.name,
            connected: self.sessions.len(),
            failures,
        });
        true
    }

    pub fn active(&self) -> Option<&Skill> {
        self.active.as_ref()
    }

    pub fn last_activation(&self) -> Option<&ActivationReport> {
        self.last_activation.as_ref()
    }

    /// Live sessions of the active skill, in registration order.
    pub fn sessions(&self) -> &[CapabilitySession] {
        &self.sessions
    }

    pub(crate) fn parts_mut(&mut self) -> (Option<&Skill>, &mut [CapabilitySession]) {
        (self.active.as_ref(), &mut self.sessions)
    }

    /// Close all sessions and clear the active skill.
    pub async fn shutdown(&mut self) {
        self.teardown().await;
        self.active = None;
    }

    /// Close every session, continuing past individual failures.
    async fn teardown(&mut self) {
        // Moved out first: if this future is dropped, kill-on-drop still
        // stops whatever was not closed yet.
        let sessions = std::mem::take(&mut self.sessions);
        let total = sessions.len();
        let mut errors = Vec::new();
        for mut session in sessions {
            if let Err(e) = session.close().await {
                errors.push(format!("{}: {e}", session.spec()));
            }
        }
        if !errors.is_empty() {
            warn!(
                total,
                failed = errors.len(),
                errors = %errors.join("; "),
                "errors while closing provider sessions"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new(SessionConfig {
            handshake_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(2),
        })
    }

    #[tokio::test]
    async fn activate_unknown_skill_returns_false() {
        let mut registry = registry();
        assert!(!registry.activate("missing").await);
        assert!(registry.active().is_none());
    }

    #[tokio::test]
    async fn unreachable_provider_is_excluded_not_fatal() {
        let mut registry = registry();
        registry.register(
            Skill::new("broken", "d", "p")
                .with_launch_specs(vec![LaunchSpec::new("/nonexistent/alphred-provider")]),
        );

        assert!(registry.activate("broken").await);
        assert_eq!(registry.active().map(|s| s.name.as_str()), Some("broken"));
        assert!(registry.sessions().is_empty());

        let report = registry.last_activation().unwrap();
        assert_eq!(report.skill, "broken");
        assert_eq!(report.connected, 0);
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn register_keeps_first_definition() {
        let mut registry = registry();
        assert!(registry.register(Skill::new("general", "first", "p1")));
        assert!(!registry.register(Skill::new("general", "second", "p2")));
        assert_eq!(registry.get("general").unwrap().description, "first");
    }

    #[tokio::test]
    async fn load_registers_builtins_before_manifests() {
        let tmp = TempDir::new().unwrap();
        for (dir, name) in [("general", "general"), ("notes", "notes")] {
            let skill_dir = tmp.path().join(dir);
            fs::create_dir_all(&skill_dir).unwrap();
            fs::write(
                skill_dir.join("SKILL.md"),
                format!("---\nname: {name}\ndescription: From disk.\n---\nBody"),
            )
            .unwrap();
        }
        let bad = tmp.path().join("bad");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("SKILL.md"), "no frontmatter").unwrap();

        let mut registry = registry();
        let report = registry.load(
            vec![Skill::new("general", "Built in.", "p")],
            &[tmp.path().to_path_buf()],
        );

        assert_eq!(report.loaded, vec!["general", "notes"]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(registry.get("general").unwrap().description, "Built in.");
        assert_eq!(registry.skill_names(), vec!["general", "notes"]);
    }

    #[tokio::test]
    async fn shutdown_clears_active_skill() {
        let mut registry = registry();
        registry.register(Skill::new("general", "d", "p"));
        assert!(registry.activate("general").await);
        registry.shutdown().await;
        assert!(registry.active().is_none());
        assert!(registry.sessions().is_empty());
    }
}
