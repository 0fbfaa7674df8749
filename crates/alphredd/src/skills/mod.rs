//! Skills: a prompt fragment plus the tool providers activated with it.
//!
//! Skills come from two places: the compile-time built-in table
//! ([`builtin`]) and `SKILL.md` manifests found on disk ([`catalog`]).

mod builtin;
mod catalog;

use std::sync::Arc;

use alphred_core::skills::SkillManifest;
use alphred_core::{LaunchSpec, ToolSpec};
use async_trait::async_trait;
use serde_json::Value;

pub use builtin::{builtin_skills, BuiltinDeps, TaskManagerTools, BUILTIN_SKILLS, GENERAL, TASK_MANAGER};
pub use catalog::{discover_manifests, DiscoveryError, DiscoveryResult};

/// In-process tool handlers owned by a skill.
#[async_trait]
pub trait LocalTools: Send + Sync {
    /// Tool declarations shown to the model.
    fn specs(&self) -> Vec<ToolSpec>;

    /// Run `name`, or return `None` if this skill has no handler for it.
    async fn dispatch(&self, name: &str, args: &Value) -> Option<Result<String, String>>;
}

/// A named capability bundle, immutable once loaded.
#[derive(Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// System prompt fragment.
    pub prompt: String,
    pub launch_specs: Vec<LaunchSpec>,
    pub local: Option<Arc<dyn LocalTools>>,
}

impl std::fmt::Debug for Skill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Skill")
            .field("name", &self.name)
            .field("launch_specs", &self.launch_specs)
            .field("local_tools", &self.local_specs().len())
            .finish_non_exhaustive()
    }
}

impl Skill {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            prompt: prompt.into(),
            launch_specs: Vec::new(),
            local: None,
        }
    }

    pub fn with_launch_specs(mut self, specs: Vec<LaunchSpec>) -> Self {
        self.launch_specs = specs;
        self
    }

    pub fn with_local_tools(mut self, tools: Arc<dyn LocalTools>) -> Self {
        self.local = Some(tools);
        self
    }

    pub fn from_manifest(manifest: SkillManifest) -> Self {
        Self::new(manifest.name, manifest.description, manifest.prompt)
            .with_launch_specs(manifest.servers)
    }

    /// Local tool declarations, empty when the skill has no local handlers.
    pub fn local_specs(&self) -> Vec<ToolSpec> {
        self.local.as_ref().map(|l| l.specs()).unwrap_or_default()
    }
}
