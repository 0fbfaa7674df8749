//! SKILL.md manifest parsing.
//!
//! A manifest skill is a directory containing `SKILL.md`: YAML frontmatter
//! naming the skill and its tool provider launch specs, followed by a markdown
//! body that becomes the skill's system prompt fragment.
//!
//! ```text
//! ---
//! name: calendar
//! description: Read and create calendar events.
//! servers:
//!   - command: uvx
//!     args: [calendar-mcp]
//!     env:
//!       CALENDAR_TZ: Europe/Stockholm
//! ---
//! You manage the user's calendar. Confirm before creating events.
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::LaunchSpec;

/// A validated skill manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillManifest {
    /// Skill name (1-64 chars, lowercase alphanumeric + hyphens).
    pub name: String,
    /// What the skill is for (1-1024 chars).
    pub description: String,
    /// System prompt fragment (the markdown body).
    pub prompt: String,
    /// Subprocess tool providers started on activation.
    pub servers: Vec<LaunchSpec>,
    /// Directory the manifest was loaded from.
    pub path: PathBuf,
}

/// Error type for manifest parsing and validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkillError {
    #[error("missing YAML frontmatter")]
    MissingFrontmatter,
    #[error("invalid YAML frontmatter: {0}")]
    InvalidYaml(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("invalid description: {0}")]
    InvalidDescription(String),
    #[error("invalid server #{index}: {reason}")]
    InvalidServer { index: usize, reason: String },
    #[error("failed to read manifest: {0}")]
    Io(String),
}

#[derive(Debug, Deserialize)]
struct RawFrontmatter {
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    servers: Vec<RawServer>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// Validates a skill name.
///
/// 1-64 characters of lowercase letters, digits and hyphens; no leading,
/// trailing or consecutive hyphens.
pub fn validate_name(name: &str) -> Result<(), SkillError> {
    if name.is_empty() {
        return Err(SkillError::InvalidName("name cannot be empty".to_string()));
    }
    if name.len() > 64 {
        return Err(SkillError::InvalidName(format!(
            "name exceeds 64 characters (got {})",
            name.len()
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(SkillError::InvalidName(
            "name cannot start or end with a hyphen".to_string(),
        ));
    }
    if name.contains("--") {
        return Err(SkillError::InvalidName(
            "name cannot contain consecutive hyphens".to_string(),
        ));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '-')
    {
        return Err(SkillError::InvalidName(format!(
            "invalid character '{c}': only lowercase letters, numbers, and hyphens allowed"
        )));
    }
    Ok(())
}

/// Validates a skill description (1-1024 characters).
pub fn validate_description(description: &str) -> Result<(), SkillError> {
    if description.trim().is_empty() {
        return Err(SkillError::InvalidDescription(
            "description cannot be empty".to_string(),
        ));
    }
    if description.len() > 1024 {
        return Err(SkillError::InvalidDescription(format!(
            "description exceeds 1024 characters (got {})",
            description.len()
        )));
    }
    Ok(())
}

/// Splits SKILL.md content into `(frontmatter, body)`.
///
/// Frontmatter must be delimited by `---` lines at the start of the file.
fn split_frontmatter(content: &str) -> Result<(&str, &str), SkillError> {
    let trimmed = content.trim_start();
    let Some(after_open) = trimmed.strip_prefix("---") else {
        return Err(SkillError::MissingFrontmatter);
    };
    let after_open = after_open
        .strip_prefix("\r\n")
        .or_else(|| after_open.strip_prefix('\n'))
        .unwrap_or(after_open);

    let close = after_open
        .find("\n---")
        .ok_or(SkillError::MissingFrontmatter)?;
    let frontmatter = after_open[..close].trim_end_matches('\r');
    let rest = &after_open[close + 4..];
    // Drop the remainder of the closing delimiter line.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    Ok((frontmatter, body.trim()))
}

/// Parses and validates SKILL.md content loaded from `path`.
pub fn parse_skill_md(content: &str, path: PathBuf) -> Result<SkillManifest, SkillError> {
    let (frontmatter, body) = split_frontmatter(content)?;

    let raw: RawFrontmatter =
        serde_yaml::from_str(frontmatter).map_err(|e| SkillError::InvalidYaml(e.to_string()))?;

    let name = raw.name.ok_or(SkillError::MissingField("name"))?;
    validate_name(&name)?;

    let description = raw
        .description
        .ok_or(SkillError::MissingField("description"))?;
    validate_description(&description)?;

    let servers = raw
        .servers
        .into_iter()
        .enumerate()
        .map(|(index, server)| {
            let command = server
                .command
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| SkillError::InvalidServer {
                    index,
                    reason: "command is required".to_string(),
                })?;
            Ok(LaunchSpec {
                command,
                args: server.args,
                env: server.env,
            })
        })
        .collect::<Result<Vec<_>, SkillError>>()?;

    Ok(SkillManifest {
        name,
        description,
        prompt: body.to_string(),
        servers,
        path,
    })
}
