//! Manifest discovery: scan skill directories for `<name>/SKILL.md`.

use alphred_core::skills::{parse_skill_md, SkillError, SkillManifest};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Result of manifest discovery.
#[derive(Debug, Default)]
pub struct DiscoveryResult {
    /// Successfully parsed manifests, in discovery order.
    pub manifests: Vec<SkillManifest>,
    /// Parse/load errors encountered.
    pub errors: Vec<DiscoveryError>,
}

/// Parse/load error details for one manifest.
#[derive(Debug)]
pub struct DiscoveryError {
    /// Skill directory name.
    pub name: String,
    /// Path to the SKILL.md that failed.
    pub path: PathBuf,
    pub error: SkillError,
}

/// Discover manifests from `dirs`, scanned in order.
///
/// A malformed manifest is logged, recorded in `errors` and skipped. When two
/// manifests share a name, the first one found wins.
pub fn discover_manifests(dirs: &[PathBuf]) -> DiscoveryResult {
    let mut result = DiscoveryResult::default();
    let mut seen_names: HashSet<String> = HashSet::new();

    for dir in dirs {
        scan_directory(dir, &mut result, &mut seen_names);
    }

    debug!(
        count = result.manifests.len(),
        errors = result.errors.len(),
        "discovered skill manifests"
    );
    result
}

fn scan_directory(dir: &Path, result: &mut DiscoveryResult, seen_names: &mut HashSet<String>) {
    if !dir.is_dir() {
        debug!(path = %dir.display(), "skills directory not found, skipping");
        return;
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "failed to read skills directory");
            return;
        }
    };

    // read_dir order is platform-dependent.
    let mut skill_dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    skill_dirs.sort();

    for skill_dir in skill_dirs {
        let skill_md_path = skill_dir.join("SKILL.md");
        if !skill_md_path.is_file() {
            debug!(path = %skill_dir.display(), "no SKILL.md found, skipping");
            continue;
        }

        let dir_name = skill_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let parsed = fs::read_to_string(&skill_md_path)
            .map_err(|e| SkillError::Io(e.to_string()))
            .and_then(|content| parse_skill_md(&content, skill_dir.clone()));

        match parsed {
            Ok(manifest) => {
                if !seen_names.insert(manifest.name.clone()) {
                    debug!(
                        name = %manifest.name,
                        path = %skill_dir.display(),
                        "duplicate skill name, skipping"
                    );
                    continue;
                }
                result.manifests.push(manifest);
            }
            Err(e) => {
                warn!(path = %skill_md_path.display(), error = %e, "failed to load SKILL.md");
                result.errors.push(DiscoveryError {
                    name: dir_name,
                    path: skill_md_path,
                    error: e,
                });
            }
        }
    }
}
