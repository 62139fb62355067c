//! Types shared by agents and the OODA engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fs_store::META_DIR;
use crate::task::{BuildStatus, MicroTaskKind, MicroTaskStatus, Task, TestStatus};

/// Snapshot of a project taken by the observe phase.
///
/// # Invariants
/// - `files` never contains paths under `node_modules/`, `dist/`, `.git/` or the meta dir
/// - `dependencies` is the union of `dependencies` and `devDependencies` from `package.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    /// Relative path → text content
    pub files: BTreeMap<String, String>,
    /// Declared package → version range
    pub dependencies: BTreeMap<String, String>,
    /// `true` once declared dependencies have been installed (or none are declared)
    pub deps_installed: bool,
    pub build_status: BuildStatus,
    pub test_status: TestStatus,
    /// Error lines from the most recent failed build/test
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

impl ProjectState {
    /// Build a snapshot from a task and its current project files.
    pub fn from_task(task: &Task, files: BTreeMap<String, String>) -> Self {
        let dependencies = files
            .get("package.json")
            .map(|manifest| extract_dependencies(manifest))
            .unwrap_or_default();

        let installed_once = task.micro_tasks().iter().any(|m| {
            m.kind == MicroTaskKind::PackageInstall && m.status == MicroTaskStatus::Completed
        });

        let mut errors = Vec::new();
        let failed_build = matches!(task.build_status(), BuildStatus::Failed | BuildStatus::Error);
        let failed_test = matches!(task.test_status(), TestStatus::Failed | TestStatus::Error);
        if failed_build || failed_test {
            let last_run = task
                .micro_tasks()
                .iter()
                .rev()
                .find(|m| matches!(m.kind, MicroTaskKind::BuildRun | MicroTaskKind::TestRun));
            match last_run.and_then(|m| m.error.clone()) {
                Some(error) => errors.extend(error.lines().map(str::to_string)),
                None if failed_build => errors.push("build failed".to_string()),
                None => errors.push("tests failed".to_string()),
            }
        }

        Self {
            deps_installed: dependencies.is_empty() || installed_once,
            files,
            dependencies,
            build_status: task.build_status(),
            test_status: task.test_status(),
            errors,
            warnings: Vec::new(),
            observed_at: Utc::now(),
        }
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn has_package_json(&self) -> bool {
        self.has_file("package.json")
    }

    /// Human-readable one-liner used in insights and logs.
    pub fn summary(&self) -> String {
        format!(
            "{} files, {} dependencies, build {:?}, tests {:?}",
            self.files.len(),
            self.dependencies.len(),
            self.build_status,
            self.test_status
        )
    }
}

/// Union of `dependencies` and `devDependencies` in a `package.json` body.
///
/// An unparsable manifest yields an empty map.
pub fn extract_dependencies(manifest: &str) -> BTreeMap<String, String> {
    let parsed: serde_json::Value = match serde_json::from_str(manifest) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Failed to parse package.json: {}", e);
            return BTreeMap::new();
        }
    };
    let mut deps = BTreeMap::new();
    for section in ["dependencies", "devDependencies"] {
        if let Some(map) = parsed[section].as_object() {
            for (name, version) in map {
                deps.insert(
                    name.clone(),
                    version.as_str().unwrap_or("*").to_string(),
                );
            }
        }
    }
    deps
}

/// Whether a relative path belongs to forgeloop's own bookkeeping.
pub fn is_meta_path(path: &str) -> bool {
    path == META_DIR || path.starts_with(&format!("{}/", META_DIR))
}

/// Errors that can occur in agent operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("Project state is missing {0}")]
    MissingState(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("File store error: {0}")]
    FileStore(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<crate::llm::LlmError> for AgentError {
    fn from(e: crate::llm::LlmError) -> Self {
        Self::LlmError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::MicroTask;
    use std::path::Path;

    fn task() -> Task {
        Task::new("build a todo app", Path::new("/tmp/p")).expect("task")
    }

    #[test]
    fn extracts_runtime_and_dev_dependencies() {
        let deps = extract_dependencies(
            r#"{"dependencies":{"react":"^18.0.0"},"devDependencies":{"typescript":"^5.4.0"}}"#,
        );
        assert_eq!(deps.get("react").map(String::as_str), Some("^18.0.0"));
        assert_eq!(deps.get("typescript").map(String::as_str), Some("^5.4.0"));
    }

    #[test]
    fn broken_manifest_has_no_dependencies() {
        assert!(extract_dependencies("{not json").is_empty());
    }

    #[test]
    fn deps_installed_after_completed_install() {
        let mut task = task();
        let mut files = BTreeMap::new();
        files.insert(
            "package.json".to_string(),
            r#"{"dependencies":{"react":"^18"}}"#.to_string(),
        );
        assert!(!ProjectState::from_task(&task, files.clone()).deps_installed);

        let mut install = MicroTask::package_install(&["react"]);
        install.mark_completed();
        task.push_micro_tasks([install]);
        assert!(ProjectState::from_task(&task, files).deps_installed);
    }

    #[test]
    fn failed_build_surfaces_errors() {
        let mut task = task();
        let mut build = MicroTask::build_run();
        build.error = Some("src/a.ts(1,1): error TS2304".to_string());
        build.mark_in_progress();
        task.push_micro_tasks([build]);
        task.set_build_status(BuildStatus::Failed);

        let state = ProjectState::from_task(&task, BTreeMap::new());
        assert_eq!(state.errors, vec!["src/a.ts(1,1): error TS2304"]);
    }

    #[test]
    fn meta_paths_are_recognised() {
        assert!(is_meta_path(".forgeloop/log.json"));
        assert!(!is_meta_path("src/.forgeloop.ts"));
    }
}
