//! Micro-tasks: the atomic project mutations proposed by agents.
//!
//! # Invariants
//! - `retry_count <= max_retries` after every `record_failure`
//! - status only ever moves forward within one attempt; a retry re-enters `Pending`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default retry budget for a fresh micro-task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Line prefixes that open and close an unresolved merge conflict.
pub const CONFLICT_MARKERS: [&str; 2] = ["<<<<<<<", ">>>>>>>"];

/// Whether `content` still carries merge conflict markers.
pub fn has_conflict_markers(content: &str) -> bool {
    content
        .lines()
        .any(|line| CONFLICT_MARKERS.iter().any(|marker| line.starts_with(marker)))
}

/// Closed set of micro-task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicroTaskKind {
    FileCreate,
    FileReplace,
    FileDelete,
    PackageInstall,
    BuildRun,
    TestRun,
    LogParse,
    MergeResolve,
    ProjectFinish,
}

impl MicroTaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MicroTaskKind::FileCreate => "file_create",
            MicroTaskKind::FileReplace => "file_replace",
            MicroTaskKind::FileDelete => "file_delete",
            MicroTaskKind::PackageInstall => "package_install",
            MicroTaskKind::BuildRun => "build_run",
            MicroTaskKind::TestRun => "test_run",
            MicroTaskKind::LogParse => "log_parse",
            MicroTaskKind::MergeResolve => "merge_resolve",
            MicroTaskKind::ProjectFinish => "project_finish",
        }
    }

    /// Kinds that spawn an external process.
    pub fn runs_command(&self) -> bool {
        matches!(
            self,
            MicroTaskKind::PackageInstall | MicroTaskKind::BuildRun | MicroTaskKind::TestRun
        )
    }

    /// Kinds whose `path` names a project file.
    pub fn touches_file(&self) -> bool {
        matches!(
            self,
            MicroTaskKind::FileCreate
                | MicroTaskKind::FileReplace
                | MicroTaskKind::FileDelete
                | MicroTaskKind::MergeResolve
        )
    }
}

impl std::fmt::Display for MicroTaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicroTaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One atomic operation against a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroTask {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MicroTaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_snippet: Option<String>,
    /// SHA-256 of the target file before the last attempt, if it existed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_hash: Option<String>,
    pub status: MicroTaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl MicroTask {
    pub fn new(kind: MicroTaskKind) -> Self {
        Self {
            id: format!("mt-{}", Uuid::new_v4().simple()),
            kind,
            path: None,
            old_snippet: None,
            new_snippet: None,
            rollback_hash: None,
            status: MicroTaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error: None,
        }
    }

    pub fn file_create(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(MicroTaskKind::FileCreate)
            .with_path(path)
            .with_new_snippet(content)
    }

    pub fn file_replace(
        path: impl Into<String>,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        let mut micro = Self::new(MicroTaskKind::FileReplace)
            .with_path(path)
            .with_new_snippet(new);
        micro.old_snippet = Some(old.into());
        micro
    }

    pub fn file_delete(path: impl Into<String>) -> Self {
        Self::new(MicroTaskKind::FileDelete).with_path(path)
    }

    /// `deps` are joined with commas into `new_snippet`.
    pub fn package_install<S: AsRef<str>>(deps: &[S]) -> Self {
        let joined = deps
            .iter()
            .map(|d| d.as_ref().trim())
            .filter(|d| !d.is_empty())
            .collect::<Vec<_>>()
            .join(",");
        Self::new(MicroTaskKind::PackageInstall).with_new_snippet(joined)
    }

    pub fn build_run() -> Self {
        Self::new(MicroTaskKind::BuildRun).with_new_snippet("npm run build")
    }

    pub fn test_run() -> Self {
        Self::new(MicroTaskKind::TestRun).with_new_snippet("npm test")
    }

    pub fn log_parse(output: impl Into<String>) -> Self {
        Self::new(MicroTaskKind::LogParse).with_new_snippet(output)
    }

    pub fn merge_resolve(path: impl Into<String>, resolved: impl Into<String>) -> Self {
        Self::new(MicroTaskKind::MergeResolve)
            .with_path(path)
            .with_new_snippet(resolved)
    }

    pub fn project_finish(summary: impl Into<String>) -> Self {
        Self::new(MicroTaskKind::ProjectFinish).with_new_snippet(summary)
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_new_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.new_snippet = Some(snippet.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self.retry_count = self.retry_count.min(max_retries);
        self
    }

    /// Dependencies named by a `package_install`, split on commas.
    pub fn dependencies(&self) -> Vec<String> {
        self.new_snippet
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn mark_in_progress(&mut self) {
        self.status = MicroTaskStatus::InProgress;
    }

    pub fn mark_completed(&mut self) {
        self.status = MicroTaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.error = None;
    }

    /// Record a failed attempt and apply the retry policy.
    ///
    /// Returns `true` when the micro-task was re-queued as pending.
    pub fn record_failure(&mut self, error: impl Into<String>) -> bool {
        self.error = Some(error.into());
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.status = MicroTaskStatus::Pending;
            true
        } else {
            self.status = MicroTaskStatus::Failed;
            self.completed_at = Some(Utc::now());
            false
        }
    }

    /// Mark failed without consuming retry budget (e.g. blocked before running).
    pub fn mark_blocked(&mut self, reason: impl Into<String>) {
        self.status = MicroTaskStatus::Failed;
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_requeues_until_budget_is_spent() {
        let mut micro = MicroTask::build_run().with_max_retries(2);

        assert!(micro.record_failure("first"));
        assert_eq!(micro.status, MicroTaskStatus::Pending);
        assert_eq!(micro.retry_count, 1);

        assert!(micro.record_failure("second"));
        assert_eq!(micro.retry_count, 2);

        assert!(!micro.record_failure("third"));
        assert_eq!(micro.status, MicroTaskStatus::Failed);
        assert_eq!(micro.retry_count, 2);
        assert_eq!(micro.error.as_deref(), Some("third"));
    }

    #[test]
    fn zero_budget_fails_immediately() {
        let mut micro = MicroTask::test_run().with_max_retries(0);
        assert!(!micro.record_failure("nope"));
        assert_eq!(micro.status, MicroTaskStatus::Failed);
        assert_eq!(micro.retry_count, 0);
    }

    #[test]
    fn package_install_joins_and_splits_dependencies() {
        let micro = MicroTask::package_install(&["react", " react-dom ", ""]);
        assert_eq!(micro.new_snippet.as_deref(), Some("react,react-dom"));
        assert_eq!(micro.dependencies(), vec!["react", "react-dom"]);
    }

    #[test]
    fn serializes_kind_as_type_field() {
        let micro = MicroTask::file_create("src/index.ts", "export {}");
        let json = serde_json::to_value(&micro).expect("serialize");
        assert_eq!(json["type"], "file_create");
        assert_eq!(json["newSnippet"], "export {}");
        assert_eq!(json["maxRetries"], 3);
    }

    #[test]
    fn deserializes_with_defaults() {
        let micro: MicroTask = serde_json::from_value(serde_json::json!({
            "id": "mt-1",
            "type": "file_delete",
            "path": "old.txt",
            "status": "pending",
            "createdAt": "2024-01-01T00:00:00Z"
        }))
        .expect("deserialize");
        assert_eq!(micro.kind, MicroTaskKind::FileDelete);
        assert_eq!(micro.retry_count, 0);
        assert_eq!(micro.max_retries, DEFAULT_MAX_RETRIES);
    }
}
