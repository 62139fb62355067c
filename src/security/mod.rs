//! Security auditor - static risk checks over proposed micro-tasks, plus rollback points.
//!
//! # Checks
//! | Check                  | Type                | Severity |
//! |------------------------|---------------------|----------|
//! | path leaves project    | `path_traversal`    | critical |
//! | extension not allowed  | `file_access`       | medium   |
//! | command not allowed    | `command_execution` | high     |
//! | injection pattern      | `command_execution` | critical |
//! | dynamic code execution | `code_injection`    | high     |
//! | outward network call   | `network_access`    | medium   |
//!
//! Content checks run over both the proposed file contents and the files
//! already in the project. `overall_risk` is the maximum severity found.

mod patterns;
mod rollback;

pub use patterns::{base_command, has_allowed_extension, is_allowed_command, ALLOWED_COMMANDS, ALLOWED_EXTENSIONS};
pub use rollback::{RollbackPoint, RollbackReport, MAX_ROLLBACK_POINTS};

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::fs_store::{contained_path, FileStore};
use crate::task::{MicroTask, MicroTaskKind, TaskId};
use patterns::{matching, CODE_EXECUTION, COMMAND_INJECTION, NETWORK_ACCESS, PATH_TRAVERSAL};
use rollback::RollbackStore;

/// Audits kept per task; older ones are evicted.
pub const MAX_AUDIT_HISTORY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    PathTraversal,
    FileAccess,
    CommandExecution,
    CodeInjection,
    NetworkAccess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityCheck {
    #[serde(rename = "type")]
    pub check_type: CheckType,
    pub severity: Severity,
    pub description: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl SecurityCheck {
    fn denied(check_type: CheckType, severity: Severity, description: String, details: Value) -> Self {
        Self {
            check_type,
            severity,
            description,
            allowed: false,
            details,
        }
    }
}

/// Result of one audit. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAudit {
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub checks: Vec<SecurityCheck>,
    pub overall_risk: Severity,
    pub recommendations: Vec<String>,
    pub vulnerabilities: Vec<String>,
}

impl SecurityAudit {
    pub fn is_critical(&self) -> bool {
        self.overall_risk == Severity::Critical
    }
}

/// A single operation to vet outside of a task audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecurityOperation {
    FileAccess { path: String },
    CommandExecution { command: String },
    NetworkAccess { content: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityVerdict {
    pub safe: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub risk_level: Severity,
    pub recommendations: Vec<String>,
}

impl SecurityVerdict {
    fn safe() -> Self {
        Self {
            safe: true,
            reason: None,
            risk_level: Severity::Low,
            recommendations: Vec::new(),
        }
    }

    fn unsafe_because(reason: String, risk_level: Severity) -> Self {
        Self {
            safe: false,
            recommendations: vec![reason.clone()],
            reason: Some(reason),
            risk_level,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityReport {
    pub task_id: TaskId,
    pub audit_history: Vec<SecurityAudit>,
    pub rollback_points: Vec<RollbackPoint>,
    pub recommendations: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SecurityError {
    #[error("No rollback points for task {0}")]
    NoRollbackPoints(String),

    #[error("Rollback point not found: {0}")]
    RollbackNotFound(String),

    #[error("Snapshot content missing for hash {0}")]
    MissingBlob(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// The command a micro-task would run, if it runs one.
pub fn audited_command(micro: &MicroTask) -> Option<String> {
    match micro.kind {
        MicroTaskKind::PackageInstall => {
            Some(format!("npm install {}", micro.dependencies().join(" ")))
        }
        MicroTaskKind::BuildRun | MicroTaskKind::TestRun => micro.new_snippet.clone(),
        _ => None,
    }
}

pub struct SecurityAuditor {
    file_store: Arc<dyn FileStore>,
    history: RwLock<HashMap<TaskId, VecDeque<SecurityAudit>>>,
    rollbacks: RollbackStore,
}

impl SecurityAuditor {
    pub fn new(file_store: Arc<dyn FileStore>) -> Self {
        Self {
            file_store,
            history: RwLock::new(HashMap::new()),
            rollbacks: RollbackStore::default(),
        }
    }

    /// Audit a batch of proposed micro-tasks against `project_path`.
    ///
    /// The audit is appended to the task's history before it is returned.
    pub async fn audit(
        &self,
        task_id: &TaskId,
        project_path: &Path,
        micro_tasks: &[MicroTask],
    ) -> SecurityAudit {
        let mut checks = Vec::new();
        for micro in micro_tasks {
            checks.extend(Self::check_paths(project_path, micro));
            checks.extend(Self::check_command(micro));
            if micro.kind.touches_file() {
                if let (Some(path), Some(content)) = (&micro.path, &micro.new_snippet) {
                    checks.extend(Self::check_content(path, content));
                }
            }
        }
        checks.extend(self.check_project(project_path).await);

        let overall_risk = checks
            .iter()
            .map(|c| c.severity)
            .max()
            .unwrap_or(Severity::Low);
        let vulnerabilities = checks
            .iter()
            .filter(|c| !c.allowed)
            .map(|c| c.description.clone())
            .collect();
        let audit = SecurityAudit {
            task_id: task_id.clone(),
            timestamp: Utc::now(),
            recommendations: recommendations_for(&checks),
            checks,
            overall_risk,
            vulnerabilities,
        };

        if audit.overall_risk >= Severity::High {
            tracing::warn!(
                task_id = %task_id,
                risk = ?audit.overall_risk,
                checks = audit.checks.len(),
                "Security audit flagged micro-tasks"
            );
        } else {
            tracing::debug!(task_id = %task_id, risk = ?audit.overall_risk, "Security audit passed");
        }

        let mut history = self.history.write().await;
        let list = history.entry(task_id.clone()).or_default();
        list.push_back(audit.clone());
        while list.len() > MAX_AUDIT_HISTORY {
            list.pop_front();
        }
        audit
    }

    fn check_paths(project_path: &Path, micro: &MicroTask) -> Vec<SecurityCheck> {
        let Some(path) = micro.path.as_deref() else {
            return Vec::new();
        };
        let mut checks = Vec::new();
        if contained_path(project_path, path).is_none() {
            checks.push(SecurityCheck::denied(
                CheckType::PathTraversal,
                Severity::Critical,
                format!("Access outside the project: {}", path),
                json!({ "path": path, "projectRoot": project_path }),
            ));
        }
        if !has_allowed_extension(path) {
            checks.push(SecurityCheck::denied(
                CheckType::FileAccess,
                Severity::Medium,
                format!("File extension not allowed: {}", path),
                json!({ "path": path }),
            ));
        }
        checks
    }

    fn check_command(micro: &MicroTask) -> Vec<SecurityCheck> {
        let Some(command) = audited_command(micro) else {
            return Vec::new();
        };
        let mut checks = Vec::new();
        if !is_allowed_command(&command) {
            checks.push(SecurityCheck::denied(
                CheckType::CommandExecution,
                Severity::High,
                format!("Command not allowed: {}", base_command(&command)),
                json!({ "command": command }),
            ));
        }
        for pattern in matching(&COMMAND_INJECTION, &command) {
            checks.push(SecurityCheck::denied(
                CheckType::CommandExecution,
                Severity::Critical,
                format!("Possible command injection ({}): {}", pattern, command),
                json!({ "command": command, "pattern": pattern }),
            ));
        }
        checks
    }

    fn check_content(path: &str, content: &str) -> Vec<SecurityCheck> {
        let mut checks = Vec::new();
        for pattern in matching(&CODE_EXECUTION, content) {
            checks.push(SecurityCheck::denied(
                CheckType::CodeInjection,
                Severity::High,
                format!("Dynamic code execution ({}) in {}", pattern, path),
                json!({ "path": path, "pattern": pattern }),
            ));
        }
        for pattern in matching(&NETWORK_ACCESS, content) {
            checks.push(SecurityCheck::denied(
                CheckType::NetworkAccess,
                Severity::Medium,
                format!("Network access ({}) in {}", pattern, path),
                json!({ "path": path, "pattern": pattern }),
            ));
        }
        checks
    }

    async fn check_project(&self, project_path: &Path) -> Vec<SecurityCheck> {
        match self.file_store.list_project_files(project_path).await {
            Ok(files) => files
                .iter()
                .flat_map(|(path, content)| Self::check_content(path, content))
                .collect(),
            Err(e) => vec![SecurityCheck::denied(
                CheckType::FileAccess,
                Severity::High,
                "Project files could not be scanned".to_string(),
                json!({ "error": format!("{:#}", e) }),
            )],
        }
    }

    /// Vet a single operation.
    pub fn is_operation_safe(&self, operation: &SecurityOperation) -> SecurityVerdict {
        match operation {
            SecurityOperation::FileAccess { path } => {
                if !matching(&PATH_TRAVERSAL, path).is_empty() || Path::new(path).is_absolute() {
                    return SecurityVerdict::unsafe_because(
                        format!("Path traversal detected: {}", path),
                        Severity::Critical,
                    );
                }
                if !has_allowed_extension(path) {
                    return SecurityVerdict::unsafe_because(
                        format!("File extension not allowed: {}", path),
                        Severity::Medium,
                    );
                }
                SecurityVerdict::safe()
            }
            SecurityOperation::CommandExecution { command } => {
                if !is_allowed_command(command) {
                    return SecurityVerdict::unsafe_because(
                        format!("Command not allowed: {}", base_command(command)),
                        Severity::High,
                    );
                }
                if let Some(pattern) = matching(&COMMAND_INJECTION, command).first() {
                    return SecurityVerdict::unsafe_because(
                        format!("Possible command injection ({})", pattern),
                        Severity::Critical,
                    );
                }
                SecurityVerdict::safe()
            }
            SecurityOperation::NetworkAccess { content } => {
                match matching(&NETWORK_ACCESS, content).first() {
                    Some(pattern) => SecurityVerdict::unsafe_because(
                        format!("Network access detected ({})", pattern),
                        Severity::Medium,
                    ),
                    None => SecurityVerdict::safe(),
                }
            }
        }
    }

    pub async fn history(&self, task_id: &TaskId) -> Vec<SecurityAudit> {
        self.history
            .read()
            .await
            .get(task_id)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn create_rollback_point(
        &self,
        task_id: &TaskId,
        description: &str,
        project_path: &Path,
    ) -> Result<RollbackPoint, SecurityError> {
        self.rollbacks
            .create(self.file_store.as_ref(), task_id, description, project_path)
            .await
    }

    pub async fn execute_rollback(
        &self,
        task_id: &TaskId,
        rollback_id: &str,
        project_path: &Path,
    ) -> Result<RollbackReport, SecurityError> {
        self.rollbacks
            .execute(self.file_store.as_ref(), task_id, rollback_id, project_path)
            .await
    }

    pub async fn rollback_points(&self, task_id: &TaskId) -> Vec<RollbackPoint> {
        self.rollbacks.list(task_id).await
    }

    pub async fn report(&self, task_id: &TaskId) -> SecurityReport {
        let audit_history = self.history(task_id).await;
        let all_checks: Vec<SecurityCheck> = audit_history
            .iter()
            .flat_map(|a| a.checks.iter().cloned())
            .collect();
        SecurityReport {
            task_id: task_id.clone(),
            recommendations: recommendations_for(&all_checks),
            audit_history,
            rollback_points: self.rollback_points(task_id).await,
            timestamp: Utc::now(),
        }
    }

    /// Drop audit history and rollback points of a deleted task.
    pub async fn forget(&self, task_id: &TaskId) {
        self.history.write().await.remove(task_id);
        self.rollbacks.forget(task_id).await;
    }
}

fn recommendations_for(checks: &[SecurityCheck]) -> Vec<String> {
    let has_severity = |s: Severity| checks.iter().any(|c| c.severity == s);
    let has_type = |t: CheckType| checks.iter().any(|c| c.check_type == t);

    let mut recommendations = Vec::new();
    if has_severity(Severity::Critical) {
        recommendations.push("CRITICAL: fix all critical findings before executing anything".to_string());
    }
    if has_severity(Severity::High) {
        recommendations.push("HIGH RISK: review and fix high-risk findings".to_string());
    }
    if has_type(CheckType::PathTraversal) {
        recommendations.push("Validate file paths to prevent path traversal".to_string());
    }
    if has_type(CheckType::CommandExecution) {
        recommendations.push("Review executed commands and stick to the allow-list".to_string());
    }
    if has_type(CheckType::CodeInjection) {
        recommendations.push("Remove or sanitize dynamically executed code".to_string());
    }
    if has_type(CheckType::NetworkAccess) {
        recommendations.push("Confirm outward network calls are intended".to_string());
    }
    if recommendations.is_empty() {
        recommendations.push("No specific recommendations".to_string());
    }
    recommendations
}
