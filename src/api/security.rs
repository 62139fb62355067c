//! Security audit and rollback endpoints.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use super::error::ApiError;
use super::routes::AppState;
use super::types::RollbackRequest;
use crate::security::{
    RollbackPoint, RollbackReport, SecurityAudit, SecurityOperation, SecurityReport,
    SecurityVerdict,
};
use crate::task::TaskId;

/// Audit history, rollback points and recommendations of a task.
pub async fn report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SecurityReport>, ApiError> {
    let report = state
        .manager
        .security_report(&TaskId::from_string(id))
        .await?;
    Ok(Json(report))
}

/// Audit the task's pending micro-tasks now.
pub async fn audit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SecurityAudit>, ApiError> {
    let audit = state.manager.audit(&TaskId::from_string(id)).await?;
    Ok(Json(audit))
}

pub async fn list_rollbacks(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<RollbackPoint>>, ApiError> {
    let points = state
        .manager
        .rollback_points(&TaskId::from_string(id))
        .await?;
    Ok(Json(points))
}

/// Snapshot the project. The body is optional.
pub async fn create_rollback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Option<Json<RollbackRequest>>,
) -> Result<(StatusCode, Json<RollbackPoint>), ApiError> {
    let req = payload.map(|Json(req)| req).unwrap_or_default();
    let point = state
        .manager
        .create_rollback_point(&TaskId::from_string(id), req.description.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(point)))
}

pub async fn execute_rollback(
    State(state): State<Arc<AppState>>,
    Path((id, rollback_id)): Path<(String, String)>,
) -> Result<Json<RollbackReport>, ApiError> {
    let report = state
        .manager
        .execute_rollback(&TaskId::from_string(id), &rollback_id)
        .await?;
    Ok(Json(report))
}

/// Vet a single operation without a task.
pub async fn check(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SecurityOperation>, JsonRejection>,
) -> Result<Json<SecurityVerdict>, ApiError> {
    let Json(operation) = payload?;
    Ok(Json(state.manager.auditor().is_operation_safe(&operation)))
}

#[cfg(test)]
mod tests {
    use axum::response::IntoResponse;

    use super::*;
    use crate::config::Config;
    use crate::manager::TaskManager;
    use crate::security::Severity;

    fn state_in(dir: &std::path::Path) -> Arc<AppState> {
        let mut config = Config::new(dir.to_path_buf());
        config.auto_start = false;
        Arc::new(AppState {
            manager: TaskManager::from_config(config.clone()),
            config,
        })
    }

    #[tokio::test]
    async fn traversal_check_is_unsafe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_in(dir.path());
        let operation: SecurityOperation =
            serde_json::from_str(r#"{"type": "file_access", "path": "../../etc/passwd"}"#)
                .expect("valid operation");
        let Json(verdict) = check(State(state), Ok(Json(operation)))
            .await
            .expect("checked");
        assert!(!verdict.safe);
        assert_eq!(verdict.risk_level, Severity::Critical);
    }

    #[tokio::test]
    async fn rollback_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_in(dir.path());
        let task = state.manager.create("a todo app").await.expect("task");
        let id = task.id().to_string();
        std::fs::write(task.project_path().join("README.md"), "before").expect("seed");

        let (status, Json(point)) = create_rollback(
            State(Arc::clone(&state)),
            Path(id.clone()),
            Some(Json(RollbackRequest {
                description: Some("before edits".to_string()),
            })),
        )
        .await
        .expect("created");
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(point.description, "before edits");

        std::fs::write(task.project_path().join("README.md"), "after").expect("edit");
        let Json(report) = execute_rollback(
            State(Arc::clone(&state)),
            Path((id.clone(), point.id.clone())),
        )
        .await
        .expect("rolled back");
        assert_eq!(report.mismatches, vec!["modified README.md"]);

        let Json(points) = list_rollbacks(State(Arc::clone(&state)), Path(id.clone()))
            .await
            .expect("listed");
        assert_eq!(points.len(), 1);

        let missing = execute_rollback(State(state), Path((id, "rb-000000000000".to_string())))
            .await
            .expect_err("unknown point");
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn audit_of_a_fresh_task_is_low_risk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_in(dir.path());
        let task = state.manager.create("a todo app").await.expect("task");
        let Json(audit) = audit(State(Arc::clone(&state)), Path(task.id().to_string()))
            .await
            .expect("audited");
        assert_eq!(audit.overall_risk, Severity::Low);

        let Json(report) = report(State(state), Path(task.id().to_string()))
            .await
            .expect("report");
        assert_eq!(report.audit_history.len(), 1);
    }
}
