//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::error::ApiError;
use super::security;
use super::types::*;
use crate::config::Config;
use crate::manager::{Subscription, TaskFilter, TaskManager};
use crate::streaming::{StreamKind, StreamStats, SWEEP_INTERVAL};
use crate::task::{TaskId, TaskLog, TaskUpdate};

/// Interval between SSE keep-alive comments.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub manager: Arc<TaskManager>,
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.projects_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.projects_dir.display()))?;

    let manager = TaskManager::from_config(config.clone());
    let sweeper =
        Arc::clone(manager.streamer()).spawn_sweeper(SWEEP_INTERVAL, manager.shutdown_token());

    let state = Arc::new(AppState {
        config: config.clone(),
        manager: Arc::clone(&manager),
    });
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        "Server listening on {} (projects in {})",
        addr,
        config.projects_dir.display()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&manager)))
        .await?;

    if let Err(e) = sweeper.await {
        tracing::warn!("Stream sweeper ended abnormally: {}", e);
    }
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/task", post(create_task))
        .route("/tasks", get(list_tasks))
        .route(
            "/task/:id",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/task/:id/status", get(task_status))
        .route("/task/:id/logs", get(task_logs))
        .route("/task/:id/iterate", post(iterate_task))
        .route("/task/:id/retry", post(retry_task))
        .route("/task/:id/cancel", post(cancel_task))
        .route("/task/:id/stream", get(stream_task))
        .route(
            "/task/:id/security",
            get(security::report).post(security::audit),
        )
        .route(
            "/task/:id/rollback",
            get(security::list_rollbacks).post(security::create_rollback),
        )
        .route(
            "/task/:id/rollback/:rollback_id",
            post(security::execute_rollback),
        )
        .route("/security/check", post(security::check))
        .route("/streams/stats", get(stream_stats))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wait for Ctrl-C or SIGTERM, then stop every task loop and close all streams.
async fn shutdown_signal(manager: Arc<TaskManager>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, cancelling running tasks...");
    manager.shutdown().await;
    tracing::info!("Graceful shutdown complete");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let manager = &state.manager;
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        llm_connected: manager.llm().is_connected().await,
        max_iterations: state.config.max_iterations,
        memory: manager.memory().stats().await,
        tasks: manager.stats().await,
        streams: manager.streamer().stats().await,
    })
}

async fn stream_stats(State(state): State<Arc<AppState>>) -> Json<StreamStats> {
    Json(state.manager.streamer().stats().await)
}

/// Create a new task.
async fn create_task(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), ApiError> {
    let Json(req) = payload?;
    let task = state.manager.create(&req.prompt).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateTaskResponse {
            task_id: task.id().clone(),
            status: task.status(),
            created_at: task.created_at(),
        }),
    ))
}

/// List tasks, newest first.
async fn list_tasks(
    State(state): State<Arc<AppState>>,
    query: Result<Query<TaskFilter>, QueryRejection>,
) -> Result<Json<Vec<TaskSummary>>, ApiError> {
    let Query(filter) = query?;
    let tasks = state.manager.list(&filter).await;
    Ok(Json(tasks.iter().map(TaskSummary::from).collect()))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskDetails>, ApiError> {
    let task = state.manager.get(&TaskId::from_string(id)).await?;
    Ok(Json(task.into()))
}

async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<TaskUpdate>, JsonRejection>,
) -> Result<Json<TaskDetails>, ApiError> {
    let Json(update) = payload?;
    let task = state
        .manager
        .update(&TaskId::from_string(id), update)
        .await?;
    Ok(Json(task.into()))
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.delete(&TaskId::from_string(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let id = TaskId::from_string(id);
    let task = state.manager.get(&id).await?;
    Ok(Json(TaskStatusResponse {
        task_id: id.clone(),
        status: task.status(),
        build_status: task.build_status(),
        test_status: task.test_status(),
        current_agent: task.current_agent().map(str::to_string),
        running: state.manager.is_running(&id).await?,
        counts: MicroTaskCounts::of(&task),
    }))
}

async fn task_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TaskLog>>, ApiError> {
    let logs = state.manager.logs(&TaskId::from_string(id)).await?;
    Ok(Json(logs))
}

/// Inject a user-directed correction.
async fn iterate_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<IterateRequest>, JsonRejection>,
) -> Result<Json<IterateResponse>, ApiError> {
    let Json(req) = payload?;
    let id = TaskId::from_string(id);
    let queued = state.manager.iterate(&id, &req.message).await?;
    Ok(Json(IterateResponse {
        task_id: id,
        queued,
    }))
}

async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RetryResponse>, ApiError> {
    let id = TaskId::from_string(id);
    let reset = state.manager.retry(&id).await?;
    Ok(Json(RetryResponse { task_id: id, reset }))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskDetails>, ApiError> {
    let task = state.manager.cancel(&TaskId::from_string(id)).await?;
    Ok(Json(task.into()))
}

fn frame<T: Serialize>(name: &str, data: &T) -> Event {
    Event::default()
        .event(name)
        .json_data(data)
        .unwrap_or_else(|e| {
            tracing::warn!("Failed to encode {} frame: {}", name, e);
            Event::default().event("error").data("frame encoding failed")
        })
}

/// Stream task logs via SSE.
///
/// Existing logs are replayed first, then live logs follow. A `done` frame
/// closes the stream once the task settles.
async fn stream_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Subscription {
        task,
        finished,
        mut receiver,
    } = state.manager.subscribe(&TaskId::from_string(id)).await?;
    let backlog = task.logs().to_vec();
    let summary = json!({ "taskId": task.id(), "status": task.status() });

    let stream = async_stream::stream! {
        for log in &backlog {
            yield Ok(frame("log", log));
        }

        if finished {
            yield Ok(frame("done", &summary));
        } else {
            loop {
                match receiver.recv().await {
                    Ok(message) => match message.kind {
                        StreamKind::Log => yield Ok(frame("log", &message.data)),
                        StreamKind::Complete => {
                            yield Ok(frame("done", &message.data));
                            break;
                        }
                        kind => yield Ok(frame(kind.as_str(), &message)),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        yield Ok(frame(
                            "error",
                            &json!({ "message": format!("stream lagged; {} message(s) dropped", skipped) }),
                        ));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    ))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::streaming::{StreamMessage, STREAM_BUFFER};
    use crate::task::{LogLevel, TaskStatus};

    fn state_in(dir: &std::path::Path) -> Arc<AppState> {
        let mut config = Config::new(dir.to_path_buf());
        config.auto_start = false;
        Arc::new(AppState {
            manager: TaskManager::from_config(config.clone()),
            config,
        })
    }

    async fn create(state: &Arc<AppState>, prompt: &str) -> CreateTaskResponse {
        let (status, Json(created)) = create_task(
            State(Arc::clone(state)),
            Ok(Json(CreateTaskRequest {
                prompt: prompt.to_string(),
            })),
        )
        .await
        .expect("created");
        assert_eq!(status, StatusCode::CREATED);
        created
    }

    #[tokio::test]
    async fn create_then_fetch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_in(dir.path());
        let created = create(&state, "a todo app").await;
        assert_eq!(created.status, TaskStatus::Pending);

        let Json(details) = get_task(State(Arc::clone(&state)), Path(created.task_id.to_string()))
            .await
            .expect("found");
        assert_eq!(details.task.prompt(), "a todo app");
        assert_eq!(details.counts.total, 0);

        let Json(status) = task_status(State(state), Path(created.task_id.to_string()))
            .await
            .expect("status");
        assert!(!status.running);
    }

    #[tokio::test]
    async fn status_update_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_in(dir.path());
        let created = create(&state, "a todo app").await;

        let Json(updated) = update_task(
            State(Arc::clone(&state)),
            Path(created.task_id.to_string()),
            Ok(Json(TaskUpdate::status(TaskStatus::InProgress))),
        )
        .await
        .expect("updated");
        assert_eq!(updated.task.status(), TaskStatus::InProgress);
        assert_eq!(updated.task.prompt(), "a todo app");
        assert_eq!(updated.task.created_at(), created.created_at);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_in(dir.path());

        let empty = create_task(
            State(Arc::clone(&state)),
            Ok(Json(CreateTaskRequest {
                prompt: "  ".to_string(),
            })),
        )
        .await
        .expect_err("rejected");
        assert_eq!(empty.into_response().status(), StatusCode::BAD_REQUEST);

        let missing = get_task(State(Arc::clone(&state)), Path("nope".to_string()))
            .await
            .expect_err("missing");
        assert_eq!(missing.code(), "not_found");
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);

        let created = create(&state, "a todo app").await;
        let conflict = retry_task(State(state), Path(created.task_id.to_string()))
            .await
            .expect_err("not failed");
        assert_eq!(conflict.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_in(dir.path());
        let first = create(&state, "first").await;
        create(&state, "second").await;
        cancel_task(State(Arc::clone(&state)), Path(first.task_id.to_string()))
            .await
            .expect("cancelled");

        let Json(cancelled) = list_tasks(
            State(state),
            Ok(Query(TaskFilter {
                status: Some(TaskStatus::Cancelled),
                ..Default::default()
            })),
        )
        .await
        .expect("listed");
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, first.task_id);
    }

    #[tokio::test]
    async fn health_reports_offline_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_in(dir.path());
        create(&state, "a todo app").await;
        let Json(health) = health(State(state)).await;
        assert_eq!(health.status, "ok");
        assert!(!health.llm_connected);
        assert_eq!(health.tasks.total, 1);
        assert_eq!(health.streams.total, 1);
    }

    #[tokio::test]
    async fn delete_then_fetch_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_in(dir.path());
        let created = create(&state, "a todo app").await;
        let status = delete_task(State(Arc::clone(&state)), Path(created.task_id.to_string()))
            .await
            .expect("deleted");
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(get_task(State(state), Path(created.task_id.to_string()))
            .await
            .is_err());
    }

    /// `(event, data)` pairs of a complete SSE body, comments skipped.
    fn sse_frames(body: &str) -> Vec<(String, serde_json::Value)> {
        body.split("\n\n")
            .filter_map(|frame| {
                let mut event = None;
                let mut data = String::new();
                for line in frame.lines() {
                    if let Some(value) = line.strip_prefix("event:") {
                        event = Some(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("data:") {
                        data.push_str(value.trim_start());
                    }
                }
                let data = serde_json::from_str(&data).unwrap_or(serde_json::Value::Null);
                event.map(|event| (event, data))
            })
            .collect()
    }

    async fn open_stream(state: &Arc<AppState>, id: &TaskId) -> axum::response::Response {
        let response = router(Arc::clone(state))
            .oneshot(
                Request::builder()
                    .uri(format!("/task/{}/stream", id))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        response
    }

    async fn read_frames(response: axum::response::Response) -> Vec<(String, serde_json::Value)> {
        let collected = tokio::time::timeout(Duration::from_secs(5), response.into_body().collect())
            .await
            .expect("stream ended")
            .expect("body");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        sse_frames(&body)
    }

    #[tokio::test]
    async fn stream_replays_backlog_then_follows_until_complete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_in(dir.path());
        let created = create(&state, "a todo app").await;
        let id = created.task_id;
        let backlog = state.manager.logs(&id).await.expect("logs").len();
        assert!(backlog > 0);

        let response = open_stream(&state, &id).await;
        let streamer = state.manager.streamer();
        let live = TaskLog::new(LogLevel::Info, "live entry");
        streamer.publish(&id, StreamMessage::log(&id, &live)).await;
        streamer
            .publish(&id, StreamMessage::complete(&id, json!({ "status": "completed" })))
            .await;
        streamer
            .publish(&id, StreamMessage::log(&id, &TaskLog::new(LogLevel::Info, "too late")))
            .await;

        let frames = read_frames(response).await;
        assert_eq!(frames.len(), backlog + 2);
        assert!(frames[..backlog].iter().all(|(event, _)| event == "log"));
        assert_eq!(frames[backlog].0, "log");
        assert_eq!(frames[backlog].1["message"], "live entry");
        assert_eq!(frames[backlog + 1].0, "done");
        assert_eq!(frames[backlog + 1].1["status"], "completed");
    }

    #[tokio::test]
    async fn lagging_stream_reports_dropped_messages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_in(dir.path());
        let id = create(&state, "a todo app").await.task_id;
        let backlog = state.manager.logs(&id).await.expect("logs").len();

        let response = open_stream(&state, &id).await;
        let streamer = state.manager.streamer();
        let overflow = 20;
        for i in 0..(STREAM_BUFFER + overflow) {
            let entry = TaskLog::new(LogLevel::Info, format!("entry {}", i));
            streamer.publish(&id, StreamMessage::log(&id, &entry)).await;
        }
        streamer
            .publish(&id, StreamMessage::complete(&id, json!({ "status": "completed" })))
            .await;

        let frames = read_frames(response).await;
        let (event, data) = &frames[backlog];
        assert_eq!(event, "error");
        assert!(data["message"]
            .as_str()
            .is_some_and(|m| m.contains(&format!("{} message(s) dropped", overflow + 1))));
        assert_eq!(frames.last().map(|(event, _)| event.as_str()), Some("done"));
        assert_eq!(frames.len(), backlog + 1 + STREAM_BUFFER);
    }

    #[tokio::test]
    async fn stream_of_a_settled_task_ends_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state_in(dir.path());
        let id = create(&state, "a todo app").await.task_id;
        state.manager.cancel(&id).await.expect("cancel");
        let backlog = state.manager.logs(&id).await.expect("logs").len();

        let frames = read_frames(open_stream(&state, &id).await).await;
        assert_eq!(frames.len(), backlog + 1);
        let (event, data) = &frames[backlog];
        assert_eq!(event, "done");
        assert_eq!(data["status"], "cancelled");
    }
}
