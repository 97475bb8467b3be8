use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection, rejection::PathRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use taskhub_api::{ApiError, ApiResult};
use taskhub_storage::Task;

use crate::auth::Identity;
use crate::server::AppState;
use crate::tasks::TaskInput;
use crate::timeout::RequestDeadline;

fn task_id(path: Result<Path<i64>, PathRejection>) -> ApiResult<i64> {
    match path {
        Ok(Path(id)) if id > 0 => Ok(id),
        _ => Err(ApiError::bad_request("invalid task id")),
    }
}

fn body(payload: Result<Json<TaskInput>, JsonRejection>) -> ApiResult<TaskInput> {
    payload
        .map(|Json(input)| input)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn readyz(State(state): State<AppState>) -> Response {
    let cache = match state.cache.ping().await {
        Ok(()) => "up",
        Err(e) => {
            tracing::warn!(error = %e, "cache backend not ready");
            "down"
        }
    };
    let status = if cache == "up" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if status == StatusCode::OK { "ok" } else { "degraded" },
        "storage": state.tasks.store().backend_name(),
        "cache": { "mode": state.cache.mode(), "status": cache },
        "lock": { "mode": state.tasks.locks().mode() },
    });
    (status, Json(body)).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics_enabled.then(crate::metrics::render_metrics).flatten() {
        Some(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        None => ApiError::not_found("metrics are disabled").into_response(),
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

pub async fn create_task(
    State(state): State<AppState>,
    RequestDeadline(cx): RequestDeadline,
    identity: Identity,
    payload: Result<Json<TaskInput>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let input = body(payload)?;
    let task = state.tasks.create(&cx, identity.user_id, input).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    RequestDeadline(cx): RequestDeadline,
    identity: Identity,
) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(state.tasks.list(&cx, identity.user_id).await?))
}

pub async fn get_task(
    State(state): State<AppState>,
    RequestDeadline(cx): RequestDeadline,
    identity: Identity,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Task>> {
    let id = task_id(path)?;
    Ok(Json(state.tasks.get(&cx, id, identity.user_id).await?))
}

pub async fn update_task(
    State(state): State<AppState>,
    RequestDeadline(cx): RequestDeadline,
    identity: Identity,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<TaskInput>, JsonRejection>,
) -> ApiResult<Json<Task>> {
    let id = task_id(path)?;
    let input = body(payload)?;
    Ok(Json(
        state.tasks.update(&cx, id, identity.user_id, input).await?,
    ))
}

pub async fn delete_task(
    State(state): State<AppState>,
    RequestDeadline(cx): RequestDeadline,
    identity: Identity,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<StatusCode> {
    let id = task_id(path)?;
    state.tasks.delete(&cx, id, identity.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
