//! HTTP surface of the gate.
//!
//! Every mutating endpoint answers `{code, message}`; errors use HTTP 500
//! with the error's numeric code.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use keel_core::app::{
    Gate, ReassignmentEngine, SessionManager, StatusOutput, StatusQuery, TaskStore, query_status,
};
use keel_core::domain::{TaskDefinition, validate_task_name};
use keel_core::GateError;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::stream::stream_handler;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TaskStore>,
    pub sessions: Arc<SessionManager>,
    pub engine: Arc<ReassignmentEngine>,
    pub node: String,
}

impl AppState {
    pub fn from_gate(gate: &Gate) -> Self {
        Self {
            store: Arc::clone(gate.store()),
            sessions: Arc::clone(gate.sessions()),
            engine: Arc::clone(gate.engine()),
            node: gate.identity().key(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/scheduler/stream", get(stream_handler))
        .route("/scheduler/task", post(create_task))
        .route("/scheduler/task/:name", delete(delete_task).put(update_task))
        .route("/scheduler/task/:name/stop", post(stop_task))
        .route("/scheduler/status", get(status))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize)]
struct Reply {
    code: u32,
    message: String,
}

impl Reply {
    fn ok() -> Json<Reply> {
        Json(Reply {
            code: 0,
            message: String::new(),
        })
    }
}

/// Wraps [`GateError`] so handlers can use `?`.
pub struct ApiError(GateError);

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(GateError::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(GateError::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        warn!(code = err.code(), error = %err, "request failed");
        let body = Reply {
            code: err.code(),
            message: err.to_string(),
        };
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct Health {
    status: &'static str,
    node: String,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        node: state.node,
    })
}

async fn create_task(
    State(state): State<AppState>,
    body: Result<Json<TaskDefinition>, JsonRejection>,
) -> ApiResult<Json<Reply>> {
    let Json(definition) = body?;
    state.engine.submit(definition).await?;
    Ok(Reply::ok())
}

async fn update_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<TaskDefinition>, JsonRejection>,
) -> ApiResult<Json<Reply>> {
    let Json(definition) = body?;
    state.store.update(&name, definition).await?;
    Ok(Reply::ok())
}

async fn stop_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Reply>> {
    validate_task_name(&name)?;
    state.store.stop(&name).await?;
    Ok(Reply::ok())
}

async fn delete_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Reply>> {
    validate_task_name(&name)?;
    state.store.delete(&name).await?;
    Ok(Reply::ok())
}

async fn status(
    State(state): State<AppState>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let response = match query_status(&state.store, &query).await? {
        StatusOutput::Table(text) => {
            ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response()
        }
        StatusOutput::Json(page) => Json(page).into_response(),
    };
    Ok(response)
}
