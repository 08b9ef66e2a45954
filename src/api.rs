use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use utoipa::OpenApi as UtoipaOpenApi;

use crate::backend::ShellRequest;
use crate::errors::{ConsoleError, ConsoleResult, ErrorBody};
use crate::models::{
    ContainerSummary, CreateContainerRequest, CreateContainerResponse, HealthResponse,
    HistoryResponse, LogsResponse, SessionState, SessionSummary,
};
use crate::service::AppState;
use crate::session::SessionManager;

const INDEX_HTML: &str = include_str!("../static/index.html");

#[derive(Deserialize)]
struct AttachParams {
    cols: Option<u16>,
    rows: Option<u16>,
}

#[derive(Deserialize)]
struct LogsParams {
    tail: Option<usize>,
}

#[derive(UtoipaOpenApi)]
#[openapi(
    paths(
        health,
        list_containers,
        create_container,
        inspect_container,
        start_container,
        stop_container,
        container_logs,
        container_history,
        clear_history,
        list_sessions,
        attach_shell,
    ),
    components(schemas(
        ContainerSummary,
        CreateContainerRequest,
        CreateContainerResponse,
        LogsResponse,
        HistoryResponse,
        SessionSummary,
        SessionState,
        HealthResponse,
        ErrorBody
    )),
    tags((name = "containers", description = "Manage local containers and attach shells"))
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(health))
        .route("/openapi.json", get(openapi))
        .route("/api/containers/json", get(list_containers))
        .route("/api/containers/create", post(create_container))
        .route("/api/containers/{id}/json", get(inspect_container))
        .route("/api/containers/{id}/start", post(start_container))
        .route("/api/containers/{id}/stop", post(stop_container))
        .route("/api/containers/{id}/logs", get(container_logs))
        .route(
            "/api/containers/{id}/history",
            get(container_history).delete(clear_history),
        )
        .route("/api/sessions", get(list_sessions))
        .route("/ws/{id}", any(attach_shell))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Container ids are passed to the runtime as positional arguments, so a
/// leading dash would be read as a flag.
pub fn validate_container_id(id: &str) -> ConsoleResult<()> {
    if id.trim().is_empty() {
        return Err(ConsoleError::InvalidRequest(
            "container id must not be empty".into(),
        ));
    }
    if id.starts_with('-') {
        return Err(ConsoleError::InvalidRequest(format!(
            "invalid container id '{id}'"
        )));
    }
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Server is healthy", body = HealthResponse))
)]
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        backend: state.backend.kind().as_str().to_string(),
        sessions: state.sessions.len(),
        history_containers: state.history.containers(),
        history_limit: state.history.limit(),
    })
}

#[utoipa::path(
    get,
    path = "/api/containers/json",
    responses(
        (status = 200, description = "All containers, running or not", body = [ContainerSummary]),
        (status = 502, description = "Runtime command failed", body = ErrorBody)
    )
)]
async fn list_containers(
    State(state): State<AppState>,
) -> ConsoleResult<Json<Vec<ContainerSummary>>> {
    let containers = state.service.list().await?;
    Ok(Json(containers))
}

#[utoipa::path(
    post,
    path = "/api/containers/create",
    request_body = CreateContainerRequest,
    responses(
        (status = 201, description = "Container created", body = CreateContainerResponse),
        (status = 400, description = "Bad request", body = ErrorBody)
    )
)]
async fn create_container(
    State(state): State<AppState>,
    Json(request): Json<CreateContainerRequest>,
) -> ConsoleResult<(StatusCode, Json<CreateContainerResponse>)> {
    let created = state.service.create(request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/api/containers/{id}/json",
    params(("id" = String, Path, description = "Container id or name")),
    responses(
        (status = 200, description = "Runtime inspect document"),
        (status = 404, description = "Container not found", body = ErrorBody)
    )
)]
async fn inspect_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ConsoleResult<Json<serde_json::Value>> {
    validate_container_id(&id)?;
    let document = state.service.inspect(id).await?;
    Ok(Json(document))
}

#[utoipa::path(
    post,
    path = "/api/containers/{id}/start",
    params(("id" = String, Path, description = "Container id or name")),
    responses(
        (status = 204, description = "Container started"),
        (status = 404, description = "Container not found", body = ErrorBody)
    )
)]
async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ConsoleResult<StatusCode> {
    validate_container_id(&id)?;
    state.service.start(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/containers/{id}/stop",
    params(("id" = String, Path, description = "Container id or name")),
    responses(
        (status = 204, description = "Container stopped"),
        (status = 404, description = "Container not found", body = ErrorBody)
    )
)]
async fn stop_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ConsoleResult<StatusCode> {
    validate_container_id(&id)?;
    state.service.stop(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/containers/{id}/logs",
    params(
        ("id" = String, Path, description = "Container id or name"),
        ("tail" = Option<usize>, Query, description = "Number of lines from the end")
    ),
    responses(
        (status = 200, description = "Log lines", body = LogsResponse),
        (status = 404, description = "Container not found", body = ErrorBody)
    )
)]
async fn container_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LogsParams>,
) -> ConsoleResult<Json<LogsResponse>> {
    validate_container_id(&id)?;
    let lines = state.service.logs(id, params.tail).await?;
    Ok(Json(LogsResponse { lines }))
}

#[utoipa::path(
    get,
    path = "/api/containers/{id}/history",
    params(("id" = String, Path, description = "Container id or name")),
    responses((status = 200, description = "Recorded shell output", body = HistoryResponse))
)]
async fn container_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ConsoleResult<Json<HistoryResponse>> {
    validate_container_id(&id)?;
    let chunks = state.history.replay(&id);
    let bytes = chunks.iter().map(|c| c.len()).sum();
    let content = String::from_utf8_lossy(&chunks.concat()).into_owned();
    let viewers = state.sessions.count_for(&id);
    Ok(Json(HistoryResponse {
        container_id: id,
        chunks: chunks.len(),
        bytes,
        viewers,
        content,
    }))
}

#[utoipa::path(
    delete,
    path = "/api/containers/{id}/history",
    params(("id" = String, Path, description = "Container id or name")),
    responses(
        (status = 204, description = "Recorded output discarded"),
        (status = 404, description = "Nothing recorded for this container", body = ErrorBody)
    )
)]
async fn clear_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ConsoleResult<StatusCode> {
    validate_container_id(&id)?;
    if !state.history.clear(&id) {
        return Err(ConsoleError::NotFound(id));
    }
    debug!("[api] cleared history for {}", id);
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/sessions",
    responses((status = 200, description = "Live shell sessions", body = [SessionSummary]))
)]
async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.list())
}

#[utoipa::path(
    get,
    path = "/ws/{id}",
    params(
        ("id" = String, Path, description = "Container id or name"),
        ("cols" = Option<u16>, Query, description = "Initial terminal width"),
        ("rows" = Option<u16>, Query, description = "Initial terminal height")
    ),
    responses(
        (status = 101, description = "Switched to a shell WebSocket"),
        (status = 400, description = "Not a valid WebSocket upgrade", body = ErrorBody)
    )
)]
async fn attach_shell(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<AttachParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!("[api] {}", ConsoleError::UpgradeFailed(rejection.body_text()));
            return rejection.into_response();
        }
    };
    if let Err(e) = validate_container_id(&id) {
        return e.into_response();
    }

    let request = ShellRequest::new(id, state.shell.clone()).with_size(params.cols, params.rows);
    let manager = SessionManager::new(
        request,
        state.backend.clone(),
        state.history.clone(),
        state.sessions.clone(),
    );

    ws.on_failed_upgrade(|e: axum::Error| {
        warn!("[api] {}", ConsoleError::UpgradeFailed(e.to_string()))
    })
    .on_upgrade(move |socket| async move {
        let id = manager.id();
        if let Err(e) = manager.run(socket).await {
            debug!("[api] session {} ended with error: {}", id, e);
        }
    })
}
