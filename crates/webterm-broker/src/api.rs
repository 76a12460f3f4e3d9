use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::{OpenApi as UtoipaOpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;
use webterm_containers::{ContainerRecord, ContainerService, ContainerStats};

use crate::broker::{Broker, SessionStats};
use crate::channel;

#[derive(Clone)]
pub struct AppState {
    pub containers: Arc<dyn ContainerService>,
    pub broker: Arc<Broker>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(containers: Arc<dyn ContainerService>, broker: Arc<Broker>) -> Self {
        Self {
            containers,
            broker,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateContainerResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListContainersResponse {
    pub containers: Vec<ContainerRecord>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ContainerStatsResponse {
    pub containers: Vec<ContainerStats>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteContainerResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndSessionRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndSessionResponse {
    pub success: bool,
    pub containers_cleaned_up: usize,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerminalDisconnectRequest {
    pub socket_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerminalDisconnectResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_stopped: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerminalStatsResponse {
    pub active_sessions: usize,
    pub sessions: Vec<SessionStats>,
    pub containers: ContainerStatsResponse,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerServiceHealth {
    pub status: String,
    pub containers: usize,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerminalHealthResponse {
    pub status: String,
    pub uptime: u64,
    pub active_sessions: usize,
    pub container_service: ContainerServiceHealth,
}

#[derive(UtoipaOpenApi)]
#[openapi(
    paths(
        health,
        create_container,
        list_containers,
        container_stats,
        delete_container,
        end_session,
        terminal_stats,
        terminal_disconnect,
        terminal_health,
    ),
    components(schemas(
        HealthResponse,
        CreateContainerResponse,
        ListContainersResponse,
        ContainerStatsResponse,
        DeleteContainerResponse,
        EndSessionRequest,
        EndSessionResponse,
        TerminalDisconnectRequest,
        TerminalDisconnectResponse,
        TerminalStatsResponse,
        TerminalHealthResponse,
        ContainerServiceHealth,
        ContainerRecord,
        ContainerStats,
        SessionStats,
    )),
    tags((name = "webterm", description = "Terminal broker administration"))
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(Any);

    let openapi = ApiDoc::openapi();
    let swagger_routes: Router<AppState> =
        SwaggerUi::new("/docs").url("/openapi.json", openapi).into();

    Router::new()
        .route("/health", get(health))
        .route("/terminal", get(terminal_channel))
        .route("/api/containers/create", post(create_container))
        .route("/api/containers/list", get(list_containers))
        .route("/api/containers/stats", get(container_stats))
        .route("/api/containers/end-session", post(end_session))
        .route("/api/containers/{id}", delete(delete_container))
        .route("/api/terminal-stats", get(terminal_stats))
        .route("/api/terminal-disconnect", post(terminal_disconnect))
        .route("/api/terminal-health", get(terminal_health))
        .merge(swagger_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn terminal_channel(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let broker = state.broker.clone();
    ws.on_upgrade(move |socket| channel::handle_socket(broker, socket))
        .into_response()
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "container-service".to_string(),
    })
}

#[utoipa::path(
    post,
    path = "/api/containers/create",
    responses((status = 200, description = "Container created (or failure report)", body = CreateContainerResponse))
)]
async fn create_container(State(state): State<AppState>) -> Json<CreateContainerResponse> {
    match state.containers.create().await {
        Ok(container) => Json(CreateContainerResponse {
            success: true,
            container: Some(container),
            error: None,
        }),
        Err(err) => {
            warn!(%err, "container create failed");
            Json(CreateContainerResponse {
                success: false,
                container: None,
                error: Some(err.to_string()),
            })
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/containers/list",
    responses((status = 200, description = "Known containers", body = ListContainersResponse))
)]
async fn list_containers(
    State(state): State<AppState>,
) -> Result<Json<ListContainersResponse>, webterm_containers::ContainerError> {
    let containers = state.containers.list().await?;
    Ok(Json(ListContainersResponse { containers }))
}

#[utoipa::path(
    get,
    path = "/api/containers/stats",
    responses((status = 200, description = "Per-container stats", body = ContainerStatsResponse))
)]
async fn container_stats(
    State(state): State<AppState>,
) -> Result<Json<ContainerStatsResponse>, webterm_containers::ContainerError> {
    let mut containers = state.containers.stats().await?;
    // A container attached to a live session counts as active regardless
    // of how recently bytes flowed.
    let attached = state.broker.attached_container_ids();
    for stats in &mut containers {
        if attached.contains(&stats.container_id) {
            stats.is_active = true;
        }
    }
    Ok(Json(ContainerStatsResponse { containers }))
}

#[utoipa::path(
    delete,
    path = "/api/containers/{id}",
    params(("id" = String, Path, description = "Container id")),
    responses((status = 200, description = "Container stopped", body = DeleteContainerResponse))
)]
async fn delete_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<DeleteContainerResponse> {
    match state.containers.stop(&id).await {
        Ok(()) => Json(DeleteContainerResponse {
            success: true,
            message: format!("Container {id} stopped"),
        }),
        Err(err) => Json(DeleteContainerResponse {
            success: false,
            message: err.to_string(),
        }),
    }
}

#[utoipa::path(
    post,
    path = "/api/containers/end-session",
    request_body = EndSessionRequest,
    responses((status = 200, description = "Session ended", body = EndSessionResponse))
)]
async fn end_session(
    State(state): State<AppState>,
    Json(request): Json<EndSessionRequest>,
) -> Json<EndSessionResponse> {
    let Ok(socket_id) = Uuid::parse_str(&request.session_id) else {
        return Json(EndSessionResponse {
            success: false,
            containers_cleaned_up: 0,
        });
    };

    match state.broker.end_session(socket_id) {
        Some(had_container) => Json(EndSessionResponse {
            success: true,
            containers_cleaned_up: usize::from(had_container),
        }),
        None => Json(EndSessionResponse {
            success: false,
            containers_cleaned_up: 0,
        }),
    }
}

#[utoipa::path(
    get,
    path = "/api/terminal-stats",
    responses((status = 200, description = "Combined session and container stats", body = TerminalStatsResponse))
)]
async fn terminal_stats(
    State(state): State<AppState>,
) -> Result<Json<TerminalStatsResponse>, webterm_containers::ContainerError> {
    let sessions = state.broker.stats();
    let containers = state.containers.stats().await?;
    Ok(Json(TerminalStatsResponse {
        active_sessions: sessions.len(),
        sessions,
        containers: ContainerStatsResponse { containers },
    }))
}

#[utoipa::path(
    post,
    path = "/api/terminal-disconnect",
    request_body = TerminalDisconnectRequest,
    responses((status = 200, description = "Session force-disconnected", body = TerminalDisconnectResponse))
)]
async fn terminal_disconnect(
    State(state): State<AppState>,
    Json(request): Json<TerminalDisconnectRequest>,
) -> Json<TerminalDisconnectResponse> {
    let Ok(socket_id) = Uuid::parse_str(&request.socket_id) else {
        return Json(TerminalDisconnectResponse {
            success: false,
            container_stopped: None,
        });
    };

    match state.broker.force_disconnect(socket_id) {
        Some(had_container) => Json(TerminalDisconnectResponse {
            success: true,
            container_stopped: Some(had_container),
        }),
        None => Json(TerminalDisconnectResponse {
            success: false,
            container_stopped: None,
        }),
    }
}

#[utoipa::path(
    get,
    path = "/api/terminal-health",
    responses((status = 200, description = "Broker health", body = TerminalHealthResponse))
)]
async fn terminal_health(
    State(state): State<AppState>,
) -> Result<Json<TerminalHealthResponse>, webterm_containers::ContainerError> {
    let containers = state.containers.list().await?;
    Ok(Json(TerminalHealthResponse {
        status: "healthy".to_string(),
        uptime: state.started_at.elapsed().as_secs(),
        active_sessions: state.broker.len(),
        container_service: ContainerServiceHealth {
            status: "healthy".to_string(),
            containers: containers.len(),
        },
    }))
}
