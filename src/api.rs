use crate::config::ConnectionMode;
use crate::errors::{MonitorError, Result};
use crate::notifier::{Delivery, Notification, Notifier};
use crate::realtime::ManagerHandle;
use crate::registry::{NewPrinter, PrinterId, PrinterRecord, Registry};
use crate::sink::{CardSnapshot, SnapshotSink};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// HTTP API server state
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<Mutex<Registry>>,
    pub manager: ManagerHandle,
    pub cards: SnapshotSink,
    pub notifier: Notifier,
    pub mode: ConnectionMode,
    /// Monitor start time for uptime calculation
    pub start_time: std::time::Instant,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub mode: ConnectionMode,
}

/// One printer as shown on the dashboard
#[derive(Debug, Serialize)]
pub struct PrinterView {
    #[serde(flatten)]
    pub record: PrinterRecord,
    pub card: Option<CardSnapshot>,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshInterval {
    pub seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct ToggleResponse {
    pub id: PrinterId,
    pub disabled: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let error_string = self.to_string();
        let (status, message) = match self {
            MonitorError::PrinterNotFound(id) => {
                (StatusCode::NOT_FOUND, format!("Printer {} not found", id))
            }
            MonitorError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            MonitorError::Config(msg) => (StatusCode::BAD_REQUEST, msg),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            details: Some(error_string),
        });

        (status, body).into_response()
    }
}

/// GET /health
async fn handle_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        mode: state.mode,
    })
}

/// GET /printers - records in display order with their latest cards
async fn handle_list_printers(State(state): State<ApiState>) -> Json<Vec<PrinterView>> {
    let registry = state.registry.lock().await;
    let views = registry
        .records()
        .iter()
        .map(|record| PrinterView {
            card: state.cards.get(record.id),
            record: record.clone(),
        })
        .collect();
    Json(views)
}

/// Apply a registry mutation on the blocking pool, since it persists through `std::fs`
async fn mutate_registry<T, F>(state: &ApiState, mutate: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Registry) -> Result<T> + Send + 'static,
{
    let mut registry = state.registry.clone().lock_owned().await;
    tokio::task::spawn_blocking(move || mutate(&mut registry))
        .await
        .map_err(|e| MonitorError::Other(anyhow::anyhow!("registry task failed: {}", e)))?
}

/// POST /printers
async fn handle_add_printer(
    State(state): State<ApiState>,
    Json(input): Json<NewPrinter>,
) -> Result<(StatusCode, Json<PrinterRecord>)> {
    let record = mutate_registry(&state, move |registry| registry.add_printer(input)).await?;
    info!("Printer added via API: {} ({})", record.name, record.id);
    Ok((StatusCode::CREATED, Json(record)))
}

/// DELETE /printers/:id
async fn handle_remove_printer(
    State(state): State<ApiState>,
    Path(id): Path<PrinterId>,
) -> Result<StatusCode> {
    let removed = mutate_registry(&state, move |registry| registry.remove_printer(id)).await?;
    info!("Printer removed via API: {} ({})", removed.name, id);
    Ok(StatusCode::NO_CONTENT)
}

/// POST /printers/:id/toggle
async fn handle_toggle_printer(
    State(state): State<ApiState>,
    Path(id): Path<PrinterId>,
) -> Result<Json<ToggleResponse>> {
    let disabled = mutate_registry(&state, move |registry| registry.toggle_disabled(id)).await?;
    debug!("Printer {} disabled={}", id, disabled);
    Ok(Json(ToggleResponse { id, disabled }))
}

/// PUT /printers/:id/name
async fn handle_rename_printer(
    State(state): State<ApiState>,
    Path(id): Path<PrinterId>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<PrinterRecord>> {
    let record = mutate_registry(&state, move |registry| {
        registry.rename_printer(id, &request.name)
    })
    .await?;
    Ok(Json(record))
}

/// GET /settings/refresh-interval
async fn handle_get_refresh_interval(State(state): State<ApiState>) -> Json<RefreshInterval> {
    let seconds = state.registry.lock().await.refresh_interval_secs();
    Json(RefreshInterval { seconds })
}

/// PUT /settings/refresh-interval
async fn handle_set_refresh_interval(
    State(state): State<ApiState>,
    Json(request): Json<RefreshInterval>,
) -> Result<Json<RefreshInterval>> {
    let seconds = mutate_registry(&state, move |registry| {
        registry.set_refresh_interval(request.seconds)?;
        Ok(registry.refresh_interval_secs())
    })
    .await?;
    Ok(Json(RefreshInterval { seconds }))
}

/// POST /monitor/pause - close every channel and cancel reconnects
async fn handle_pause(State(state): State<ApiState>) -> StatusCode {
    state.manager.stop_all();
    StatusCode::ACCEPTED
}

/// POST /monitor/resume
async fn handle_resume(State(state): State<ApiState>) -> StatusCode {
    state.manager.start_all();
    StatusCode::ACCEPTED
}

/// GET /monitor/sessions
async fn handle_sessions(State(state): State<ApiState>) -> Result<Json<serde_json::Value>> {
    let sessions = state.manager.sessions().await?;
    Ok(Json(serde_json::to_value(sessions)?))
}

/// POST /notifications/test
async fn handle_test_notification(State(state): State<ApiState>) -> Result<Json<serde_json::Value>> {
    let notifier = state.notifier.clone();
    let delivery = tokio::task::spawn_blocking(move || {
        notifier.deliver(&Notification::new(
            "Moonraker Fleet Monitor",
            "Notifications are working.",
        ))
    })
    .await
    .map_err(|e| MonitorError::Other(anyhow::anyhow!("notification task failed: {}", e)))?;

    let delivered = match delivery {
        Delivery::Native => "native",
        Delivery::Alert => "alert",
        Delivery::Logged => "logged",
    };
    Ok(Json(serde_json::json!({ "delivery": delivered })))
}

/// Create HTTP API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/printers", get(handle_list_printers).post(handle_add_printer))
        .route("/printers/:id", delete(handle_remove_printer))
        .route("/printers/:id/toggle", post(handle_toggle_printer))
        .route("/printers/:id/name", put(handle_rename_printer))
        .route(
            "/settings/refresh-interval",
            get(handle_get_refresh_interval).put(handle_set_refresh_interval),
        )
        .route("/monitor/pause", post(handle_pause))
        .route("/monitor/resume", post(handle_resume))
        .route("/monitor/sessions", get(handle_sessions))
        .route("/notifications/test", post(handle_test_notification))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(AllowOrigin::predicate(|origin, _| {
                            let o = origin.as_bytes();
                            // Local dashboards only
                            o.starts_with(b"http://localhost")
                                || o.starts_with(b"https://localhost")
                                || o.starts_with(b"http://127.0.0.1")
                        }))
                        .allow_methods([
                            axum::http::Method::GET,
                            axum::http::Method::POST,
                            axum::http::Method::PUT,
                            axum::http::Method::DELETE,
                            axum::http::Method::OPTIONS,
                        ])
                        .allow_headers(tower_http::cors::Any),
                ),
        )
        .with_state(state)
}

/// Start HTTP API server
pub async fn start_api_server(addr: &str, state: ApiState) -> Result<()> {
    let router = create_router(state);

    info!("Starting HTTP API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router).await.map_err(|e| {
        error!("HTTP API server error: {}", e);
        MonitorError::Io(e)
    })
}
