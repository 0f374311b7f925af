use std::{convert::Infallible, path::PathBuf, time::Duration};

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::{Stream, StreamExt};
use tower_http::{
    cors::CorsLayer, services::ServeDir, set_header::SetResponseHeaderLayer, trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{coordinator::ScanCoordinator, error::ScanError, targets, types::SessionState};

#[derive(Clone)]
pub struct AppState {
    coordinator: ScanCoordinator,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    /// Newline-separated targets.
    pub targets: String,
    #[serde(default = "default_threads")]
    pub threads: i64,
}

fn default_threads() -> i64 {
    50
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartResponse {
    pub status: String,
    pub session_id: u64,
    pub count: usize,
    pub skipped: usize,
    pub duplicates: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopResponse {
    pub status: SessionState,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ScanError {
    fn into_response(self) -> Response {
        let status = match self {
            ScanError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ScanError::SessionBusy(_) => StatusCode::CONFLICT,
        };
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the HTTP app: JSON API under `/api`, optional static UI as fallback.
pub fn router(coordinator: ScanCoordinator, ui_dir: Option<PathBuf>) -> Router {
    let state = AppState { coordinator };

    let api = Router::new()
        .route("/scan/start", post(post_start))
        .route("/scan/stop", post(post_stop))
        .route("/events", get(get_events))
        .route("/status", get(get_status))
        .route("/results", get(get_results))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    match ui_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true)),
        None => app,
    }
}

pub async fn spawn_server(bind: &str, coordinator: ScanCoordinator, ui_dir: Option<PathBuf>) -> Result<()> {
    let app = router(coordinator, ui_dir);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("serving API on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn post_start(
    State(app): State<AppState>,
    payload: Result<Json<ScanRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ScanError> {
    let Json(req) = payload.map_err(|e| ScanError::InvalidInput(e.body_text()))?;
    let parsed = targets::parse_targets_str(&req.targets);
    if parsed.is_empty() {
        return Err(ScanError::InvalidInput("no valid targets provided".into()));
    }
    let threads = usize::try_from(req.threads).unwrap_or(0);
    let count = parsed.len();
    let ticket = app.coordinator.start(parsed.targets, threads)?;
    if parsed.malformed > 0 {
        warn!(skipped = parsed.malformed, "malformed target lines skipped");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            status: "started".into(),
            session_id: ticket.session_id,
            count,
            skipped: parsed.malformed,
            duplicates: parsed.duplicates,
        }),
    ))
}

async fn post_stop(State(app): State<AppState>) -> impl IntoResponse {
    let status = app.coordinator.stop();
    (StatusCode::OK, Json(StopResponse { status }))
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.coordinator.snapshot()))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.coordinator.results()))
}

async fn get_events(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // The subscription lives inside the stream; axum drops it on disconnect.
    let stream = app.coordinator.subscribe().filter_map(|event| {
        match serde_json::to_string(&event) {
            Ok(data) => Some(Ok(Event::default().data(data))),
            Err(e) => {
                warn!("failed to encode scan event: {e}");
                None
            }
        }
    });
    Sse::new(stream).keep_alive(default_keep_alive())
}

fn default_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive")
}
