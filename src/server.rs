//! `ControlServer`: the local HTTP surface SDK clients drive the core
//! through. The teacher never built this (`cli::run_server` is an
//! acknowledged stub); this module follows the reference corpus's axum
//! handler style, a `State<AppState>` extractor, JSON in/out, structured
//! `tracing` spans per request, and the `axum` + `tower-http` dependency
//! pair carried by the larger browser-automation repo in the pack.

use crate::core::PercyCore;
use crate::model::SnapshotPayload;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

const DOM_JS: &str = "(() => { /* percy DOM-serialization script, served as a static asset */ })();";

#[derive(Clone)]
pub struct AppState {
    core: Arc<PercyCore>,
}

impl AppState {
    pub fn new(core: Arc<PercyCore>) -> Self {
        Self { core }
    }
}

#[derive(Serialize)]
struct SuccessBody {
    success: bool,
}

fn ok() -> Json<SuccessBody> {
    Json(SuccessBody { success: true })
}

#[derive(Serialize)]
struct SuccessEnvelope<T: Serialize> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorEnvelope {
            success: false,
            error: message.into(),
        }),
    )
        .into_response()
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/percy/healthcheck", get(healthcheck))
        .route("/percy/dom.js", get(dom_js))
        .route("/percy/idle", get(idle))
        .route("/percy/snapshot", post(snapshot))
        .route("/percy/stop", post(stop))
        .fallback(not_found)
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> Result<(), std::io::Error> {
    let app = router(state);
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    info!("control server listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

#[derive(Serialize)]
struct HealthcheckBody {
    loglevel: String,
    config: crate::config::Config,
    build: Option<crate::model::Build>,
}

async fn healthcheck(State(state): State<AppState>) -> Response {
    let config = state.core.effective_config().await;
    let build = state.core.current_build().await;
    Json(SuccessEnvelope {
        success: true,
        body: HealthcheckBody {
            loglevel: std::env::var("PERCY_LOGLEVEL").unwrap_or_else(|_| "info".to_string()),
            config,
            build,
        },
    })
    .into_response()
}

async fn dom_js() -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "application/javascript")],
        DOM_JS,
    )
        .into_response()
}

async fn idle(State(state): State<AppState>) -> Response {
    state.core.idle().await;
    ok().into_response()
}

async fn snapshot(State(state): State<AppState>, Json(payload): Json<SnapshotPayload>) -> Response {
    let concurrent = payload.concurrent;
    match state.core.snapshot(payload).await {
        std::result::Result::Ok(()) => {
            if !concurrent {
                state.core.idle().await;
            }
            ok().into_response()
        }
        Err(e) => {
            warn!("snapshot request failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn stop(State(state): State<AppState>) -> Response {
    state.core.stop().await;
    ok().into_response()
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}
