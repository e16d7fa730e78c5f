//! Actix Web server exposing the WebSocket endpoint and the HTTP surface.
//!
//! `/ws` upgrades into a segmentation session; `/health` reports liveness
//! and the advertised model presets; `/metrics` exposes the Prometheus
//! registry. Cross-origin requests are unrestricted: the gateway is meant to
//! sit behind a tunnel during demos.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use actix_web::http::header;
use actix_web::middleware::DefaultHeaders;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use seg_core::{ModelMode, ModelPool};
use serde::Serialize;
use tracing::info;

use crate::gateway::config::GatewayConfig;
use crate::gateway::{session, telemetry};

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Shared state backing every handler.
pub(crate) struct AppState {
    pub(crate) config: Arc<GatewayConfig>,
    pub(crate) pool: Arc<ModelPool>,
    pub(crate) active_sessions: AtomicUsize,
    session_counter: AtomicU64,
}

impl AppState {
    pub(crate) fn new(config: Arc<GatewayConfig>, pool: Arc<ModelPool>) -> Self {
        Self {
            config,
            pool,
            active_sessions: AtomicUsize::new(0),
            session_counter: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    active_sessions: usize,
    available_modes: Vec<&'static str>,
    loaded_modes: Vec<&'static str>,
    models: Vec<ModelInfo>,
}

#[derive(Serialize)]
struct ModelInfo {
    mode: &'static str,
    name: &'static str,
    input_size: (i64, i64),
    num_classes: usize,
    expected_fps: u32,
    memory_mb: u32,
}

impl ModelInfo {
    fn for_mode(mode: ModelMode) -> Self {
        let profile = mode.profile();
        Self {
            mode: mode.as_str(),
            name: profile.name,
            input_size: profile.input_size,
            num_classes: mode.num_classes(),
            expected_fps: profile.expected_fps,
            memory_mb: profile.memory_mb,
        }
    }
}

/// Upgrade a connection into a segmentation session.
async fn ws_route(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<Arc<AppState>>,
) -> actix_web::Result<HttpResponse> {
    let (response, session, msg_stream) = actix_ws::handle(&req, body)?;
    actix_web::rt::spawn(session::run_session(
        session,
        msg_stream,
        state.get_ref().clone(),
    ));
    Ok(response)
}

/// Liveness and capability probe.
async fn health_route(state: web::Data<Arc<AppState>>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy",
        active_sessions: state.active_sessions.load(Ordering::SeqCst),
        available_modes: ModelMode::ALL.iter().map(|mode| mode.as_str()).collect(),
        loaded_modes: state
            .pool
            .loaded_modes()
            .into_iter()
            .map(|mode| mode.as_str())
            .collect(),
        models: ModelMode::ALL.into_iter().map(ModelInfo::for_mode).collect(),
    })
}

/// Prometheus exposition of the gateway metrics.
async fn metrics_route() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

pub(crate) fn app_config(state: Arc<AppState>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |service| {
        service
            .app_data(web::Data::new(state))
            .route("/ws", web::get().to(ws_route))
            .route("/health", web::get().to(health_route))
            .route("/metrics", web::get().to(metrics_route));
    }
}

/// Run the gateway until the process is asked to stop.
///
/// Blocks the calling thread on a dedicated actix system, mirroring the
/// binary's synchronous entry point.
pub fn run(config: GatewayConfig, pool: Arc<ModelPool>) -> Result<(), ServeError> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(Arc::new(config), pool));

    actix_web::rt::System::new().block_on(async move {
        let bind_addr = addr.clone();
        let factory_state = state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .wrap(
                    DefaultHeaders::new()
                        .add((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
                        .add((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
                        .add((header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")),
                )
                .configure(app_config(factory_state.clone()))
        })
        .bind(&bind_addr)
        .map_err(|source| ServeError::Bind {
            addr: bind_addr,
            source,
        })?;

        info!("segmentation gateway listening on http://{addr} (ws at /ws)");
        info!(
            "reply encoding: {:?} q{}, max {}x{}; clients advised to send JPEG at q{}",
            state.config.reply_format,
            state.config.reply_quality,
            state.config.max_reply_width,
            state.config.max_reply_height,
            state.config.inbound_quality_hint
        );
        server.run().await.map_err(ServeError::Runtime)
    })
}
