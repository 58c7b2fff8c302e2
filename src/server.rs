use axum::{
    Json, Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::AppState;
use crate::intake::{Processor, WatchConfig};
use crate::state::StatusSnapshot;

/// Operator-supplied intake settings, staged until the next start. Doubles
/// as the configure request body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlSettings {
    pub watch_folder: Option<String>,
    pub output_folder: Option<String>,
    pub api_key: Option<String>,
    #[serde(default)]
    pub blocked_terms: Vec<String>,
}

/// Start the control-surface server with the provided state.
pub async fn start_server(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Control surface started"
    );

    axum::serve(listener, app).await?;
    Ok(())
}

/// Router for the control-panel boundary: configure / start / stop / status.
pub fn build_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(30);
    Router::new()
        .route("/api/configure", post(api_configure))
        .route("/api/start", post(api_start))
        .route("/api/stop", post(api_stop))
        .route("/api/status", get(api_status))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(
            move |req: Request, next: Next| {
                let duration = timeout;
                async move {
                    match tokio::time::timeout(duration, next.run(req)).await {
                        Ok(res) => res,
                        Err(_) => {
                            (StatusCode::REQUEST_TIMEOUT, "Request timed out").into_response()
                        }
                    }
                }
            },
        ))
        .with_state(state)
}

/// Build a processor from the currently staged settings and start it.
///
/// Shared by the start endpoint and `--autostart`.
pub async fn start_from_settings(state: &AppState) -> anyhow::Result<()> {
    let settings = state
        .settings
        .lock()
        .expect("settings lock poisoned")
        .clone();
    let watch_dir = settings
        .watch_folder
        .ok_or_else(|| anyhow::anyhow!("watch_folder is not configured"))?;
    let output_dir = settings
        .output_folder
        .ok_or_else(|| anyhow::anyhow!("output_folder is not configured"))?;
    let api_key = settings
        .api_key
        .or_else(|| state.config.api.key.clone())
        .ok_or_else(|| anyhow::anyhow!("API credential is not configured"))?;

    let mut slot = state.processor.lock().await;
    if let Some(active) = slot.as_ref() {
        if active.status().running {
            anyhow::bail!("watcher is already running");
        }
    }

    let config = WatchConfig::new(
        watch_dir,
        output_dir,
        settings.blocked_terms,
        state.config.api.base_url.clone(),
        api_key,
        state.config.api.model.clone(),
    );
    let processor = Arc::new(Processor::new(config));
    processor.start()?;
    *slot = Some(processor);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AckResponse {
    ok: bool,
    message: String,
}

/// POST /api/configure - stage settings; applied when the next run starts.
async fn api_configure(
    State(state): State<AppState>,
    Json(req): Json<ControlSettings>,
) -> Json<AckResponse> {
    {
        let mut settings = state.settings.lock().expect("settings lock poisoned");
        *settings = req;
    }
    info!("intake settings staged");
    Json(AckResponse {
        ok: true,
        message: "configuration staged; applied on next start".to_string(),
    })
}

/// POST /api/start - build a fresh processor from staged settings, start it.
async fn api_start(
    State(state): State<AppState>,
) -> Result<Json<AckResponse>, (StatusCode, String)> {
    match start_from_settings(&state).await {
        Ok(()) => Ok(Json(AckResponse {
            ok: true,
            message: "watcher started".to_string(),
        })),
        Err(err) => {
            warn!(error = %err, "start rejected");
            Err((StatusCode::BAD_REQUEST, err.to_string()))
        }
    }
}

/// POST /api/stop - stop and discard the live processor.
async fn api_stop(State(state): State<AppState>) -> Json<AckResponse> {
    let taken = state.processor.lock().await.take();
    match taken {
        Some(processor) => {
            processor.stop().await;
            Json(AckResponse {
                ok: true,
                message: "watcher stopped".to_string(),
            })
        }
        None => Json(AckResponse {
            ok: false,
            message: "watcher is not running".to_string(),
        }),
    }
}

/// GET /api/status - thread-safe view of the run state.
async fn api_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    let snapshot = match state.processor.lock().await.as_ref() {
        Some(processor) => processor.status(),
        None => StatusSnapshot::idle(),
    };
    Json(snapshot)
}
