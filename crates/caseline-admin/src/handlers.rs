//! Admin API handlers.
//!
//! Each handler calls into `Database` and returns the uniform JSON envelope.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::de::DeserializeOwned;

use crate::AdminState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Parse an optional JSON body. An empty body yields the default.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| format!("invalid request body: {e}"))
}

// ── Pool ───────────────────────────────────────────────────────

/// GET /admin/pool
pub async fn pool_stats(State(state): State<AdminState>) -> impl IntoResponse {
    ApiResponse::ok(state.db.stats().await)
}

/// Prewarm request body.
#[derive(Debug, Default, serde::Deserialize)]
pub struct PrewarmRequest {
    pub target: Option<usize>,
}

/// POST /admin/pool/prewarm
pub async fn prewarm(State(state): State<AdminState>, body: Bytes) -> impl IntoResponse {
    let req: PrewarmRequest = match optional_body(&body) {
        Ok(req) => req,
        Err(e) => return error_response(&e, StatusCode::BAD_REQUEST).into_response(),
    };
    tracing::info!(target_depth = ?req.target, "admin prewarm requested");
    ApiResponse::ok(state.db.prewarm(req.target).await).into_response()
}

/// POST /admin/pool/sweep
pub async fn sweep(State(state): State<AdminState>) -> impl IntoResponse {
    tracing::info!("admin sweep requested");
    ApiResponse::ok(state.db.sweep().await)
}

// ── Credential cache ───────────────────────────────────────────

/// GET /admin/cache
pub async fn cache_stats(State(state): State<AdminState>) -> impl IntoResponse {
    ApiResponse::ok(state.db.cache_stats().await)
}

/// Cache clear request body.
#[derive(Debug, Default, serde::Deserialize)]
pub struct ClearCacheRequest {
    pub name: Option<String>,
}

/// POST /admin/cache/clear
pub async fn clear_cache(State(state): State<AdminState>, body: Bytes) -> impl IntoResponse {
    let req: ClearCacheRequest = match optional_body(&body) {
        Ok(req) => req,
        Err(e) => return error_response(&e, StatusCode::BAD_REQUEST).into_response(),
    };
    let cleared = state.db.clear_cache(req.name.as_deref()).await;
    tracing::info!(secret = ?req.name, cleared, "admin cache clear");
    ApiResponse::ok(serde_json::json!({ "cleared": cleared })).into_response()
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz(State(state): State<AdminState>) -> impl IntoResponse {
    if state.db.pool().is_closed() {
        return error_response("connection pool is closed", StatusCode::SERVICE_UNAVAILABLE)
            .into_response();
    }
    ApiResponse::ok("ok").into_response()
}
