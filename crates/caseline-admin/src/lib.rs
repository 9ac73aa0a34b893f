//! caseline-admin — operational endpoints for the connection pool.
//!
//! Read-only statistics plus the administrative triggers into the credential
//! cache and the prewarmer. Not meant for business traffic; bind it to a
//! private interface.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/admin/pool` | Pool depth, capacity, connection ages |
//! | POST | `/admin/pool/prewarm` | Prewarm to `{ "target": n }` or the configured target |
//! | POST | `/admin/pool/sweep` | Run a reaper sweep now |
//! | GET | `/admin/cache` | Cached secrets, their ages and secret-service health |
//! | POST | `/admin/cache/clear` | Drop `{ "name": "..." }` or every cached secret |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use caseline_db::Database;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub db: Database,
}

/// Build the admin router.
pub fn build_router(db: Database) -> Router {
    let state = AdminState { db };

    let admin_routes = Router::new()
        .route("/pool", get(handlers::pool_stats))
        .route("/pool/prewarm", post(handlers::prewarm))
        .route("/pool/sweep", post(handlers::sweep))
        .route("/cache", get(handlers::cache_stats))
        .route("/cache/clear", post(handlers::clear_cache))
        .with_state(state.clone());

    Router::new()
        .nest("/admin", admin_routes)
        .route("/healthz", get(handlers::healthz).with_state(state))
}
