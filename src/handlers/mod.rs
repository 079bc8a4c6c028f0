pub mod pixel;
pub mod verification;
pub mod webhooks;

use axum::{routing::get, Router};

use crate::db::AppState;

async fn health() -> &'static str {
    "ok"
}

pub fn health_router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
