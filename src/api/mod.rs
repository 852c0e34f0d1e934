pub mod chat;
pub mod health;
pub mod metrics;

use axum::Router;
use axum::routing::{any, get};

use crate::AppState;

/// Build the gateway router.
///
/// Route layout:
/// ```text
/// /chat/completion    any    (Bearer virtual key; non-POST answers 400)
/// /metrics            GET
/// /health?provider=   GET
/// ```
pub fn build_api_router() -> Router<AppState> {
    Router::new()
        .route("/chat/completion", any(chat::chat_completion))
        .route("/metrics", get(metrics::metrics))
        .route("/health", get(health::health_check))
}
