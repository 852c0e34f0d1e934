use axum::Json;
use axum::extract::State;

use crate::AppState;
use crate::error::AppError;
use crate::usage::{Metrics, UsageError};

/// GET /metrics
///
/// Aggregates the usage file without taking the store lock. The rename-based
/// writer guarantees a whole file; an unreadable or corrupt one is a 500.
pub async fn metrics(State(state): State<AppState>) -> Result<Json<Metrics>, AppError> {
    let usage = state.usage.snapshot_unlocked_async().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to load usage for metrics");
        match e {
            UsageError::Read(_) => AppError::Internal("Failed to read logs file".to_string()),
            _ => AppError::Internal("Failed to parse logs".to_string()),
        }
    })?;

    Ok(Json(Metrics::from_usage(&usage)))
}
