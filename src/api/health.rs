use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    pub provider: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub provider: String,
    pub available: bool,
}

/// GET /health?provider=<id>
///
/// Probes the provider's health URL. No authentication required.
pub async fn health_check(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> Result<Json<HealthResponse>, AppError> {
    let provider = query
        .provider
        .filter(|p| !p.is_empty())
        .ok_or(AppError::UnknownProvider)?;

    let report = state
        .health
        .probe(&provider)
        .await
        .ok_or(AppError::UnknownProvider)?;

    Ok(Json(HealthResponse {
        provider: report.provider,
        available: report.available,
    }))
}
