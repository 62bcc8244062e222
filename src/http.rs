use crate::aqi::{to_aqi, Category};
use crate::publish::{LatestReading, StatusSnapshot};
use crate::reading::CorrectedReading;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct HttpState {
    pub latest: Arc<LatestReading>,
    pub publish_window: Duration,
}

#[derive(Debug, Deserialize)]
struct AqiQuery {
    pm2_5: Option<String>,
}

#[derive(Debug, Serialize)]
struct AqiResponse {
    pm2_5: f64,
    aqi: u32,
    aqi_color: u32,
    category: Category,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_current(
    State(state): State<HttpState>,
) -> Result<Json<CorrectedReading>, (StatusCode, String)> {
    state
        .latest
        .current(Utc::now(), state.publish_window)
        .map(Json)
        .ok_or((
            StatusCode::NOT_FOUND,
            "no fresh reading available".to_string(),
        ))
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusSnapshot> {
    Json(state.latest.stats().snapshot())
}

/// Index for an already corrected concentration, for callers holding stored values.
async fn get_aqi(Query(query): Query<AqiQuery>) -> Result<Json<AqiResponse>, (StatusCode, String)> {
    let raw = query
        .pm2_5
        .ok_or((StatusCode::BAD_REQUEST, "pm2_5 is required".to_string()))?;
    let pm2_5 = raw
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value >= 0.0)
        .ok_or((
            StatusCode::BAD_REQUEST,
            format!("pm2_5 must be a non-negative number, got {raw:?}"),
        ))?;
    let index = to_aqi(pm2_5);
    Ok(Json(AqiResponse {
        pm2_5,
        aqi: index.aqi,
        aqi_color: index.color,
        category: index.category,
    }))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/current", get(get_current))
        .route("/v1/status", get(get_status))
        .route("/v1/aqi", get(get_aqi))
        .with_state(state)
}
