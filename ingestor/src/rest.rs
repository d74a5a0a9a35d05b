use crate::errors::Error;
use crate::model::{HistoryResponse, LatestValue};
use crate::service::{normalize_limit, SensorDataService};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, warn, Level};

#[derive(Clone)]
struct AppState {
    service: Arc<SensorDataService>,
}

/// Raw paging parameters; anything unparsable counts as zero.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    limit: Option<String>,
    offset: Option<String>,
}

impl HistoryQuery {
    fn paging(&self) -> (i64, i64) {
        let parse = |raw: &Option<String>| {
            raw.as_deref()
                .and_then(|v| v.trim().parse::<i64>().ok())
                .unwrap_or(0)
        };
        (normalize_limit(parse(&self.limit)), parse(&self.offset).max(0))
    }
}

pub fn create_router(service: Arc<SensorDataService>) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/devices/:id/latest", get(get_latest))
        .route("/devices/:id/history", get(get_history))
        .with_state(state)
}

/// Per-request tracing, and a 500 instead of a dropped connection when a
/// handler panics.
pub fn instrument(router: Router) -> Router {
    router
        .layer(CatchPanicLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

async fn get_latest(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<LatestValue>, ApiError> {
    if device_id.is_empty() {
        return Err(ApiError(Error::EmptyDeviceId));
    }

    let latest = state.service.latest_value(&device_id).await?;
    Ok(Json(latest))
}

async fn get_history(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    if device_id.is_empty() {
        return Err(ApiError(Error::EmptyDeviceId));
    }

    let (limit, offset) = params.paging();
    let data = state.service.history(&device_id, limit, offset).await?;

    let total = match state.service.history_count(&device_id).await {
        Ok(total) => total,
        Err(e) => {
            warn!(device_id = %device_id, "History count failed, reporting page size: {}", e);
            data.len() as i64
        }
    };

    Ok(Json(HistoryResponse {
        data,
        total,
        limit,
        offset,
    }))
}

#[derive(Debug)]
struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::EmptyDeviceId => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => {
                error!("API error: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}
