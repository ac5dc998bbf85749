use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;

use super::types::*;
use super::AppState;
use crate::indexer::types::{parse_address, BlacklistRecord};

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: msg.into(),
        }),
    )
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ============================================================
// Health & Stats
// ============================================================

pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    let stats = state.store.stats().await.map_err(internal)?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        cursors: stats
            .into_iter()
            .filter_map(|s| s.cursor)
            .map(|c| CursorStatus {
                network: c.network,
                token: c.token,
                last_synced_position: c.last_synced_position,
                last_synced_timestamp: c.last_synced_timestamp,
                last_sync_time: c.last_sync_time,
            })
            .collect(),
    }))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<StatsResponse> {
    let tokens = state.store.stats().await.map_err(internal)?;
    Ok(Json(StatsResponse {
        total_blacklisted: tokens.iter().map(|t| t.blacklisted_count).sum(),
        total_records: tokens.iter().map(|t| t.total_count).sum(),
        tokens,
    }))
}

// ============================================================
// Denylist
// ============================================================

pub async fn lookup(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
    Query(params): Query<RecordFilter>,
) -> ApiResult<LookupResponse> {
    let address = parse_address(&address).ok_or_else(|| {
        api_error(StatusCode::BAD_REQUEST, format!("Invalid address: {}", address))
    })?;
    let records = state
        .store
        .lookup(&address, params.token.as_deref(), params.network.as_deref())
        .await
        .map_err(internal)?;

    Ok(Json(LookupResponse {
        blacklisted: records.iter().any(|r| r.is_blacklisted),
        address,
        records,
    }))
}

pub async fn list_blacklisted(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecordFilter>,
) -> ApiResult<ListResponse> {
    let records = state
        .store
        .list_blacklisted(params.network.as_deref(), params.token.as_deref())
        .await
        .map_err(internal)?;
    Ok(Json(ListResponse {
        count: records.len(),
        records,
    }))
}

pub async fn export_csv(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecordFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let records = state
        .store
        .list_blacklisted(params.network.as_deref(), params.token.as_deref())
        .await
        .map_err(internal)?;
    let body = render_csv(&records).map_err(internal)?;
    Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], body))
}

pub fn render_csv(records: &[BlacklistRecord]) -> eyre::Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        writer.serialize(record)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| eyre::eyre!("Failed to flush CSV: {}", e))?;
    Ok(String::from_utf8(bytes)?)
}
