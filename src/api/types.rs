use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::indexer::types::{BlacklistRecord, TokenStats};

// ============================================================
// Query params
// ============================================================

#[derive(Debug, Default, Deserialize)]
pub struct RecordFilter {
    pub network: Option<String>,
    pub token: Option<String>,
}

// ============================================================
// Response types
// ============================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub cursors: Vec<CursorStatus>,
}

#[derive(Debug, Serialize)]
pub struct CursorStatus {
    pub network: String,
    pub token: String,
    pub last_synced_position: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_timestamp: Option<u64>,
    pub last_sync_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct LookupResponse {
    pub address: String,
    /// True when any matching record is currently denylisted.
    pub blacklisted: bool,
    pub records: Vec<BlacklistRecord>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub count: usize,
    pub records: Vec<BlacklistRecord>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_blacklisted: u64,
    pub total_records: u64,
    pub tokens: Vec<TokenStats>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
