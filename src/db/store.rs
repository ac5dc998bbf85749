use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::indexer::types::{
    BlacklistEvent, BlacklistRecord, Checkpoint, RecordKey, SyncCursor, TokenStats,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{column} value {value} does not fit the column type")]
    OutOfRange { column: &'static str, value: u64 },
}

/// Persistence for denylist records and per-(network, token) sync cursors.
///
/// Writes are key-scoped and idempotent, so drivers for different networks
/// share one handle without further locking.
#[async_trait]
pub trait DenylistStore: Send + Sync {
    /// Apply one window's events and move the cursor to `checkpoint` as a
    /// single unit. Returns the number of records written.
    ///
    /// A record is only replaced by an event later in chain order, compared
    /// as (block, log index).
    async fn commit_window(
        &self,
        network: &str,
        token: &str,
        events: &[BlacklistEvent],
        checkpoint: Checkpoint,
    ) -> Result<usize, StoreError>;

    /// Apply events without touching any cursor (live path).
    async fn upsert(&self, events: &[BlacklistEvent]) -> Result<usize, StoreError>;

    async fn load_cursor(
        &self,
        network: &str,
        token: &str,
    ) -> Result<Option<SyncCursor>, StoreError>;

    /// Drop every record and the cursor for (network, token). Used by full resync.
    async fn reset(&self, network: &str, token: &str) -> Result<u64, StoreError>;

    async fn lookup(
        &self,
        address: &str,
        token: Option<&str>,
        network: Option<&str>,
    ) -> Result<Vec<BlacklistRecord>, StoreError>;

    async fn list_blacklisted(
        &self,
        network: Option<&str>,
        token: Option<&str>,
    ) -> Result<Vec<BlacklistRecord>, StoreError>;

    async fn stats(&self) -> Result<Vec<TokenStats>, StoreError>;
}

/// Order a batch by chain position and keep only the last event per key.
///
/// The result is sorted by (block, log index) so writers can apply it in order.
pub fn latest_per_key(events: &[BlacklistEvent]) -> Vec<BlacklistEvent> {
    let mut ordered: Vec<&BlacklistEvent> = events.iter().collect();
    ordered.sort_by_key(|e| (e.block_number, e.log_index));

    let mut latest: HashMap<RecordKey, &BlacklistEvent> = HashMap::with_capacity(ordered.len());
    for event in ordered {
        latest.insert(event.key(), event);
    }

    let mut reduced: Vec<BlacklistEvent> = latest.into_values().cloned().collect();
    reduced.sort_by(|a, b| {
        (a.block_number, a.log_index)
            .cmp(&(b.block_number, b.log_index))
            .then_with(|| a.address.cmp(&b.address))
    });
    reduced
}

pub(crate) fn to_i64(column: &'static str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange { column, value })
}
