use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use std::collections::BTreeMap;

use super::store::{latest_per_key, to_i64, DenylistStore, StoreError};
use crate::indexer::types::{BlacklistEvent, BlacklistRecord, Checkpoint, SyncCursor, TokenStats};

const RECORD_COLUMNS: &str = "address, token, network, is_blacklisted, block_number, log_index, \
     transaction_hash, event_timestamp, first_seen, last_updated";

type RecordRow = (
    String,
    String,
    String,
    bool,
    i64,
    i64,
    String,
    i64,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn row_to_record(row: RecordRow) -> BlacklistRecord {
    let (
        address,
        token,
        network,
        is_blacklisted,
        block_number,
        log_index,
        transaction_hash,
        event_timestamp,
        first_seen,
        last_updated,
    ) = row;
    BlacklistRecord {
        address,
        token,
        network,
        is_blacklisted,
        block_number: block_number.max(0) as u64,
        log_index: log_index.max(0) as u64,
        transaction_hash,
        event_timestamp: event_timestamp.max(0) as u64,
        first_seen,
        last_updated,
    }
}

/// Postgres-backed denylist store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and bring the schema up to date.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Multi-row upsert; a row only replaces the stored one when it is later in
/// chain order. Chunks into groups of 1000 to stay within PostgreSQL
/// parameter limits.
async fn upsert_records(
    conn: &mut PgConnection,
    events: &[BlacklistEvent],
) -> Result<usize, StoreError> {
    let reduced = latest_per_key(events);
    if reduced.is_empty() {
        return Ok(0);
    }

    let now = Utc::now();
    let mut rows = Vec::with_capacity(reduced.len());
    for event in &reduced {
        rows.push((
            event,
            to_i64("block_number", event.block_number)?,
            to_i64("log_index", event.log_index)?,
            to_i64("event_timestamp", event.timestamp)?,
        ));
    }

    let mut written = 0;
    for chunk in rows.chunks(1000) {
        let mut query_builder: sqlx::QueryBuilder<sqlx::Postgres> =
            sqlx::QueryBuilder::new(format!("INSERT INTO blacklist ({RECORD_COLUMNS}) "));

        query_builder.push_values(chunk, |mut b, (event, block_number, log_index, timestamp)| {
            b.push_bind(&event.address)
                .push_bind(&event.token)
                .push_bind(&event.network)
                .push_bind(event.direction.is_blacklisted())
                .push_bind(*block_number)
                .push_bind(*log_index)
                .push_bind(&event.transaction_hash)
                .push_bind(*timestamp)
                .push_bind(now)
                .push_bind(now);
        });

        query_builder.push(
            " ON CONFLICT (address, token, network) DO UPDATE \
             SET is_blacklisted = EXCLUDED.is_blacklisted, \
                 block_number = EXCLUDED.block_number, \
                 log_index = EXCLUDED.log_index, \
                 transaction_hash = EXCLUDED.transaction_hash, \
                 event_timestamp = EXCLUDED.event_timestamp, \
                 last_updated = EXCLUDED.last_updated \
             WHERE (blacklist.block_number, blacklist.log_index) \
                 < (EXCLUDED.block_number, EXCLUDED.log_index)",
        );
        let result = query_builder.build().execute(&mut *conn).await?;
        written += result.rows_affected() as usize;
    }

    Ok(written)
}

async fn upsert_cursor(
    conn: &mut PgConnection,
    network: &str,
    token: &str,
    checkpoint: Checkpoint,
) -> Result<(), StoreError> {
    let timestamp = checkpoint
        .timestamp
        .map(|ts| to_i64("last_synced_timestamp", ts))
        .transpose()?;

    sqlx::query(
        "INSERT INTO sync_cursor
             (network, token, last_synced_position, last_synced_timestamp, last_sync_time)
         VALUES ($1, $2, $3, $4, NOW())
         ON CONFLICT (network, token) DO UPDATE
         SET last_synced_position = $3, last_synced_timestamp = $4, last_sync_time = NOW()",
    )
    .bind(network)
    .bind(token)
    .bind(to_i64("last_synced_position", checkpoint.position)?)
    .bind(timestamp)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[async_trait]
impl DenylistStore for PgStore {
    async fn commit_window(
        &self,
        network: &str,
        token: &str,
        events: &[BlacklistEvent],
        checkpoint: Checkpoint,
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let written = upsert_records(&mut *tx, events).await?;
        upsert_cursor(&mut *tx, network, token, checkpoint).await?;
        tx.commit().await?;
        Ok(written)
    }

    async fn upsert(&self, events: &[BlacklistEvent]) -> Result<usize, StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_records(&mut *conn, events).await
    }

    async fn load_cursor(
        &self,
        network: &str,
        token: &str,
    ) -> Result<Option<SyncCursor>, StoreError> {
        let row: Option<(i64, Option<i64>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT last_synced_position, last_synced_timestamp, last_sync_time
             FROM sync_cursor
             WHERE network = $1 AND token = $2",
        )
        .bind(network)
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(position, timestamp, time)| SyncCursor {
            network: network.to_string(),
            token: token.to_string(),
            last_synced_position: position.max(0) as u64,
            last_synced_timestamp: timestamp.map(|ts| ts.max(0) as u64),
            last_sync_time: time,
        }))
    }

    async fn reset(&self, network: &str, token: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM blacklist WHERE network = $1 AND token = $2")
            .bind(network)
            .bind(token)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM sync_cursor WHERE network = $1 AND token = $2")
            .bind(network)
            .bind(token)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn lookup(
        &self,
        address: &str,
        token: Option<&str>,
        network: Option<&str>,
    ) -> Result<Vec<BlacklistRecord>, StoreError> {
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM blacklist
             WHERE address = $1
               AND ($2::text IS NULL OR token = $2)
               AND ($3::text IS NULL OR network = $3)
             ORDER BY network, token"
        ))
        .bind(address)
        .bind(token)
        .bind(network)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_record).collect())
    }

    async fn list_blacklisted(
        &self,
        network: Option<&str>,
        token: Option<&str>,
    ) -> Result<Vec<BlacklistRecord>, StoreError> {
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM blacklist
             WHERE is_blacklisted
               AND ($1::text IS NULL OR network = $1)
               AND ($2::text IS NULL OR token = $2)
             ORDER BY network, token, block_number"
        ))
        .bind(network)
        .bind(token)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_record).collect())
    }

    async fn stats(&self) -> Result<Vec<TokenStats>, StoreError> {
        let counts: Vec<(String, String, i64, i64)> = sqlx::query_as(
            "SELECT network, token,
                    COUNT(*) FILTER (WHERE is_blacklisted),
                    COUNT(*)
             FROM blacklist GROUP BY network, token",
        )
        .fetch_all(&self.pool)
        .await?;

        let cursors: Vec<(String, String, i64, Option<i64>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT network, token, last_synced_position, last_synced_timestamp, last_sync_time
             FROM sync_cursor",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: BTreeMap<(String, String), TokenStats> = BTreeMap::new();
        for (network, token, blacklisted, total) in counts {
            grouped.insert(
                (network.clone(), token.clone()),
                TokenStats {
                    network,
                    token,
                    blacklisted_count: blacklisted.max(0) as u64,
                    total_count: total.max(0) as u64,
                    cursor: None,
                },
            );
        }
        for (network, token, position, timestamp, time) in cursors {
            let entry = grouped
                .entry((network.clone(), token.clone()))
                .or_insert_with(|| TokenStats {
                    network: network.clone(),
                    token: token.clone(),
                    blacklisted_count: 0,
                    total_count: 0,
                    cursor: None,
                });
            entry.cursor = Some(SyncCursor {
                network,
                token,
                last_synced_position: position.max(0) as u64,
                last_synced_timestamp: timestamp.map(|ts| ts.max(0) as u64),
                last_sync_time: time,
            });
        }

        Ok(grouped.into_values().collect())
    }
}
