//! In-memory store backend for tests and database-less runs.
//!
//! All data is lost when the process exits.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use super::store::{latest_per_key, DenylistStore, StoreError};
use crate::indexer::types::{
    BlacklistEvent, BlacklistRecord, Checkpoint, RecordKey, SyncCursor, TokenStats,
};

#[derive(Default)]
struct State {
    records: BTreeMap<RecordKey, BlacklistRecord>,
    cursors: HashMap<(String, String), SyncCursor>,
}

impl State {
    fn apply(&mut self, events: &[BlacklistEvent]) -> usize {
        let now = Utc::now();
        let mut written = 0;
        for event in latest_per_key(events) {
            let key = event.key();
            match self.records.get_mut(&key) {
                Some(existing)
                    if (existing.block_number, existing.log_index)
                        >= (event.block_number, event.log_index) => {}
                Some(existing) => {
                    existing.is_blacklisted = event.direction.is_blacklisted();
                    existing.block_number = event.block_number;
                    existing.log_index = event.log_index;
                    existing.transaction_hash = event.transaction_hash.clone();
                    existing.event_timestamp = event.timestamp;
                    existing.last_updated = now;
                    written += 1;
                }
                None => {
                    self.records.insert(
                        key,
                        BlacklistRecord {
                            address: event.address,
                            token: event.token,
                            network: event.network,
                            is_blacklisted: event.direction.is_blacklisted(),
                            block_number: event.block_number,
                            log_index: event.log_index,
                            transaction_hash: event.transaction_hash,
                            event_timestamp: event.timestamp,
                            first_seen: now,
                            last_updated: now,
                        },
                    );
                    written += 1;
                }
            }
        }
        written
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, ordered by key.
    pub async fn records(&self) -> Vec<BlacklistRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }
}

fn matches(value: &str, filter: Option<&str>) -> bool {
    filter.map_or(true, |f| f == value)
}

#[async_trait]
impl DenylistStore for MemoryStore {
    async fn commit_window(
        &self,
        network: &str,
        token: &str,
        events: &[BlacklistEvent],
        checkpoint: Checkpoint,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let written = state.apply(events);
        state.cursors.insert(
            (network.to_string(), token.to_string()),
            SyncCursor {
                network: network.to_string(),
                token: token.to_string(),
                last_synced_position: checkpoint.position,
                last_synced_timestamp: checkpoint.timestamp,
                last_sync_time: Utc::now(),
            },
        );
        Ok(written)
    }

    async fn upsert(&self, events: &[BlacklistEvent]) -> Result<usize, StoreError> {
        Ok(self.state.lock().await.apply(events))
    }

    async fn load_cursor(
        &self,
        network: &str,
        token: &str,
    ) -> Result<Option<SyncCursor>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .cursors
            .get(&(network.to_string(), token.to_string()))
            .cloned())
    }

    async fn reset(&self, network: &str, token: &str) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.records.len();
        state
            .records
            .retain(|key, _| !(key.network == network && key.token == token));
        state
            .cursors
            .remove(&(network.to_string(), token.to_string()));
        Ok((before - state.records.len()) as u64)
    }

    async fn lookup(
        &self,
        address: &str,
        token: Option<&str>,
        network: Option<&str>,
    ) -> Result<Vec<BlacklistRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|r| {
                r.address == address && matches(&r.token, token) && matches(&r.network, network)
            })
            .cloned()
            .collect())
    }

    async fn list_blacklisted(
        &self,
        network: Option<&str>,
        token: Option<&str>,
    ) -> Result<Vec<BlacklistRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|r| {
                r.is_blacklisted && matches(&r.network, network) && matches(&r.token, token)
            })
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<Vec<TokenStats>, StoreError> {
        let state = self.state.lock().await;
        let mut grouped: BTreeMap<(String, String), (u64, u64)> = BTreeMap::new();
        for record in state.records.values() {
            let counts = grouped
                .entry((record.network.clone(), record.token.clone()))
                .or_default();
            counts.1 += 1;
            if record.is_blacklisted {
                counts.0 += 1;
            }
        }
        for key in state.cursors.keys() {
            grouped.entry(key.clone()).or_default();
        }

        Ok(grouped
            .into_iter()
            .map(|((network, token), (blacklisted_count, total_count))| TokenStats {
                cursor: state.cursors.get(&(network.clone(), token.clone())).cloned(),
                network,
                token,
                blacklisted_count,
                total_count,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::types::Direction;
    use crate::test_utils::event;

    #[tokio::test]
    async fn test_applying_twice_is_idempotent() {
        let store = MemoryStore::new();
        let batch = vec![
            event("0xaa", Direction::Add, 450),
            event("0xbb", Direction::Add, 460),
            event("0xaa", Direction::Remove, 900),
        ];
        store.upsert(&batch).await.unwrap();
        let once: Vec<_> = store
            .records()
            .await
            .into_iter()
            .map(|r| (r.address, r.is_blacklisted, r.block_number))
            .collect();

        let written = store.upsert(&batch).await.unwrap();
        let twice: Vec<_> = store
            .records()
            .await
            .into_iter()
            .map(|r| (r.address, r.is_blacklisted, r.block_number))
            .collect();

        assert_eq!(written, 0);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_last_block_wins_in_either_arrival_order() {
        for order in [[0usize, 1], [1, 0]] {
            let store = MemoryStore::new();
            let events = [
                event("0xaa", Direction::Add, 450),
                event("0xaa", Direction::Remove, 900),
            ];
            for i in order {
                store.upsert(&events[i..=i]).await.unwrap();
            }
            let records = store.lookup("0xaa", None, None).await.unwrap();
            assert_eq!(records.len(), 1);
            assert!(!records[0].is_blacklisted);
            assert_eq!(records[0].block_number, 900);
        }
    }

    #[tokio::test]
    async fn test_first_seen_survives_updates() {
        let store = MemoryStore::new();
        store.upsert(&[event("0xaa", Direction::Add, 1)]).await.unwrap();
        let first = store.lookup("0xaa", None, None).await.unwrap()[0].clone();
        store.upsert(&[event("0xaa", Direction::Remove, 2)]).await.unwrap();
        let second = store.lookup("0xaa", None, None).await.unwrap()[0].clone();
        assert_eq!(first.first_seen, second.first_seen);
        assert!(second.last_updated >= first.last_updated);
    }

    #[tokio::test]
    async fn test_commit_window_moves_cursor_and_stats() {
        let store = MemoryStore::new();
        store
            .commit_window(
                "ethereum",
                "USDT",
                &[
                    event("0xaa", Direction::Add, 10),
                    event("0xbb", Direction::Remove, 11),
                ],
                Checkpoint::block(100),
            )
            .await
            .unwrap();

        let cursor = store.load_cursor("ethereum", "USDT").await.unwrap().unwrap();
        assert_eq!(cursor.last_synced_position, 100);
        assert_eq!(cursor.last_synced_timestamp, None);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].blacklisted_count, 1);
        assert_eq!(stats[0].total_count, 2);
        assert_eq!(stats[0].cursor.as_ref().unwrap().last_synced_position, 100);

        let listed = store.list_blacklisted(Some("ethereum"), None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].address, "0xaa");
    }

    #[tokio::test]
    async fn test_reset_clears_records_and_cursor() {
        let store = MemoryStore::new();
        store
            .commit_window(
                "ethereum",
                "USDT",
                &[event("0xaa", Direction::Add, 10)],
                Checkpoint::block(50),
            )
            .await
            .unwrap();
        assert_eq!(store.reset("ethereum", "USDT").await.unwrap(), 1);
        assert!(store.load_cursor("ethereum", "USDT").await.unwrap().is_none());
        assert!(store.lookup("0xaa", None, None).await.unwrap().is_empty());

        // After clearing, an older block may be written again.
        store.upsert(&[event("0xaa", Direction::Remove, 5)]).await.unwrap();
        assert_eq!(store.lookup("0xaa", None, None).await.unwrap()[0].block_number, 5);
    }

    #[tokio::test]
    async fn test_same_block_orders_by_log_index() {
        let store = MemoryStore::new();
        let mut add = event("0xaa", Direction::Add, 700);
        add.log_index = 1;
        let mut remove = event("0xaa", Direction::Remove, 700);
        remove.log_index = 4;

        // Separate batches, as the live path delivers them.
        store.upsert(&[add.clone()]).await.unwrap();
        assert_eq!(store.upsert(&[remove.clone()]).await.unwrap(), 1);
        // Replaying the earlier log changes nothing.
        assert_eq!(store.upsert(&[add]).await.unwrap(), 0);
        assert_eq!(store.upsert(&[remove]).await.unwrap(), 0);

        let record = &store.lookup("0xaa", None, None).await.unwrap()[0];
        assert!(!record.is_blacklisted);
        assert_eq!((record.block_number, record.log_index), (700, 4));
    }

    #[tokio::test]
    async fn test_commit_window_stores_time_checkpoint() {
        let store = MemoryStore::new();
        store
            .commit_window(
                "tron",
                "USDT",
                &[],
                Checkpoint::time(61_000_000, 1_700_000_000_000),
            )
            .await
            .unwrap();

        let cursor = store.load_cursor("tron", "USDT").await.unwrap().unwrap();
        assert_eq!(cursor.last_synced_position, 61_000_000);
        assert_eq!(cursor.last_synced_timestamp, Some(1_700_000_000_000));
    }
}
