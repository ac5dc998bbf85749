use alloy::primitives::{Bytes, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Whether an event puts an address on the denylist or takes it off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Add,
    Remove,
}

impl Direction {
    pub fn is_blacklisted(self) -> bool {
        matches!(self, Direction::Add)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Add => "add",
            Direction::Remove => "remove",
        }
    }
}

/// How a network's event source addresses chain positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionAxis {
    /// Block numbers (log-indexed chains).
    Block,
    /// Block timestamps in milliseconds (indexer-backed chains).
    Timestamp,
}

/// Inclusive range of chain positions fetched and committed as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub from: u64,
    pub to: u64,
}

impl Window {
    pub fn new(from: u64, to: u64) -> Self {
        debug_assert!(from <= to, "window start past its end");
        Self { from, to }
    }

    /// Number of positions covered, both ends included.
    pub fn span(&self) -> u64 {
        self.to - self.from + 1
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Identifies an event kind in the provider's native vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventSelector {
    /// keccak256 of the event signature, matched against topic 0.
    Topic(B256),
    /// Bare event name as reported by an indexer (e.g. `AddedBlackList`).
    Name(String),
}

impl fmt::Display for EventSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSelector::Topic(topic) => write!(f, "{topic}"),
            EventSelector::Name(name) => f.write_str(name),
        }
    }
}

/// A provider-native event entry before normalization.
///
/// Log-indexed sources fill `topics` and `data`; indexer sources fill
/// `fields` with the decoded event parameters.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub contract: String,
    pub selector: EventSelector,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub fields: HashMap<String, String>,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: String,
    /// Chain time in unix seconds, when the provider reports it.
    pub timestamp: Option<u64>,
}

/// Canonical denylist event shared by the backfill and live paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEvent {
    pub address: String,
    pub token: String,
    pub network: String,
    pub direction: Direction,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: String,
    pub timestamp: u64,
}

impl BlacklistEvent {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            address: self.address.clone(),
            token: self.token.clone(),
            network: self.network.clone(),
        }
    }
}

/// Natural primary key of a denylist record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub address: String,
    pub token: String,
    pub network: String,
}

/// Materialized denylist state for one (address, token, network).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlacklistRecord {
    pub address: String,
    pub token: String,
    pub network: String,
    pub is_blacklisted: bool,
    pub block_number: u64,
    /// Position of the applied log inside `block_number`.
    pub log_index: u64,
    pub transaction_hash: String,
    pub event_timestamp: u64,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Resumption point for one (network, token).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncCursor {
    pub network: String,
    pub token: String,
    /// Last block covered by committed windows.
    pub last_synced_position: u64,
    /// Timestamp-indexed chains only: end of the last committed window in
    /// milliseconds. Backfill resumes right after it.
    pub last_synced_timestamp: Option<u64>,
    pub last_sync_time: DateTime<Utc>,
}

/// Where committing a window leaves the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub position: u64,
    pub timestamp: Option<u64>,
}

impl Checkpoint {
    /// Block-indexed chains: the window end is the position.
    pub fn block(position: u64) -> Self {
        Self {
            position,
            timestamp: None,
        }
    }

    /// Timestamp-indexed chains: the block reached plus the window end in ms.
    pub fn time(position: u64, timestamp_ms: u64) -> Self {
        Self {
            position,
            timestamp: Some(timestamp_ms),
        }
    }
}

/// Aggregate counts for one (network, token) plus its cursor snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenStats {
    pub network: String,
    pub token: String,
    pub blacklisted_count: u64,
    pub total_count: u64,
    pub cursor: Option<SyncCursor>,
}

/// Render a 20-byte account id as lowercase `0x`-prefixed hex.
pub fn canonical_address(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse user or provider supplied hex into the canonical address form.
///
/// Accepts `0x`-prefixed EVM hex, bare hex, and Tron's `41`-prefixed hex.
pub fn parse_address(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let hex_part = match stripped.len() {
        40 => stripped,
        42 if stripped.starts_with("41") => &stripped[2..],
        _ => return None,
    };
    let bytes = hex::decode(hex_part).ok()?;
    Some(canonical_address(&bytes))
}
