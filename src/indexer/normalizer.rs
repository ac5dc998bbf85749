use alloy::primitives::keccak256;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

use super::types::{
    canonical_address, parse_address, BlacklistEvent, Direction, EventSelector, PositionAxis,
    RawEvent,
};

const ADDRESS_LEN: usize = 20;

/// Where the affected address lives inside an event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum AddressRule {
    /// Trailing 20 bytes of the unindexed data payload.
    Payload,
    /// Trailing 20 bytes of an indexed topic.
    Topic { index: usize },
    /// A named parameter already decoded by an indexer.
    Field { name: String },
}

/// One denylist event kind emitted by a token contract.
#[derive(Debug, Clone)]
pub struct EventKind {
    pub signature: String,
    pub selector: EventSelector,
    pub direction: Direction,
    pub rule: AddressRule,
}

impl EventKind {
    pub fn new(
        axis: PositionAxis,
        signature: &str,
        direction: Direction,
        rule: AddressRule,
    ) -> Self {
        let selector = match axis {
            PositionAxis::Block => EventSelector::Topic(keccak256(signature.as_bytes())),
            PositionAxis::Timestamp => EventSelector::Name(event_name(signature).to_string()),
        };
        Self {
            signature: signature.to_string(),
            selector,
            direction,
            rule,
        }
    }

    /// Event name without its parameter list.
    pub fn name(&self) -> &str {
        event_name(&self.signature)
    }
}

fn event_name(signature: &str) -> &str {
    signature.split('(').next().unwrap_or(signature).trim()
}

/// Contract metadata for one (network, token) pair.
#[derive(Debug, Clone)]
pub struct ContractLayout {
    pub network: String,
    pub token: String,
    /// Canonical hex for EVM contracts, base58 for Tron.
    pub contract: String,
    /// First position worth scanning (deployment block or timestamp).
    pub start_position: u64,
    pub events: Vec<EventKind>,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("no layout for event {selector} on contract {contract}")]
    UnknownEvent { contract: String, selector: String },

    #[error("payload of {len} bytes in tx {tx} is too short to hold an address")]
    ShortPayload { tx: String, len: usize },

    #[error("topic {index} missing in tx {tx}")]
    MissingTopic { tx: String, index: usize },

    #[error("field '{name}' missing in tx {tx}")]
    MissingField { tx: String, name: String },

    #[error("field '{name}' in tx {tx} is not an address: {value}")]
    InvalidField {
        tx: String,
        name: String,
        value: String,
    },
}

#[derive(Debug, Clone)]
struct Entry {
    token: String,
    direction: Direction,
    rule: AddressRule,
}

/// Maps raw provider events to canonical `BlacklistEvent`s.
///
/// One instance serves a whole network; lookups go through the
/// (contract, selector) table built from the configured layouts.
#[derive(Debug, Clone)]
pub struct Normalizer {
    network: String,
    table: HashMap<(String, EventSelector), Entry>,
}

impl Normalizer {
    pub fn new(network: &str, layouts: &[ContractLayout]) -> Self {
        let mut table = HashMap::new();
        for layout in layouts {
            for kind in &layout.events {
                table.insert(
                    (layout.contract.clone(), kind.selector.clone()),
                    Entry {
                        token: layout.token.clone(),
                        direction: kind.direction,
                        rule: kind.rule.clone(),
                    },
                );
            }
        }
        Self {
            network: network.to_string(),
            table,
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Normalize a single raw event. `timestamp` is the chain time in seconds,
    /// already resolved by the caller when the provider did not supply it.
    pub fn normalize(
        &self,
        raw: &RawEvent,
        timestamp: u64,
    ) -> Result<BlacklistEvent, NormalizeError> {
        let entry = self
            .table
            .get(&(raw.contract.clone(), raw.selector.clone()))
            .ok_or_else(|| NormalizeError::UnknownEvent {
                contract: raw.contract.clone(),
                selector: raw.selector.to_string(),
            })?;

        let address = extract_address(raw, &entry.rule)?;

        Ok(BlacklistEvent {
            address,
            token: entry.token.clone(),
            network: self.network.clone(),
            direction: entry.direction,
            block_number: raw.block_number,
            log_index: raw.log_index,
            transaction_hash: raw.transaction_hash.clone(),
            timestamp,
        })
    }
}

fn extract_address(raw: &RawEvent, rule: &AddressRule) -> Result<String, NormalizeError> {
    match rule {
        AddressRule::Payload => {
            let data = raw.data.as_ref();
            if data.len() < ADDRESS_LEN {
                return Err(NormalizeError::ShortPayload {
                    tx: raw.transaction_hash.clone(),
                    len: data.len(),
                });
            }
            Ok(canonical_address(&data[data.len() - ADDRESS_LEN..]))
        }
        AddressRule::Topic { index } => {
            let topic = raw.topics.get(*index).ok_or_else(|| NormalizeError::MissingTopic {
                tx: raw.transaction_hash.clone(),
                index: *index,
            })?;
            Ok(canonical_address(&topic.as_slice()[32 - ADDRESS_LEN..]))
        }
        AddressRule::Field { name } => {
            let value = raw.fields.get(name).ok_or_else(|| NormalizeError::MissingField {
                tx: raw.transaction_hash.clone(),
                name: name.clone(),
            })?;
            parse_address(value).ok_or_else(|| NormalizeError::InvalidField {
                tx: raw.transaction_hash.clone(),
                name: name.clone(),
                value: value.clone(),
            })
        }
    }
}
