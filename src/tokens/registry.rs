use crate::config::{EventConfig, NetworkConfig, NetworkKind};
use crate::indexer::normalizer::{AddressRule, ContractLayout, EventKind};
use crate::indexer::types::{parse_address, Direction};

fn event(signature: &str, direction: Direction, extract: AddressRule) -> EventConfig {
    EventConfig {
        signature: signature.to_string(),
        direction,
        extract,
    }
}

/// Built-in denylist event shapes for well-known stablecoins.
///
/// USDT's `AddedBlackList`/`RemovedBlackList` carry the address unindexed, so
/// EVM reads it from the data payload while TronGrid returns it decoded as
/// `_user`. USDC indexes it as topic 1.
pub fn preset_events(kind: NetworkKind, symbol: &str) -> Option<Vec<EventConfig>> {
    match (kind, symbol.to_ascii_uppercase().as_str()) {
        (NetworkKind::Evm, "USDT") => Some(vec![
            event("AddedBlackList(address)", Direction::Add, AddressRule::Payload),
            event("RemovedBlackList(address)", Direction::Remove, AddressRule::Payload),
        ]),
        (NetworkKind::Tron, "USDT") => {
            let user = || AddressRule::Field {
                name: "_user".to_string(),
            };
            Some(vec![
                event("AddedBlackList(address)", Direction::Add, user()),
                event("RemovedBlackList(address)", Direction::Remove, user()),
            ])
        }
        (NetworkKind::Evm, "USDC") => Some(vec![
            event("Blacklisted(address)", Direction::Add, AddressRule::Topic { index: 1 }),
            event("UnBlacklisted(address)", Direction::Remove, AddressRule::Topic { index: 1 }),
        ]),
        _ => None,
    }
}

/// Build the normalizer's contract layouts for a network.
/// Tokens without an explicit `events` table fall back to the presets.
pub fn build_layouts(network: &NetworkConfig) -> eyre::Result<Vec<ContractLayout>> {
    let axis = network.kind.axis();
    let mut layouts = Vec::with_capacity(network.tokens.len());

    for token in &network.tokens {
        let events = if token.events.is_empty() {
            preset_events(network.kind, &token.symbol).ok_or_else(|| {
                eyre::eyre!(
                    "No event layout for {} on network '{}'",
                    token.symbol,
                    network.name
                )
            })?
        } else {
            token.events.clone()
        };

        let contract = match network.kind {
            NetworkKind::Evm => parse_address(&token.address).ok_or_else(|| {
                eyre::eyre!("Invalid token address '{}' for {}", token.address, token.symbol)
            })?,
            NetworkKind::Tron => token.address.trim().to_string(),
        };

        tracing::debug!(
            network = %network.name,
            symbol = %token.symbol,
            contract = %contract,
            events = events.len(),
            "Registered token layout"
        );

        layouts.push(ContractLayout {
            network: network.name.clone(),
            token: token.symbol.clone(),
            contract,
            start_position: token.start_position,
            events: events
                .into_iter()
                .map(|e| EventKind::new(axis, &e.signature, e.direction, e.extract))
                .collect(),
        });
    }

    Ok(layouts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenConfig;
    use crate::indexer::types::EventSelector;
    use alloy::primitives::keccak256;

    fn network(kind: NetworkKind, tokens: Vec<TokenConfig>) -> NetworkConfig {
        NetworkConfig {
            name: "test".to_string(),
            kind,
            rpc_http: "http://localhost:8545".to_string(),
            rpc_ws: None,
            api_key: None,
            default_window: None,
            min_window: 100,
            super_batch_span: None,
            poll_interval_ms: 1000,
            live_lookback: None,
            settle_margin: None,
            tokens,
        }
    }

    fn token(symbol: &str, address: &str) -> TokenConfig {
        TokenConfig {
            symbol: symbol.to_string(),
            address: address.to_string(),
            start_position: 4_634_748,
            events: vec![],
        }
    }

    #[test]
    fn test_evm_presets_use_topic_selectors() {
        let layouts = build_layouts(&network(
            NetworkKind::Evm,
            vec![token("USDT", "0xdAC17F958D2ee523a2206206994597C13D831ec7")],
        ))
        .unwrap();

        let layout = &layouts[0];
        assert_eq!(layout.contract, "0xdac17f958d2ee523a2206206994597c13d831ec7");
        assert_eq!(layout.start_position, 4_634_748);
        assert_eq!(layout.events.len(), 2);
        assert_eq!(
            layout.events[0].selector,
            EventSelector::Topic(keccak256("AddedBlackList(address)".as_bytes()))
        );
        assert_eq!(layout.events[1].direction, Direction::Remove);
    }

    #[test]
    fn test_tron_presets_use_event_names() {
        let layouts = build_layouts(&network(
            NetworkKind::Tron,
            vec![token("USDT", "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t")],
        ))
        .unwrap();

        assert_eq!(layouts[0].contract, "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t");
        assert_eq!(
            layouts[0].events[1].selector,
            EventSelector::Name("RemovedBlackList".into())
        );
    }

    #[test]
    fn test_unknown_symbol_needs_explicit_events() {
        assert!(preset_events(NetworkKind::Tron, "USDC").is_none());
        let result = build_layouts(&network(
            NetworkKind::Evm,
            vec![token("DAI", "0x6B175474E89094C44Da98b954EedeAC495271d0F")],
        ));
        assert!(result.is_err());
    }
}
