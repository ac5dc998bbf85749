use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::indexer::source::{FetchError, LogClient};
use crate::indexer::types::{canonical_address, EventSelector, RawEvent, Window};

/// JSON-RPC log client backed by an alloy HTTP provider, with an optional
/// WebSocket endpoint for live subscriptions.
pub struct EvmLogClient {
    network: String,
    provider: DynProvider,
    ws_url: Option<String>,
}

impl EvmLogClient {
    pub fn new(network: &str, rpc_http: &str, rpc_ws: Option<String>) -> eyre::Result<Self> {
        let url = rpc_http
            .parse()
            .map_err(|e| eyre::eyre!("Invalid RPC URL for {}: {}", network, e))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self {
            network: network.to_string(),
            provider,
            ws_url: rpc_ws,
        })
    }
}

fn parse_contract(contract: &str) -> Result<Address, FetchError> {
    contract
        .parse()
        .map_err(|e| FetchError::Malformed(format!("contract address '{contract}': {e}")))
}

/// Convert an alloy log into a raw event. Pending logs (no block) are skipped.
pub(crate) fn log_to_raw(log: &Log) -> Option<RawEvent> {
    let topics = log.inner.data.topics().to_vec();
    let selector = *topics.first()?;
    Some(RawEvent {
        contract: canonical_address(log.inner.address.as_slice()),
        selector: EventSelector::Topic(selector),
        topics,
        data: log.inner.data.data.clone(),
        fields: HashMap::new(),
        block_number: log.block_number?,
        log_index: log.log_index.unwrap_or(0),
        transaction_hash: log.transaction_hash.unwrap_or_default().to_string(),
        timestamp: log.block_timestamp,
    })
}

#[async_trait]
impl LogClient for EvmLogClient {
    async fn current_head(&self) -> Result<u64, FetchError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| FetchError::classify(None, e.to_string()))
    }

    async fn fetch_logs(
        &self,
        window: Window,
        contract: &str,
        topic0: B256,
    ) -> Result<Vec<RawEvent>, FetchError> {
        let filter = Filter::new()
            .address(parse_contract(contract)?)
            .event_signature(topic0)
            .from_block(window.from)
            .to_block(window.to);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| FetchError::classify(Some(window), e.to_string()))?;

        Ok(logs.iter().filter_map(log_to_raw).collect())
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, FetchError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(block))
            .await
            .map_err(|e| FetchError::classify(None, e.to_string()))?
            .ok_or_else(|| FetchError::Malformed(format!("block {block} not found")))?;
        Ok(block.header.timestamp)
    }

    async fn subscribe_logs(
        &self,
        contracts: Vec<String>,
        topics: Vec<B256>,
        sink: mpsc::Sender<RawEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), FetchError> {
        let Some(ws_url) = &self.ws_url else {
            return Err(FetchError::Unsupported("log subscription without a WebSocket endpoint"));
        };

        let addresses = contracts
            .iter()
            .map(|c| parse_contract(c))
            .collect::<Result<Vec<_>, _>>()?;

        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(ws_url.as_str()))
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let filter = Filter::new().address(addresses).event_signature(topics);
        let sub = provider
            .subscribe_logs(&filter)
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let mut stream = sub.into_stream();

        tracing::info!(network = %self.network, "WebSocket log subscription active");

        loop {
            tokio::select! {
                maybe_log = stream.next() => {
                    let Some(log) = maybe_log else {
                        return Err(FetchError::Transport("log stream ended".to_string()));
                    };
                    if log.removed {
                        continue;
                    }
                    if let Some(raw) = log_to_raw(&log) {
                        if sink.send(raw).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!(
                        network = %self.network,
                        "Shutdown received, closing log subscription"
                    );
                    return Ok(());
                }
            }
        }
    }
}
