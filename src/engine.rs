use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{EvmLogClient, TronGridClient};
use crate::config::{Config, NetworkConfig, NetworkKind, SyncConfig};
use crate::db::DenylistStore;
use crate::indexer::chain::{ChainDriver, DriverSettings, PassReport, SyncError};
use crate::indexer::source::ChainEventSource;
use crate::tokens::registry::build_layouts;

const RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(500);

/// Result of one network's backfill pass.
#[derive(Debug)]
pub struct NetworkOutcome {
    pub network: String,
    pub result: Result<PassReport, SyncError>,
}

/// Owns one driver per configured network; drivers share only the store.
pub struct SyncEngine {
    drivers: Vec<Arc<ChainDriver>>,
}

pub fn driver_settings(sync: &SyncConfig, network: &NetworkConfig) -> DriverSettings {
    DriverSettings {
        planner: network.planner(),
        pacing: Duration::from_millis(sync.pacing_ms),
        rate_limit_retries: sync.rate_limit_retries,
        rate_limit_backoff: RATE_LIMIT_BACKOFF,
        resync_interval: Duration::from_secs(sync.resync_interval_secs.max(1)),
        poll_interval: Duration::from_millis(network.poll_interval_ms.max(1)),
        live_lookback: network.live_lookback(),
        settle_margin: network.settle_margin(),
        resync_super_batches: sync.resync_super_batches,
        channel_capacity: sync.channel_capacity,
    }
}

fn build_source(sync: &SyncConfig, network: &NetworkConfig) -> eyre::Result<ChainEventSource> {
    Ok(match network.kind {
        NetworkKind::Evm => {
            let client =
                EvmLogClient::new(&network.name, &network.rpc_http, network.rpc_ws.clone())?;
            ChainEventSource::logs(Arc::new(client))
        }
        NetworkKind::Tron => {
            let client = TronGridClient::new(&network.rpc_http, network.api_key.clone())?;
            ChainEventSource::indexer(Arc::new(client), sync.page_size, sync.max_pages)
        }
    })
}

impl SyncEngine {
    pub fn new(drivers: Vec<ChainDriver>) -> Self {
        Self {
            drivers: drivers.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn from_config(config: &Config, store: Arc<dyn DenylistStore>) -> eyre::Result<Self> {
        let mut drivers = Vec::with_capacity(config.networks.len());
        for network in &config.networks {
            let layouts = build_layouts(network)?;
            let source = build_source(&config.sync, network)?;
            tracing::info!(
                network = %network.name,
                kind = ?network.kind,
                tokens = ?layouts.iter().map(|l| &l.token).collect::<Vec<_>>(),
                "Configured network"
            );
            drivers.push(ChainDriver::new(
                &network.name,
                source,
                store.clone(),
                layouts,
                driver_settings(&config.sync, network),
            ));
        }
        Ok(Self::new(drivers))
    }

    pub fn drivers(&self) -> &[Arc<ChainDriver>] {
        &self.drivers
    }

    /// Run one backfill pass on every network concurrently. A failing
    /// network is reported in its outcome and never stops the others.
    pub async fn run_backfill_once(
        &self,
        force_full_resync: bool,
        shutdown: &CancellationToken,
    ) -> Vec<NetworkOutcome> {
        join_all(self.drivers.iter().map(|driver| async move {
            let result = driver.run_backfill_once(force_full_resync, shutdown).await;
            match &result {
                Ok(report) => tracing::info!(
                    network = %driver.network(),
                    windows = report.windows,
                    events = report.events,
                    written = report.written,
                    cancelled = report.cancelled,
                    "Backfill pass finished"
                ),
                Err(e) => tracing::error!(
                    network = %driver.network(),
                    error = %e,
                    "Backfill pass failed"
                ),
            }
            NetworkOutcome {
                network: driver.network().to_string(),
                result,
            }
        }))
        .await
    }

    /// Spawn one long-running task per network: backfill, then live mode with
    /// periodic re-backfill, until `shutdown` fires.
    pub fn start_live(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.drivers
            .iter()
            .map(|driver| tokio::spawn(driver.clone().run(shutdown.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::indexer::normalizer::{AddressRule, ContractLayout, EventKind};
    use crate::indexer::source::FetchError;
    use crate::indexer::types::{Direction, PositionAxis};
    use crate::test_utils::{
        address_word, driver_settings as test_settings, log_event, FakeLogClient,
    };
    use alloy::primitives::{keccak256, Bytes};

    const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
    const ALICE: &str = "0x00000000000000000000000000000000000a11ce";

    fn usdc_driver(
        network: &str,
        client: Arc<FakeLogClient>,
        store: Arc<MemoryStore>,
    ) -> ChainDriver {
        let layout = ContractLayout {
            network: network.into(),
            token: "USDC".into(),
            contract: USDC.into(),
            start_position: 1,
            events: vec![EventKind::new(
                PositionAxis::Block,
                "Blacklisted(address)",
                Direction::Add,
                AddressRule::Topic { index: 1 },
            )],
        };
        ChainDriver::new(
            network,
            ChainEventSource::logs(client),
            store,
            vec![layout],
            test_settings(),
        )
    }

    #[tokio::test]
    async fn test_failed_network_does_not_affect_others() {
        let topic0 = keccak256("Blacklisted(address)".as_bytes());
        let log = log_event(USDC, topic0, vec![topic0, address_word(ALICE)], Bytes::new(), 300);
        let healthy = Arc::new(FakeLogClient::new(500, vec![log]));
        let broken = Arc::new(FakeLogClient::new(500, vec![]));
        broken.fail_at(Some(1));

        let store = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(vec![
            usdc_driver("broken", broken, store.clone()),
            usdc_driver("healthy", healthy, store.clone()),
        ]);

        let outcomes = engine.run_backfill_once(false, &CancellationToken::new()).await;
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(
            outcomes[0].result,
            Err(SyncError::Fetch(FetchError::Transport(_)))
        ));
        assert!(outcomes[1].result.is_ok());

        let records = store.lookup(ALICE, Some("USDC"), Some("healthy")).await.unwrap();
        assert!(records[0].is_blacklisted);
        assert!(store.load_cursor("broken", "USDC").await.unwrap().is_none());
        assert_eq!(
            store
                .load_cursor("healthy", "USDC")
                .await
                .unwrap()
                .unwrap()
                .last_synced_position,
            500
        );
    }

    #[tokio::test]
    async fn test_start_live_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(vec![usdc_driver(
            "ethereum",
            Arc::new(FakeLogClient::new(10, vec![])),
            store,
        )]);
        let shutdown = CancellationToken::new();
        let handles = engine.start_live(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_from_config_builds_one_driver_per_network() {
        let config: Config = toml::from_str(
            r#"
[[networks]]
name = "ethereum"
kind = "evm"
rpc_http = "http://localhost:8545"

[[networks.tokens]]
symbol = "USDT"
address = "0xdAC17F958D2ee523a2206206994597C13D831ec7"

[[networks]]
name = "tron"
kind = "tron"
rpc_http = "https://api.trongrid.io"

[[networks.tokens]]
symbol = "USDT"
address = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t"
"#,
        )
        .unwrap();

        let engine = SyncEngine::from_config(&config, Arc::new(MemoryStore::new())).unwrap();
        let drivers = engine.drivers();
        assert_eq!(drivers.len(), 2);
        assert_eq!(drivers[0].source().axis(), PositionAxis::Block);
        assert_eq!(drivers[1].source().axis(), PositionAxis::Timestamp);
        assert_eq!(drivers[1].settings().planner.super_batch_span, 2_592_000_000);
        assert_eq!(drivers[1].settings().live_lookback, 6_000);
        assert_eq!(drivers[0].settings().settle_margin, 0);
        assert_eq!(drivers[1].settings().settle_margin, 60_000);
        assert_eq!(drivers[1].settings().resync_super_batches, 1);
    }
}
