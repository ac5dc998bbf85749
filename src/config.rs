use serde::Deserialize;
use std::collections::HashSet;

use crate::indexer::normalizer::AddressRule;
use crate::indexer::planner::PlannerConfig;
use crate::indexer::types::{parse_address, Direction, PositionAxis};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub networks: Vec<NetworkConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

// ============================================================
// Sync Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Super-batches a periodic re-backfill pass may cover before yielding
    /// to the next tick. The initial backfill always runs to the head.
    #[serde(default = "default_resync_super_batches")]
    pub resync_super_batches: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pacing_ms: default_pacing_ms(),
            resync_interval_secs: default_resync_interval_secs(),
            channel_capacity: default_channel_capacity(),
            rate_limit_retries: default_rate_limit_retries(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            resync_super_batches: default_resync_super_batches(),
        }
    }
}

fn default_pacing_ms() -> u64 {
    200
}

fn default_resync_interval_secs() -> u64 {
    600
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_rate_limit_retries() -> u32 {
    5
}

fn default_page_size() -> usize {
    200
}

fn default_max_pages() -> usize {
    500
}

fn default_resync_super_batches() -> usize {
    1
}

// ============================================================
// Network Config
// ============================================================

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Evm,
    Tron,
}

impl NetworkKind {
    pub fn axis(self) -> PositionAxis {
        match self {
            NetworkKind::Evm => PositionAxis::Block,
            NetworkKind::Tron => PositionAxis::Timestamp,
        }
    }
}

const EVM_DEFAULT_WINDOW: u64 = 5_000;
const EVM_SUPER_BATCH_SPAN: u64 = 172_800;
const TRON_DEFAULT_WINDOW: u64 = 86_400_000;
const TRON_SUPER_BATCH_SPAN: u64 = 30 * 86_400_000;
const TRON_SETTLE_MARGIN: u64 = 60_000;

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    pub name: String,
    pub kind: NetworkKind,
    pub rpc_http: String,
    pub rpc_ws: Option<String>,
    pub api_key: Option<String>,
    pub default_window: Option<u64>,
    #[serde(default = "default_min_window")]
    pub min_window: u64,
    pub super_batch_span: Option<u64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Tron only: how far back each live poll looks, in milliseconds.
    pub live_lookback: Option<u64>,
    /// Positions behind the head that backfill leaves uncommitted until the
    /// provider has settled. Defaults to one minute on Tron, none on EVM.
    pub settle_margin: Option<u64>,
    pub tokens: Vec<TokenConfig>,
}

fn default_min_window() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    3000
}

impl NetworkConfig {
    pub fn planner(&self) -> PlannerConfig {
        let (window, span) = match self.kind {
            NetworkKind::Evm => (EVM_DEFAULT_WINDOW, EVM_SUPER_BATCH_SPAN),
            NetworkKind::Tron => (TRON_DEFAULT_WINDOW, TRON_SUPER_BATCH_SPAN),
        };
        PlannerConfig {
            default_window: self.default_window.unwrap_or(window),
            min_window: self.min_window,
            super_batch_span: self.super_batch_span.unwrap_or(span),
        }
    }

    /// Live poll lookback, never shorter than two poll intervals.
    pub fn live_lookback(&self) -> u64 {
        let floor = self.poll_interval_ms.saturating_mul(2);
        self.live_lookback.unwrap_or(floor).max(floor)
    }

    pub fn settle_margin(&self) -> u64 {
        self.settle_margin.unwrap_or(match self.kind {
            NetworkKind::Evm => 0,
            NetworkKind::Tron => TRON_SETTLE_MARGIN,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenConfig {
    pub symbol: String,
    pub address: String,
    #[serde(default)]
    pub start_position: u64,
    #[serde(default)]
    pub events: Vec<EventConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct EventConfig {
    pub signature: String,
    pub direction: Direction,
    pub extract: AddressRule,
}

// ============================================================
// API & Logging Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_api_host")]
    pub host: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_api_port(),
            host: default_api_host(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_port() -> u16 {
    3000
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// `DATABASE_URL` replaces the configured url; `TRONGRID_API_KEY` fills
    /// in Tron networks that don't set their own key.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("DATABASE_URL").filter(|v| !v.is_empty()) {
            self.database.url = url;
        }
        if let Some(key) = var("TRONGRID_API_KEY").filter(|v| !v.is_empty()) {
            for network in &mut self.networks {
                if network.kind == NetworkKind::Tron && network.api_key.is_none() {
                    network.api_key = Some(key.clone());
                }
            }
        }
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.networks.is_empty() {
            return Err(eyre::eyre!("At least one network must be configured"));
        }
        if self.sync.resync_super_batches == 0 {
            return Err(eyre::eyre!("sync.resync_super_batches must be at least 1"));
        }

        let mut names = HashSet::new();
        for network in &self.networks {
            if !names.insert(network.name.as_str()) {
                return Err(eyre::eyre!("Network '{}' is configured twice", network.name));
            }
            if network.tokens.is_empty() {
                return Err(eyre::eyre!(
                    "Network '{}' must have at least one token configured",
                    network.name
                ));
            }

            let planner = network.planner();
            if planner.min_window == 0 || planner.default_window < planner.min_window {
                return Err(eyre::eyre!(
                    "Network '{}': window sizes must satisfy 0 < min_window <= default_window",
                    network.name
                ));
            }

            let mut symbols = HashSet::new();
            for token in &network.tokens {
                if !symbols.insert(token.symbol.as_str()) {
                    return Err(eyre::eyre!(
                        "Token {} is configured twice on network '{}'",
                        token.symbol,
                        network.name
                    ));
                }
                self.validate_token(network, token)?;
            }
        }
        Ok(())
    }

    fn validate_token(&self, network: &NetworkConfig, token: &TokenConfig) -> eyre::Result<()> {
        match network.kind {
            NetworkKind::Evm if parse_address(&token.address).is_none() => {
                return Err(eyre::eyre!(
                    "Invalid token address '{}' for {} on network '{}'",
                    token.address,
                    token.symbol,
                    network.name
                ));
            }
            NetworkKind::Tron if token.address.trim().is_empty() => {
                return Err(eyre::eyre!(
                    "Missing token address for {} on network '{}'",
                    token.symbol,
                    network.name
                ));
            }
            _ => {}
        }

        for event in &token.events {
            let fits = matches!(
                (network.kind, &event.extract),
                (NetworkKind::Evm, AddressRule::Payload | AddressRule::Topic { .. })
                    | (NetworkKind::Tron, AddressRule::Field { .. })
            );
            if !fits {
                return Err(eyre::eyre!(
                    "Event {} of {} on '{}' uses an address rule the network can't serve",
                    event.signature,
                    token.symbol,
                    network.name
                ));
            }
        }

        if token.events.is_empty()
            && crate::tokens::registry::preset_events(network.kind, &token.symbol).is_none()
        {
            return Err(eyre::eyre!(
                "Token {} on '{}' has no built-in events; set [[networks.tokens.events]]",
                token.symbol,
                network.name
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[database]
url = "postgres://localhost/denylist"
max_connections = 5

[sync]
pacing_ms = 50

[[networks]]
name = "ethereum"
kind = "evm"
rpc_http = "http://localhost:8545"

[[networks.tokens]]
symbol = "USDC"
address = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"
start_position = 6082465

[[networks]]
name = "tron"
kind = "tron"
rpc_http = "https://api.trongrid.io"
poll_interval_ms = 5000

[[networks.tokens]]
symbol = "USDT"
address = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t"

[[networks.tokens.events]]
signature = "AddedBlackList(address)"
direction = "add"
extract = { rule = "field", name = "_user" }
"#;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_parse_config() {
        let config = parse(SAMPLE);
        assert_eq!(config.networks.len(), 2);
        assert_eq!(config.sync.pacing_ms, 50);
        assert_eq!(config.sync.page_size, 200); // default
        assert_eq!(config.logging.format, LogFormat::Pretty);

        let eth = &config.networks[0];
        assert_eq!(eth.kind, NetworkKind::Evm);
        assert_eq!(eth.tokens[0].start_position, 6_082_465);
        assert_eq!(eth.planner().default_window, 5_000);
        assert_eq!(eth.planner().super_batch_span, 172_800);
        assert_eq!(eth.settle_margin(), 0);

        let tron = &config.networks[1];
        assert_eq!(tron.planner().super_batch_span, 2_592_000_000);
        assert_eq!(tron.live_lookback(), 10_000);
        assert_eq!(tron.settle_margin(), 60_000);
        assert_eq!(config.sync.resync_super_batches, 1);
        assert_eq!(
            tron.tokens[0].events[0].extract,
            AddressRule::Field {
                name: "_user".into()
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = parse(SAMPLE);
        config.apply_env(|key| match key {
            "DATABASE_URL" => Some("postgres://override/db".to_string()),
            "TRONGRID_API_KEY" => Some("secret".to_string()),
            _ => None,
        });
        assert_eq!(config.database.url, "postgres://override/db");
        assert_eq!(config.networks[0].api_key, None);
        assert_eq!(config.networks[1].api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_validate_empty_networks() {
        let config = parse("networks = []");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_address() {
        let mut config = parse(SAMPLE);
        config.networks[0].tokens[0].address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rule_must_fit_network() {
        let mut config = parse(SAMPLE);
        config.networks[1].tokens[0].events[0].extract = AddressRule::Payload;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_unknown_token_without_events() {
        let mut config = parse(SAMPLE);
        config.networks[0].tokens[0].symbol = "DAI".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_window_bounds() {
        let mut config = parse(SAMPLE);
        config.networks[0].default_window = Some(50);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_resync_super_batches() {
        let mut config = parse(SAMPLE);
        config.sync.resync_super_batches = 0;
        assert!(config.validate().is_err());
    }
}
