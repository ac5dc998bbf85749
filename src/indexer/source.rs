use alloy::primitives::B256;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::normalizer::ContractLayout;
use super::types::{EventSelector, PositionAxis, RawEvent, Window};

/// Errors surfaced by a chain client. Never retried inside the source.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("provider rejected window {window} as too large: {message}")]
    RangeLimit { window: Window, message: String },

    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),

    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),
}

impl FetchError {
    /// Sort a provider error message into the retry taxonomy.
    pub fn classify(window: Option<Window>, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if let Some(window) = window {
            if is_range_limit_message(&lower) {
                return FetchError::RangeLimit { window, message };
            }
        }
        if is_rate_limit_message(&lower) {
            return FetchError::RateLimited(message);
        }
        FetchError::Transport(message)
    }

    pub fn is_range_limit(&self) -> bool {
        matches!(self, FetchError::RangeLimit { .. })
    }
}

fn is_range_limit_message(msg: &str) -> bool {
    msg.contains("too many logs")
        || msg.contains("-32005")
        || msg.contains("exceeds max results")
        || msg.contains("query returned more than")
        || msg.contains("block range")
        || msg.contains("range is too large")
        || msg.contains("response size exceeded")
}

fn is_rate_limit_message(msg: &str) -> bool {
    msg.contains("rate limit")
        || msg.contains("too many requests")
        || msg.contains("429")
        || msg.contains("resource exhausted")
}

/// Block-range log access for EVM chains.
#[async_trait]
pub trait LogClient: Send + Sync {
    async fn current_head(&self) -> Result<u64, FetchError>;

    async fn fetch_logs(
        &self,
        window: Window,
        contract: &str,
        topic0: B256,
    ) -> Result<Vec<RawEvent>, FetchError>;

    /// Chain time of a block in unix seconds.
    async fn block_timestamp(&self, block: u64) -> Result<u64, FetchError>;

    /// Stream matching logs until the subscription ends or `shutdown` fires.
    async fn subscribe_logs(
        &self,
        _contracts: Vec<String>,
        _topics: Vec<B256>,
        _sink: mpsc::Sender<RawEvent>,
        _shutdown: CancellationToken,
    ) -> Result<(), FetchError> {
        Err(FetchError::Unsupported("log subscription"))
    }
}

/// One page of indexer results plus the opaque token for the next page.
#[derive(Debug, Default)]
pub struct EventPage {
    pub events: Vec<RawEvent>,
    pub next: Option<String>,
}

/// Timestamp-windowed, cursor-paginated event access (TronGrid style).
#[async_trait]
pub trait IndexerClient: Send + Sync {
    /// Current chain time in milliseconds.
    async fn current_head(&self) -> Result<u64, FetchError>;

    async fn fetch_events(
        &self,
        window: Window,
        contract: &str,
        event_name: &str,
        page_size: usize,
        continuation: Option<&str>,
    ) -> Result<EventPage, FetchError>;
}

pub struct LogSource {
    client: Arc<dyn LogClient>,
}

pub struct IndexerSource {
    client: Arc<dyn IndexerClient>,
    page_size: usize,
    max_pages: usize,
}

/// Event source for one network, selected by the network's kind.
pub enum ChainEventSource {
    Log(LogSource),
    Indexer(IndexerSource),
}

impl ChainEventSource {
    pub fn logs(client: Arc<dyn LogClient>) -> Self {
        ChainEventSource::Log(LogSource { client })
    }

    pub fn indexer(client: Arc<dyn IndexerClient>, page_size: usize, max_pages: usize) -> Self {
        ChainEventSource::Indexer(IndexerSource {
            client,
            page_size: page_size.max(1),
            max_pages: max_pages.max(1),
        })
    }

    pub fn axis(&self) -> PositionAxis {
        match self {
            ChainEventSource::Log(_) => PositionAxis::Block,
            ChainEventSource::Indexer(_) => PositionAxis::Timestamp,
        }
    }

    pub async fn current_head(&self) -> Result<u64, FetchError> {
        match self {
            ChainEventSource::Log(source) => source.client.current_head().await,
            ChainEventSource::Indexer(source) => source.client.current_head().await,
        }
    }

    /// Fetch every configured event kind of `layout` inside `window`,
    /// ordered by (block, log index).
    pub async fn fetch(
        &self,
        layout: &ContractLayout,
        window: Window,
    ) -> Result<Vec<RawEvent>, FetchError> {
        let mut events = match self {
            ChainEventSource::Log(source) => source.fetch(layout, window).await?,
            ChainEventSource::Indexer(source) => source.fetch(layout, window).await?,
        };
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    pub async fn block_timestamp(&self, block: u64) -> Result<u64, FetchError> {
        match self {
            ChainEventSource::Log(source) => source.client.block_timestamp(block).await,
            ChainEventSource::Indexer(_) => Err(FetchError::Unsupported("block timestamp lookup")),
        }
    }

    pub(crate) fn log_client(&self) -> Option<&Arc<dyn LogClient>> {
        match self {
            ChainEventSource::Log(source) => Some(&source.client),
            ChainEventSource::Indexer(_) => None,
        }
    }
}

impl LogSource {
    async fn fetch(
        &self,
        layout: &ContractLayout,
        window: Window,
    ) -> Result<Vec<RawEvent>, FetchError> {
        let mut events = Vec::new();
        for kind in &layout.events {
            let EventSelector::Topic(topic0) = kind.selector else {
                return Err(FetchError::Unsupported("named events on a log-indexed chain"));
            };
            let logs = self.client.fetch_logs(window, &layout.contract, topic0).await?;
            tracing::debug!(
                network = %layout.network,
                token = %layout.token,
                event = kind.name(),
                %window,
                logs = logs.len(),
                "Fetched logs"
            );
            events.extend(logs);
        }
        Ok(events)
    }
}

impl IndexerSource {
    async fn fetch(
        &self,
        layout: &ContractLayout,
        window: Window,
    ) -> Result<Vec<RawEvent>, FetchError> {
        let mut events = Vec::new();
        for kind in &layout.events {
            events.extend(self.fetch_pages(layout, kind.name(), window).await?);
        }
        Ok(events)
    }

    /// Follow continuation tokens inside one window.
    ///
    /// A short page ends the loop regardless of the token; a full page with a
    /// missing or repeated token also ends it, so a misbehaving provider can't
    /// stall the pass.
    async fn fetch_pages(
        &self,
        layout: &ContractLayout,
        event_name: &str,
        window: Window,
    ) -> Result<Vec<RawEvent>, FetchError> {
        let mut events = Vec::new();
        let mut continuation: Option<String> = None;

        for page_no in 1..=self.max_pages {
            let page = self
                .client
                .fetch_events(
                    window,
                    &layout.contract,
                    event_name,
                    self.page_size,
                    continuation.as_deref(),
                )
                .await?;
            let received = page.events.len();
            events.extend(page.events);

            if received < self.page_size {
                return Ok(events);
            }

            match page.next {
                Some(next) if continuation.as_deref() != Some(next.as_str()) => {
                    continuation = Some(next);
                }
                Some(_) => {
                    tracing::warn!(
                        network = %layout.network,
                        token = %layout.token,
                        event = event_name,
                        page = page_no,
                        "Indexer repeated its continuation token, ending pagination"
                    );
                    return Ok(events);
                }
                None => {
                    tracing::warn!(
                        network = %layout.network,
                        token = %layout.token,
                        event = event_name,
                        page = page_no,
                        %window,
                        "Full page without continuation token, ending pagination"
                    );
                    return Ok(events);
                }
            }
        }

        Err(FetchError::RangeLimit {
            window,
            message: format!("more than {} pages of {} events", self.max_pages, self.page_size),
        })
    }
}
