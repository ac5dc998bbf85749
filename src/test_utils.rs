//! Builders and fake chain clients shared by unit tests.

use alloy::primitives::{Bytes, B256};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::indexer::chain::DriverSettings;
use crate::indexer::planner::PlannerConfig;
use crate::indexer::source::{EventPage, FetchError, IndexerClient, LogClient};
use crate::indexer::types::{BlacklistEvent, Direction, EventSelector, RawEvent, Window};

pub const BASE_TIMESTAMP: u64 = 1_600_000_000;

/// Fast settings: 100-position windows, floor 10, no pacing, 10ms polls.
pub fn driver_settings() -> DriverSettings {
    DriverSettings {
        planner: PlannerConfig {
            default_window: 100,
            min_window: 10,
            super_batch_span: 172_800,
        },
        pacing: Duration::ZERO,
        rate_limit_retries: 3,
        rate_limit_backoff: Duration::from_millis(1),
        resync_interval: Duration::from_secs(3600),
        poll_interval: Duration::from_millis(10),
        live_lookback: 60_000,
        settle_margin: 0,
        resync_super_batches: 1,
        channel_capacity: 16,
    }
}

/// A USDT event on "ethereum" at `block`, log index 0.
pub fn event(address: &str, direction: Direction, block: u64) -> BlacklistEvent {
    BlacklistEvent {
        address: address.to_string(),
        token: "USDT".to_string(),
        network: "ethereum".to_string(),
        direction,
        block_number: block,
        log_index: 0,
        transaction_hash: format!("0x{block:064x}"),
        timestamp: BASE_TIMESTAMP + block,
    }
}

/// A log-indexed raw event without a provider timestamp.
pub fn log_event(
    contract: &str,
    selector: B256,
    topics: Vec<B256>,
    data: Bytes,
    block: u64,
) -> RawEvent {
    RawEvent {
        contract: contract.to_string(),
        selector: EventSelector::Topic(selector),
        topics,
        data,
        fields: HashMap::new(),
        block_number: block,
        log_index: 0,
        transaction_hash: format!("0x{block:064x}"),
        timestamp: None,
    }
}

/// An indexer raw event carrying one decoded field.
pub fn indexer_event(
    contract: &str,
    event_name: &str,
    field_name: &str,
    field_value: &str,
    block: u64,
    timestamp: u64,
) -> RawEvent {
    RawEvent {
        contract: contract.to_string(),
        selector: EventSelector::Name(event_name.to_string()),
        topics: Vec::new(),
        data: Bytes::new(),
        fields: HashMap::from([(field_name.to_string(), field_value.to_string())]),
        block_number: block,
        log_index: 0,
        transaction_hash: format!("{block:064x}"),
        timestamp: Some(timestamp),
    }
}

/// 32-byte word with `address` (0x-hex) right-aligned, as it appears in a
/// topic or an ABI-encoded payload.
pub fn address_word(address: &str) -> B256 {
    let mut word = [0u8; 32];
    let bytes = hex::decode(address.trim_start_matches("0x")).unwrap();
    word[32 - bytes.len()..].copy_from_slice(&bytes);
    B256::from(word)
}

/// In-memory `LogClient` serving a fixed log set filtered by window.
#[derive(Default)]
pub struct FakeLogClient {
    head: AtomicU64,
    logs: Mutex<Vec<RawEvent>>,
    /// Windows wider than this are rejected as too large.
    max_span: Option<u64>,
    /// Remaining rate-limit rejections to hand out before serving.
    rate_limits: AtomicUsize,
    fail_at_block: Mutex<Option<u64>>,
    requests: Mutex<Vec<Window>>,
    timestamp_lookups: AtomicUsize,
    head_reads: AtomicUsize,
    /// Events a subscription delivers before the stream ends. `None` means
    /// subscriptions are unsupported.
    subscription: Mutex<Option<Vec<RawEvent>>>,
    subscriptions: AtomicUsize,
}

impl FakeLogClient {
    pub fn new(head: u64, logs: Vec<RawEvent>) -> Self {
        Self {
            head: AtomicU64::new(head),
            logs: Mutex::new(logs),
            ..Default::default()
        }
    }

    pub fn with_max_span(mut self, span: u64) -> Self {
        self.max_span = Some(span);
        self
    }

    pub fn with_rate_limits(self, count: usize) -> Self {
        self.rate_limits.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_subscription(self, events: Vec<RawEvent>) -> Self {
        *self.subscription.lock().unwrap() = Some(events);
        self
    }

    /// Fail every request whose window covers `block` with a transport error.
    pub fn fail_at(&self, block: Option<u64>) {
        *self.fail_at_block.lock().unwrap() = block;
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn push_log(&self, log: RawEvent) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn requests(&self) -> Vec<Window> {
        self.requests.lock().unwrap().clone()
    }

    pub fn timestamp_lookups(&self) -> usize {
        self.timestamp_lookups.load(Ordering::SeqCst)
    }

    pub fn head_reads(&self) -> usize {
        self.head_reads.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogClient for FakeLogClient {
    async fn current_head(&self) -> Result<u64, FetchError> {
        let head = self.head.load(Ordering::SeqCst);
        self.head_reads.fetch_add(1, Ordering::SeqCst);
        Ok(head)
    }

    async fn fetch_logs(
        &self,
        window: Window,
        contract: &str,
        topic0: B256,
    ) -> Result<Vec<RawEvent>, FetchError> {
        self.requests.lock().unwrap().push(window);

        if let Some(block) = *self.fail_at_block.lock().unwrap() {
            if window.from <= block && block <= window.to {
                return Err(FetchError::Transport("connection reset by peer".to_string()));
            }
        }
        if self
            .rate_limits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FetchError::RateLimited("429 Too Many Requests".to_string()));
        }
        if let Some(max) = self.max_span {
            if window.span() > max {
                return Err(FetchError::RangeLimit {
                    window,
                    message: format!("query returned more than {max} results"),
                });
            }
        }

        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                log.contract == contract
                    && log.selector == EventSelector::Topic(topic0)
                    && window.from <= log.block_number
                    && log.block_number <= window.to
            })
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, FetchError> {
        self.timestamp_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(BASE_TIMESTAMP + block)
    }

    /// Delivers the scripted events, then ends the stream with a transport
    /// error.
    async fn subscribe_logs(
        &self,
        _contracts: Vec<String>,
        _topics: Vec<B256>,
        sink: mpsc::Sender<RawEvent>,
        _shutdown: CancellationToken,
    ) -> Result<(), FetchError> {
        let Some(events) = self.subscription.lock().unwrap().clone() else {
            return Err(FetchError::Unsupported("log subscription"));
        };
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        for event in events {
            if sink.send(event).await.is_err() {
                return Ok(());
            }
        }
        Err(FetchError::Transport("log stream ended".to_string()))
    }
}

/// `IndexerClient` that replays scripted pages, then serves `events` by
/// timestamp window in a single page.
#[derive(Default)]
pub struct FakeIndexer {
    head: AtomicU64,
    pages: Mutex<VecDeque<EventPage>>,
    events: Mutex<Vec<RawEvent>>,
    tokens: Mutex<Vec<Option<String>>>,
}

impl FakeIndexer {
    pub fn with_pages(pages: Vec<EventPage>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            ..Default::default()
        }
    }

    /// `events` carry timestamps in seconds; windows are in milliseconds.
    pub fn with_events(head_ms: u64, events: Vec<RawEvent>) -> Self {
        Self {
            head: AtomicU64::new(head_ms),
            events: Mutex::new(events),
            ..Default::default()
        }
    }

    pub fn set_head(&self, head_ms: u64) {
        self.head.store(head_ms, Ordering::SeqCst);
    }

    pub fn push_event(&self, event: RawEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn requested_tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl IndexerClient for FakeIndexer {
    async fn current_head(&self) -> Result<u64, FetchError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn fetch_events(
        &self,
        window: Window,
        contract: &str,
        event_name: &str,
        _page_size: usize,
        continuation: Option<&str>,
    ) -> Result<EventPage, FetchError> {
        self.tokens
            .lock()
            .unwrap()
            .push(continuation.map(str::to_string));

        if let Some(page) = self.pages.lock().unwrap().pop_front() {
            return Ok(page);
        }

        let events = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                let ms = e.timestamp.unwrap_or_default() * 1000;
                e.contract == contract
                    && e.selector == EventSelector::Name(event_name.to_string())
                    && window.from <= ms
                    && ms <= window.to
            })
            .cloned()
            .collect();
        Ok(EventPage { events, next: None })
    }
}
