//! Live mode: a per-network watcher that feeds freshly emitted events into the
//! store without touching sync cursors. Anything it misses is picked up by the
//! next periodic re-backfill.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::chain::{event_timestamp, retry_rpc, ChainDriver};
use super::source::{ChainEventSource, FetchError, LogClient};
use super::types::{BlacklistEvent, EventSelector, RawEvent, Window};
use crate::db::DenylistStore;

const MAX_APPLY_BATCH: usize = 256;

pub struct LiveFeed {
    driver: Arc<ChainDriver>,
    sink: mpsc::Sender<BlacklistEvent>,
}

impl LiveFeed {
    /// Watch the chain until `shutdown` fires, applying events as they arrive.
    pub async fn run(driver: Arc<ChainDriver>, shutdown: CancellationToken) {
        let (sink, events) = mpsc::channel(driver.settings().channel_capacity.max(1));
        let consumer = tokio::spawn(apply_events(
            driver.network().to_string(),
            driver.store(),
            events,
        ));

        let feed = LiveFeed { driver, sink };
        match feed.driver.source() {
            ChainEventSource::Log(_) => feed.watch_logs(&shutdown).await,
            ChainEventSource::Indexer(_) => feed.poll_indexer(&shutdown).await,
        }

        // Closing the sender lets the consumer drain and exit.
        let network = feed.driver.network().to_string();
        drop(feed);
        if let Err(e) = consumer.await {
            tracing::error!(network = %network, error = %e, "Live event consumer panicked");
        }
    }

    fn network(&self) -> &str {
        self.driver.network()
    }

    async fn watch_logs(&self, shutdown: &CancellationToken) {
        if let Some(client) = self.driver.source().log_client() {
            match self.subscribe(client, shutdown).await {
                Ok(()) => return,
                Err(FetchError::Unsupported(what)) => {
                    tracing::debug!(
                        network = %self.network(),
                        "{} unavailable, using HTTP polling",
                        what
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        network = %self.network(),
                        error = %e,
                        "Log subscription failed, falling back to HTTP polling"
                    );
                }
            }
        }

        if !shutdown.is_cancelled() {
            self.poll_logs(shutdown).await;
        }
    }

    async fn subscribe(
        &self,
        client: &Arc<dyn LogClient>,
        shutdown: &CancellationToken,
    ) -> Result<(), FetchError> {
        let layouts = self.driver.layouts();
        let contracts = layouts.iter().map(|l| l.contract.clone()).collect();
        let topics = layouts
            .iter()
            .flat_map(|l| l.events.iter())
            .filter_map(|kind| match kind.selector {
                EventSelector::Topic(topic) => Some(topic),
                EventSelector::Name(_) => None,
            })
            .collect();

        let capacity = self.driver.settings().channel_capacity.max(1);
        let (raw_tx, mut raw_rx) = mpsc::channel::<RawEvent>(capacity);
        let subscription = client.subscribe_logs(contracts, topics, raw_tx, shutdown.clone());
        let forward = async move {
            while let Some(raw) = raw_rx.recv().await {
                if !self.forward(vec![raw], shutdown).await {
                    break;
                }
            }
        };

        let (result, ()) = tokio::join!(subscription, forward);
        result
    }

    /// Poll the head and fetch `[last_head + 1, head]`, clipped to one window.
    async fn poll_logs(&self, shutdown: &CancellationToken) {
        let source = self.driver.source();
        let settings = self.driver.settings();
        let mut last_head = retry_rpc(shutdown, || source.current_head()).await.ok();

        tracing::info!(
            network = %self.network(),
            poll_interval_ms = settings.poll_interval.as_millis() as u64,
            last_head,
            "HTTP polling active"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(settings.poll_interval) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!(network = %self.network(), "Shutdown received, stopping poller");
                    break;
                }
            }

            let head = match source.current_head().await {
                Ok(head) => head,
                Err(e) => {
                    tracing::warn!(network = %self.network(), error = %e, "Failed to get head");
                    continue;
                }
            };
            let Some(previous) = last_head else {
                last_head = Some(head);
                continue;
            };
            if head <= previous {
                continue;
            }

            let span = settings.planner.default_window.max(1);
            let from = (previous + 1).max(head.saturating_sub(span - 1));
            let Some(raw) = self.fetch_all(Window::new(from, head)).await else {
                continue;
            };
            if !self.forward(raw, shutdown).await {
                break;
            }
            last_head = Some(head);
        }
    }

    /// Poll `[now - lookback, now]` every interval. Overlap between polls is
    /// harmless since the store ignores writes that aren't newer.
    async fn poll_indexer(&self, shutdown: &CancellationToken) {
        let source = self.driver.source();
        let settings = self.driver.settings();
        let lookback = settings
            .live_lookback
            .max(settings.poll_interval.as_millis() as u64 * 2);

        tracing::info!(
            network = %self.network(),
            poll_interval_ms = settings.poll_interval.as_millis() as u64,
            lookback_ms = lookback,
            "Indexer polling active"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(settings.poll_interval) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!(network = %self.network(), "Shutdown received, stopping poller");
                    break;
                }
            }

            let now = match source.current_head().await {
                Ok(now) => now,
                Err(e) => {
                    tracing::warn!(
                        network = %self.network(),
                        error = %e,
                        "Failed to get indexer head"
                    );
                    continue;
                }
            };

            let window = Window::new(now.saturating_sub(lookback), now);
            if let Some(raw) = self.fetch_all(window).await {
                if !self.forward(raw, shutdown).await {
                    break;
                }
            }
        }
    }

    async fn fetch_all(&self, window: Window) -> Option<Vec<RawEvent>> {
        let mut raw = Vec::new();
        for layout in self.driver.layouts() {
            match self.driver.source().fetch(layout, window).await {
                Ok(events) => raw.extend(events),
                Err(e) => {
                    tracing::warn!(
                        network = %self.network(),
                        token = %layout.token,
                        %window,
                        error = %e,
                        "Live fetch failed"
                    );
                    return None;
                }
            }
        }
        Some(raw)
    }

    /// Normalize and hand events to the consumer. Malformed events are logged
    /// and dropped. Returns `false` once the consumer is gone.
    async fn forward(&self, raw: Vec<RawEvent>, shutdown: &CancellationToken) -> bool {
        if raw.is_empty() {
            return true;
        }

        let timestamps = match self.driver.resolve_timestamps(&raw, shutdown).await {
            Ok(timestamps) => timestamps,
            Err(e) => {
                tracing::warn!(
                    network = %self.network(),
                    events = raw.len(),
                    error = %e,
                    "Failed to resolve block timestamps, dropping live events"
                );
                return true;
            }
        };

        for event in &raw {
            let timestamp = event_timestamp(event, &timestamps);
            match self.driver.normalizer().normalize(event, timestamp) {
                Ok(normalized) => {
                    if self.sink.send(normalized).await.is_err() {
                        return false;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        network = %self.network(),
                        block = event.block_number,
                        tx = %event.transaction_hash,
                        error = %e,
                        "Dropping malformed live event"
                    );
                }
            }
        }
        true
    }
}

/// Drain the live channel into the store until every sender is gone.
pub async fn apply_events(
    network: String,
    store: Arc<dyn DenylistStore>,
    mut events: mpsc::Receiver<BlacklistEvent>,
) {
    let mut batch = Vec::with_capacity(MAX_APPLY_BATCH);
    while events.recv_many(&mut batch, MAX_APPLY_BATCH).await > 0 {
        match store.upsert(&batch).await {
            Ok(written) => {
                if written > 0 {
                    tracing::info!(
                        network = %network,
                        events = batch.len(),
                        written,
                        "Applied live events"
                    );
                }
            }
            Err(e) => {
                tracing::error!(
                    network = %network,
                    events = batch.len(),
                    error = %e,
                    "Failed to apply live events"
                );
            }
        }
        batch.clear();
    }
}
