use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::live::LiveFeed;
use super::normalizer::{ContractLayout, NormalizeError, Normalizer};
use super::planner::{super_batches, PlannerConfig, PlannerState};
use super::source::{ChainEventSource, FetchError};
use super::types::{BlacklistEvent, Checkpoint, PositionAxis, RawEvent, SyncCursor, Window};
use crate::db::{DenylistStore, StoreError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{network}/{token}: window {window} is still too large at the minimum window size")]
    WindowFloor {
        network: String,
        token: String,
        window: Window,
    },

    #[error("{network}/{token}: still rate limited on window {window} after {attempts} attempts")]
    RateLimitExhausted {
        network: String,
        token: String,
        window: Window,
        attempts: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Backfilling,
    Live,
}

/// Per-network tuning for backfill and live mode.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub planner: PlannerConfig,
    /// Delay between committed windows.
    pub pacing: Duration,
    pub rate_limit_retries: u32,
    /// First rate-limit backoff; doubles per consecutive rejection.
    pub rate_limit_backoff: Duration,
    pub resync_interval: Duration,
    pub poll_interval: Duration,
    /// Indexer chains: how far back each live poll reaches, in positions.
    pub live_lookback: u64,
    /// Backfill stops this many positions short of the reported head.
    pub settle_margin: u64,
    /// Super-batches per token covered by one periodic re-backfill pass.
    pub resync_super_batches: usize,
    pub channel_capacity: usize,
}

/// Counters for one backfill pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub windows: usize,
    pub events: usize,
    pub written: usize,
    pub cancelled: bool,
}

impl PassReport {
    fn absorb(&mut self, other: PassReport) {
        self.windows += other.windows;
        self.events += other.events;
        self.written += other.written;
        self.cancelled |= other.cancelled;
    }
}

/// Drives backfill and live sync for every token of one network.
pub struct ChainDriver {
    network: String,
    source: ChainEventSource,
    store: Arc<dyn DenylistStore>,
    layouts: Vec<ContractLayout>,
    normalizer: Normalizer,
    settings: DriverSettings,
    phase: watch::Sender<SyncPhase>,
}

impl ChainDriver {
    pub fn new(
        network: &str,
        source: ChainEventSource,
        store: Arc<dyn DenylistStore>,
        layouts: Vec<ContractLayout>,
        settings: DriverSettings,
    ) -> Self {
        let normalizer = Normalizer::new(network, &layouts);
        let (phase, _) = watch::channel(SyncPhase::Backfilling);
        Self {
            network: network.to_string(),
            source,
            store,
            layouts,
            normalizer,
            settings,
            phase,
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn source(&self) -> &ChainEventSource {
        &self.source
    }

    pub fn store(&self) -> Arc<dyn DenylistStore> {
        self.store.clone()
    }

    pub fn layouts(&self) -> &[ContractLayout] {
        &self.layouts
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    /// Backfill, then run the live feed and the periodic re-backfill until
    /// `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            network = %self.network,
            tokens = self.layouts.len(),
            "Starting chain driver"
        );

        self.phase.send_replace(SyncPhase::Backfilling);
        match self.run_backfill_once(false, &shutdown).await {
            Ok(report) => tracing::info!(
                network = %self.network,
                windows = report.windows,
                events = report.events,
                written = report.written,
                "Initial backfill finished"
            ),
            Err(e) => tracing::error!(
                network = %self.network,
                error = %e,
                "Initial backfill failed, periodic re-backfill will retry"
            ),
        }

        if shutdown.is_cancelled() {
            return;
        }

        self.phase.send_replace(SyncPhase::Live);
        tracing::info!(network = %self.network, "Switching to live mode");

        tokio::join!(
            LiveFeed::run(self.clone(), shutdown.clone()),
            self.resync_loop(&shutdown)
        );

        tracing::info!(network = %self.network, "Chain driver stopped");
    }

    async fn resync_loop(&self, shutdown: &CancellationToken) {
        let period = self.settings.resync_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            match self.run_reconciliation_pass(shutdown).await {
                Ok(report) => tracing::info!(
                    network = %self.network,
                    windows = report.windows,
                    events = report.events,
                    written = report.written,
                    "Re-backfill pass finished"
                ),
                Err(e) => tracing::error!(
                    network = %self.network,
                    error = %e,
                    "Re-backfill pass failed"
                ),
            }
        }
    }

    /// One backfill pass over every token, from its cursor to the current head.
    ///
    /// With `force_full_resync` each token's records and cursor are cleared
    /// first and the pass starts again from the token's start position.
    pub async fn run_backfill_once(
        &self,
        force_full_resync: bool,
        shutdown: &CancellationToken,
    ) -> Result<PassReport, SyncError> {
        self.backfill_pass(force_full_resync, None, shutdown).await
    }

    /// Periodic re-backfill: like [`Self::run_backfill_once`], but each token
    /// covers at most `resync_super_batches` super-batches. Whatever is left
    /// is picked up by the next pass.
    pub async fn run_reconciliation_pass(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<PassReport, SyncError> {
        let limit = self.settings.resync_super_batches.max(1);
        self.backfill_pass(false, Some(limit), shutdown).await
    }

    async fn backfill_pass(
        &self,
        force_full_resync: bool,
        max_super_batches: Option<usize>,
        shutdown: &CancellationToken,
    ) -> Result<PassReport, SyncError> {
        let mut report = PassReport::default();
        for layout in &self.layouts {
            let token_report = self
                .sync_token(layout, force_full_resync, max_super_batches, shutdown)
                .await?;
            report.absorb(token_report);
            if report.cancelled {
                break;
            }
        }
        Ok(report)
    }

    /// Where to resume on the source's axis, and the highest block reached.
    fn resume_point(&self, layout: &ContractLayout, stored: Option<&SyncCursor>) -> (u64, u64) {
        let origin = layout.start_position.saturating_sub(1);
        match (self.source.axis(), stored) {
            (_, None) => (origin, 0),
            (PositionAxis::Block, Some(cursor)) => {
                (cursor.last_synced_position, cursor.last_synced_position)
            }
            (PositionAxis::Timestamp, Some(cursor)) => (
                cursor.last_synced_timestamp.unwrap_or(origin),
                cursor.last_synced_position,
            ),
        }
    }

    async fn sync_token(
        &self,
        layout: &ContractLayout,
        force_full_resync: bool,
        max_super_batches: Option<usize>,
        shutdown: &CancellationToken,
    ) -> Result<PassReport, SyncError> {
        let token = layout.token.as_str();
        let mut report = PassReport::default();

        if force_full_resync {
            let cleared = self.store.reset(&self.network, token).await?;
            tracing::warn!(
                network = %self.network,
                token,
                cleared,
                "Full resync requested, cleared stored records and cursor"
            );
        }

        let stored = self.store.load_cursor(&self.network, token).await?;
        let (cursor, mut reached) = self.resume_point(layout, stored.as_ref());
        let head = retry_rpc(shutdown, || self.source.current_head())
            .await?
            .saturating_sub(self.settings.settle_margin);

        if cursor >= head {
            tracing::debug!(network = %self.network, token, cursor, head, "Already at head");
            return Ok(report);
        }

        tracing::info!(
            network = %self.network,
            token,
            from = cursor + 1,
            to = head,
            "Starting backfill"
        );

        let planner = self.settings.planner;
        let mut state = PlannerState::new(&planner);
        let mut covered = cursor;

        let batches = super_batches(cursor, head, planner.super_batch_span)
            .take(max_super_batches.unwrap_or(usize::MAX));
        for batch in batches {
            let progress = ((batch.from - cursor) as f64 / (head - cursor) as f64 * 100.0) as u32;
            tracing::info!(
                network = %self.network,
                token,
                from = batch.from,
                to = batch.to,
                progress = %format!("{}%", progress),
                "Backfilling super-batch"
            );

            let mut from = batch.from;
            let mut rate_limited = 0u32;
            loop {
                if shutdown.is_cancelled() {
                    tracing::info!(
                        network = %self.network,
                        token,
                        "Shutdown received, stopping backfill"
                    );
                    report.cancelled = true;
                    return Ok(report);
                }

                let window = state.window(from, batch.to);
                match self.process_window(layout, window, reached, shutdown).await {
                    Ok((events, written, checkpoint)) => {
                        report.windows += 1;
                        report.events += events;
                        report.written += written;
                        reached = checkpoint.position;
                        rate_limited = 0;
                        if window.to >= batch.to {
                            break;
                        }
                        from = window.to + 1;
                        self.pace(shutdown).await;
                    }
                    Err(SyncError::Fetch(FetchError::RangeLimit { message, .. })) => {
                        if !state.shrink(window, planner.min_window) {
                            return Err(SyncError::WindowFloor {
                                network: self.network.clone(),
                                token: token.to_string(),
                                window,
                            });
                        }
                        tracing::warn!(
                            network = %self.network,
                            token,
                            %window,
                            window_size = state.window_size,
                            error = %message,
                            "Provider rejected window, shrinking"
                        );
                    }
                    Err(SyncError::Fetch(FetchError::RateLimited(message))) => {
                        rate_limited += 1;
                        if rate_limited > self.settings.rate_limit_retries {
                            return Err(SyncError::RateLimitExhausted {
                                network: self.network.clone(),
                                token: token.to_string(),
                                window,
                                attempts: rate_limited,
                            });
                        }
                        let delay = backoff(self.settings.rate_limit_backoff, rate_limited);
                        tracing::warn!(
                            network = %self.network,
                            token,
                            %window,
                            attempt = rate_limited,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "Rate limited, backing off"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.cancelled() => {}
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            covered = batch.to;
        }

        if covered < head {
            tracing::info!(
                network = %self.network,
                token,
                cursor = covered,
                head,
                windows = report.windows,
                "Super-batch limit reached, continuing on the next pass"
            );
        } else {
            tracing::info!(
                network = %self.network,
                token,
                cursor = head,
                windows = report.windows,
                events = report.events,
                "Backfill complete"
            );
        }
        Ok(report)
    }

    /// Fetch, normalize and commit one window. The cursor only moves when
    /// every event in the window normalized cleanly.
    async fn process_window(
        &self,
        layout: &ContractLayout,
        window: Window,
        reached: u64,
        shutdown: &CancellationToken,
    ) -> Result<(usize, usize, Checkpoint), SyncError> {
        let raw = self.source.fetch(layout, window).await?;
        let timestamps = self.resolve_timestamps(&raw, shutdown).await?;

        let events = raw
            .iter()
            .map(|r| self.normalizer.normalize(r, event_timestamp(r, &timestamps)))
            .collect::<Result<Vec<BlacklistEvent>, _>>()?;

        let checkpoint = match self.source.axis() {
            PositionAxis::Block => Checkpoint::block(window.to),
            PositionAxis::Timestamp => {
                let highest = events.iter().map(|e| e.block_number).max().unwrap_or(0);
                Checkpoint::time(reached.max(highest), window.to)
            }
        };

        let written = self
            .store
            .commit_window(&self.network, &layout.token, &events, checkpoint)
            .await?;

        tracing::debug!(
            network = %self.network,
            token = %layout.token,
            %window,
            events = events.len(),
            written,
            "Committed window"
        );
        Ok((events.len(), written, checkpoint))
    }

    /// Look up the chain time of every block whose events arrived without one.
    pub(crate) async fn resolve_timestamps(
        &self,
        raw: &[RawEvent],
        shutdown: &CancellationToken,
    ) -> Result<HashMap<u64, u64>, FetchError> {
        let missing: BTreeSet<u64> = raw
            .iter()
            .filter(|r| r.timestamp.is_none())
            .map(|r| r.block_number)
            .collect();

        let mut timestamps = HashMap::with_capacity(missing.len());
        for block in missing {
            let ts = retry_rpc(shutdown, || self.source.block_timestamp(block)).await?;
            timestamps.insert(block, ts);
        }
        Ok(timestamps)
    }

    async fn pace(&self, shutdown: &CancellationToken) {
        if self.settings.pacing.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.settings.pacing) => {}
            _ = shutdown.cancelled() => {}
        }
    }
}

pub(crate) fn event_timestamp(raw: &RawEvent, resolved: &HashMap<u64, u64>) -> u64 {
    raw.timestamp
        .or_else(|| resolved.get(&raw.block_number).copied())
        .unwrap_or_default()
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(Duration::from_secs(30))
}

/// Retry a chain read with exponential backoff.
/// Only transient failures (transport errors, rate limits) are retried, and
/// a shutdown during a backoff returns the last error right away.
pub async fn retry_rpc<F, Fut, T>(shutdown: &CancellationToken, mut f: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, FetchError>>,
{
    let mut delay = Duration::from_millis(500);
    let max_retries = 5;

    for attempt in 0..max_retries {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e @ (FetchError::Transport(_) | FetchError::RateLimited(_))) => {
                tracing::warn!(
                    attempt = attempt + 1,
                    max_retries,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "RPC call failed, retrying..."
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => return Err(e),
                }
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }
            Err(e) => return Err(e),
        }
    }

    // Final attempt, error propagates
    f().await
}
