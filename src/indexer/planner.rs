//! Window planning for backfill passes.
//!
//! A pass covers `cursor + 1 ..= head`. That span is cut into super-batches of
//! bounded size, and each super-batch into fetch windows whose size shrinks
//! whenever the provider rejects a query as too large.

use super::types::Window;

/// Static sizing for one network's backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerConfig {
    pub default_window: u64,
    pub min_window: u64,
    pub super_batch_span: u64,
}

/// Mutable planning state threaded through a backfill loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerState {
    pub window_size: u64,
}

impl PlannerState {
    pub fn new(config: &PlannerConfig) -> Self {
        Self {
            window_size: config.default_window.max(config.min_window).max(1),
        }
    }

    /// The next window starting at `from`, clipped to `limit`.
    pub fn window(&self, from: u64, limit: u64) -> Window {
        let to = from.saturating_add(self.window_size - 1).min(limit);
        Window::new(from, to)
    }

    /// Halve the window after `failed` was rejected as too large.
    ///
    /// Returns `false` when `failed` is already at or below `floor`, meaning
    /// retrying with a smaller window is not allowed.
    pub fn shrink(&mut self, failed: Window, floor: u64) -> bool {
        let floor = floor.max(1);
        if failed.span() <= floor {
            self.window_size = floor;
            return false;
        }
        self.window_size = (self.window_size.min(failed.span()) / 2).max(floor);
        true
    }
}

/// Iterator over the super-batches covering `cursor + 1 ..= head`.
#[derive(Debug, Clone)]
pub struct SuperBatches {
    next_from: u64,
    head: u64,
    span: u64,
    exhausted: bool,
}

pub fn super_batches(cursor: u64, head: u64, span: u64) -> SuperBatches {
    SuperBatches {
        next_from: cursor.saturating_add(1),
        head,
        span: span.max(1),
        exhausted: cursor >= head,
    }
}

impl Iterator for SuperBatches {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        if self.exhausted || self.next_from > self.head {
            return None;
        }
        let to = self
            .next_from
            .saturating_add(self.span - 1)
            .min(self.head);
        let batch = Window::new(self.next_from, to);
        if to == self.head {
            self.exhausted = true;
        } else {
            self.next_from = to + 1;
        }
        Some(batch)
    }
}
