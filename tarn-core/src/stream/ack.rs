//! Acknowledgement bookkeeping for one active stream.
//!
//! The backend is allowed a bounded number of unacknowledged batches in
//! flight. Every batch moves through an explicit lifecycle:
//! `received → acked-on-arrival | queued → acked-on-consumption → done`.

use std::collections::HashSet;

pub(crate) const DEFAULT_PREFETCH_WINDOW: usize = 3;

#[derive(Debug)]
pub(crate) struct AckWindow {
    window: usize,
    /// Batches acknowledged on arrival that have not been consumed yet.
    prefetched: usize,
    unbounded: bool,
    acked: HashSet<u64>,
    arrival_acked: HashSet<u64>,
}

impl AckWindow {
    pub(crate) fn new(window: usize) -> Self {
        AckWindow {
            window,
            prefetched: 0,
            unbounded: false,
            acked: HashSet::new(),
            arrival_acked: HashSet::new(),
        }
    }

    /// Record a batch arrival. Returns `true` when the batch must be
    /// acknowledged immediately (prefetch slot open, or unbounded mode).
    pub(crate) fn on_arrival(&mut self, batch_id: u64) -> bool {
        if self.unbounded {
            return self.acked.insert(batch_id);
        }

        if self.prefetched < self.window && self.acked.insert(batch_id) {
            self.prefetched += 1;
            self.arrival_acked.insert(batch_id);
            return true;
        }

        false
    }

    /// Record consumption of a dequeued batch. Returns `true` when the
    /// batch must be acknowledged now (it was not acked on arrival).
    ///
    /// Consuming a prefetch-acked batch re-opens one arrival slot; without
    /// the decrement the window would stay saturated for the rest of the
    /// stream.
    pub(crate) fn on_consume(&mut self, batch_id: u64) -> bool {
        if self.arrival_acked.remove(&batch_id) {
            self.prefetched -= 1;
            return false;
        }

        self.acked.insert(batch_id)
    }

    /// Switch to unbounded prefetch. Returns the queued-but-unacked batch
    /// ids whose acknowledgements must be flushed immediately.
    pub(crate) fn set_unbounded(&mut self, queued: impl IntoIterator<Item = u64>) -> Vec<u64> {
        self.unbounded = true;
        queued
            .into_iter()
            .filter(|id| self.acked.insert(*id))
            .collect()
    }

    #[cfg(test)]
    fn acked_count(&self) -> usize {
        self.acked.len()
    }
}
