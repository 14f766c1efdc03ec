//! Loop counters readable from other threads.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters updated by the loop thread.
///
/// Only the loop writes; other threads take [`LoopStats::snapshot`]s.
#[derive(Debug, Default)]
pub struct LoopStats {
    open_connections: AtomicUsize,
    capacity: AtomicUsize,
    accepted: AtomicUsize,
    dispatched: AtomicUsize,
    hung_up: AtomicUsize,
    accept_errors: AtomicUsize,
    refused: AtomicUsize,
    handler_errors: AtomicUsize,
}

/// Point-in-time copy of [`LoopStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Accepted connections currently registered.
    pub open_connections: usize,
    /// Registry capacity in entries, listener included.
    pub capacity: usize,
    pub accepted: usize,
    /// Connections handed to the handler.
    pub dispatched: usize,
    /// Connections closed on error/hangup without calling the handler.
    pub hung_up: usize,
    pub accept_errors: usize,
    /// Accepted connections closed at once because the registry was at its
    /// connection limit or could not grow.
    pub refused: usize,
    pub handler_errors: usize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl LoopStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            open_connections: self.open_connections.load(Ordering::Relaxed),
            capacity: self.capacity.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            hung_up: self.hung_up.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_registry(&self, connections: usize, capacity: usize) {
        self.open_connections.store(connections, Ordering::Relaxed);
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    pub(crate) fn record_accept(&self) {
        bump(&self.accepted);
    }

    pub(crate) fn record_dispatch(&self) {
        bump(&self.dispatched);
    }

    pub(crate) fn record_hangup(&self) {
        bump(&self.hung_up);
    }

    pub(crate) fn record_accept_error(&self) {
        bump(&self.accept_errors);
    }

    pub(crate) fn record_refused(&self) {
        bump(&self.refused);
    }

    pub(crate) fn record_handler_error(&self) {
        bump(&self.handler_errors);
    }
}
