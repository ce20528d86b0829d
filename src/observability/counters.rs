//! Atomic counters for hot-path statistics.
//!
//! IMPORTANT: counters may be globally disabled, so no logic may depend
//! on their values; they exist for introspection and diagnostics only.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static COUNTERS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Globally enables or disables counter updates.
pub fn set_counters_enabled(enabled: bool) {
    COUNTERS_ENABLED.store(enabled, Ordering::Relaxed);
}

fn enabled() -> bool {
    COUNTERS_ENABLED.load(Ordering::Relaxed)
}

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        if enabled() {
            self.value.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add(&self, delta: u64) {
        if enabled() {
            self.value.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Per-pip statistics, reported through introspection.
#[derive(Debug, Default)]
pub struct PipCounters {
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub reports_sent: Counter,
    pub reports_dropped: Counter,
}

impl PipCounters {
    pub fn snapshot(&self) -> PipCountersSnapshot {
        PipCountersSnapshot {
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            reports_sent: self.reports_sent.get(),
            reports_dropped: self.reports_dropped.get(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipCountersSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub reports_sent: u64,
    pub reports_dropped: u64,
}

/// Core-wide statistics shared by all clients.
#[derive(Debug, Default)]
pub struct CoreCounters {
    pub reports_enqueued: Counter,
    pub reports_dequeued: Counter,
    pub enqueue_failures: Counter,
    pub tree_completions: Counter,
    pub clients_attached: Counter,
    pub clients_detached: Counter,
    pub tracker_inconsistencies: Counter,
}

impl CoreCounters {
    pub fn snapshot(&self) -> CoreCountersSnapshot {
        CoreCountersSnapshot {
            reports_enqueued: self.reports_enqueued.get(),
            reports_dequeued: self.reports_dequeued.get(),
            enqueue_failures: self.enqueue_failures.get(),
            tree_completions: self.tree_completions.get(),
            clients_attached: self.clients_attached.get(),
            clients_detached: self.clients_detached.get(),
            tracker_inconsistencies: self.tracker_inconsistencies.get(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreCountersSnapshot {
    pub reports_enqueued: u64,
    pub reports_dequeued: u64,
    pub enqueue_failures: u64,
    pub tree_completions: u64,
    pub clients_attached: u64,
    pub clients_detached: u64,
    pub tracker_inconsistencies: u64,
}
