//! Ingestion counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated on the ingestion path
#[derive(Debug, Default)]
pub struct EngineStats {
    pub received: AtomicU64,
    pub malformed: AtomicU64,
    pub accepted: AtomicU64,
    pub echoes: AtomicU64,
    pub duplicates: AtomicU64,
    /// New state unavailable/unknown/empty
    pub invalid_state: AtomicU64,
    pub unmonitored: AtomicU64,
    /// Neither state nor a significant attribute changed
    pub unchanged: AtomicU64,
    pub store_failures: AtomicU64,
    pub suggestions: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub malformed: u64,
    pub accepted: u64,
    pub echoes: u64,
    pub duplicates: u64,
    pub invalid_state: u64,
    pub unmonitored: u64,
    pub unchanged: u64,
    pub store_failures: u64,
    pub suggestions: u64,
}

impl EngineStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            echoes: self.echoes.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            invalid_state: self.invalid_state.load(Ordering::Relaxed),
            unmonitored: self.unmonitored.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            suggestions: self.suggestions.load(Ordering::Relaxed),
        }
    }
}
