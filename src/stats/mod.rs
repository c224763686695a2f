//! Request counters for the orchestrator's decision branches.
//!
//! Totals are plain atomics. Per request-key and per-API counts live in a
//! [`DashMap`] so concurrent requests for different keys do not contend.
//! Nothing here exports metrics; [`Stats::snapshot`] is what the stats route
//! and the diagnostic session read.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// One observable outcome of request handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Hit,
    Miss,
    Skipped,
    LocalHandled,
    Proxied,
    CacheAdded,
    BackendFailed,
}

/// Counters for one `(request-key, API)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApiStats {
    pub hits: u64,
    pub misses: u64,
    pub skipped: u64,
    pub local_handled: u64,
    pub proxied: u64,
    pub cache_added: u64,
    pub backend_failed: u64,
}

impl ApiStats {
    fn bump(&mut self, event: Event) {
        let slot = match event {
            Event::Hit => &mut self.hits,
            Event::Miss => &mut self.misses,
            Event::Skipped => &mut self.skipped,
            Event::LocalHandled => &mut self.local_handled,
            Event::Proxied => &mut self.proxied,
            Event::CacheAdded => &mut self.cache_added,
            Event::BackendFailed => &mut self.backend_failed,
        };
        *slot += 1;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KeyStats {
    pub invalidations: u64,
    pub apis: BTreeMap<String, ApiStats>,
}

#[derive(Debug, Default)]
struct KeyCounters {
    invalidations: u64,
    apis: HashMap<String, ApiStats>,
}

/// Process-wide totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub skipped: u64,
    pub local_handled: u64,
    pub proxied: u64,
    pub cache_added: u64,
    pub backend_failed: u64,
    pub rejected: u64,
    pub invalidations: u64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub totals: Totals,
    pub keys: BTreeMap<String, KeyStats>,
}

impl StatsSnapshot {
    /// Sums the per-API counters of every key, grouped by API path.
    pub fn by_api(&self) -> BTreeMap<&str, ApiStats> {
        let mut out: BTreeMap<&str, ApiStats> = BTreeMap::new();
        for key in self.keys.values() {
            for (api, s) in &key.apis {
                let acc = out.entry(api.as_str()).or_default();
                acc.hits += s.hits;
                acc.misses += s.misses;
                acc.skipped += s.skipped;
                acc.local_handled += s.local_handled;
                acc.proxied += s.proxied;
                acc.cache_added += s.cache_added;
                acc.backend_failed += s.backend_failed;
            }
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct Stats {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    skipped: AtomicU64,
    local_handled: AtomicU64,
    proxied: AtomicU64,
    cache_added: AtomicU64,
    backend_failed: AtomicU64,
    rejected: AtomicU64,
    invalidations: AtomicU64,
    keys: DashMap<String, KeyCounters>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts an inbound request before any decision is made.
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request refused by worker backpressure.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self, key: &str) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        self.keys.entry(key.to_owned()).or_default().invalidations += 1;
    }

    pub fn record(&self, key: &str, api: &str, event: Event) {
        let total = match event {
            Event::Hit => &self.hits,
            Event::Miss => &self.misses,
            Event::Skipped => &self.skipped,
            Event::LocalHandled => &self.local_handled,
            Event::Proxied => &self.proxied,
            Event::CacheAdded => &self.cache_added,
            Event::BackendFailed => &self.backend_failed,
        };
        total.fetch_add(1, Ordering::Relaxed);

        let mut counters = self.keys.entry(key.to_owned()).or_default();
        counters.apis.entry(api.to_owned()).or_default().bump(event);
    }

    /// Number of request-keys seen so far.
    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn totals(&self) -> Totals {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Totals {
            requests: load(&self.requests),
            hits: load(&self.hits),
            misses: load(&self.misses),
            skipped: load(&self.skipped),
            local_handled: load(&self.local_handled),
            proxied: load(&self.proxied),
            cache_added: load(&self.cache_added),
            backend_failed: load(&self.backend_failed),
            rejected: load(&self.rejected),
            invalidations: load(&self.invalidations),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let keys = self
            .keys
            .iter()
            .map(|entry| {
                let counters = entry.value();
                let stats = KeyStats {
                    invalidations: counters.invalidations,
                    apis: counters
                        .apis
                        .iter()
                        .map(|(api, s)| (api.clone(), *s))
                        .collect(),
                };
                (entry.key().clone(), stats)
            })
            .collect();

        StatsSnapshot {
            totals: self.totals(),
            keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_update_totals_and_per_key_counts() {
        let stats = Stats::new();
        stats.record_request();
        stats.record_request();
        stats.record("cp-1", "/a", Event::Miss);
        stats.record("cp-1", "/a", Event::Proxied);
        stats.record("cp-1", "/a", Event::CacheAdded);
        stats.record("cp-1", "/a", Event::Hit);
        stats.record("cp-2", "/a", Event::BackendFailed);
        stats.record_invalidation("cp-1");
        stats.record_rejected();

        let totals = stats.totals();
        assert_eq!(totals.requests, 2);
        assert_eq!(totals.hits, 1);
        assert_eq!(totals.misses, 1);
        assert_eq!(totals.backend_failed, 1);
        assert_eq!(totals.invalidations, 1);
        assert_eq!(totals.rejected, 1);

        let snap = stats.snapshot();
        assert_eq!(stats.tracked_keys(), 2);
        let cp1 = &snap.keys["cp-1"];
        assert_eq!(cp1.invalidations, 1);
        assert_eq!(cp1.apis["/a"].proxied, 1);
        assert_eq!(cp1.apis["/a"].cache_added, 1);

        let by_api = snap.by_api();
        assert_eq!(by_api["/a"].backend_failed, 1);
        assert_eq!(by_api["/a"].hits, 1);
    }

    #[test]
    fn snapshot_serialises_to_json() {
        let stats = Stats::new();
        stats.record("k", "/x", Event::Skipped);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["totals"]["skipped"], 1);
        assert_eq!(json["keys"]["k"]["apis"]["/x"]["skipped"], 1);
    }
}
