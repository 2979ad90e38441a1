//! The reading store.
//!
//! Holds the current readings for every device, plus (optionally) a bounded,
//! age-limited ring of historical read contexts used to serve cached-read
//! queries. The store has a single writer per device (the scheduler's
//! updater task) and many readers (the query layer); current readings are
//! swapped in as a whole `Arc`, so readers never observe a partial update
//! and never block the writer for longer than the pointer swap.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::config::CacheSettings;
use crate::output::{ReadContext, Reading};
use crate::stop::StopSignal;

/// Capacity of the live-readings broadcast channel. Slow subscribers fall
/// behind and observe a lag gap rather than exerting back-pressure on the
/// reading pipeline.
const BROADCAST_CAPACITY: usize = 128;

struct CachedRead {
    at: DateTime<Utc>,
    ctx: ReadContext,
}

struct ReadingCache {
    settings: CacheSettings,
    entries: Mutex<HashMap<String, VecDeque<CachedRead>>>,
}

impl ReadingCache {
    fn add(&self, ctx: &ReadContext) {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let ring = entries.entry(ctx.device.clone()).or_default();

        // Age out expired entries, then enforce the size bound.
        let ttl = chrono::Duration::from_std(self.settings.ttl()).unwrap_or_default();
        while ring.front().is_some_and(|c| now - c.at > ttl) {
            ring.pop_front();
        }
        while ring.len() >= self.settings.size {
            ring.pop_front();
        }
        ring.push_back(CachedRead {
            at: now,
            ctx: ctx.clone(),
        });
    }

    fn window(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<ReadContext> {
        let entries = self.entries.lock();
        let mut hits: Vec<(DateTime<Utc>, ReadContext)> = entries
            .values()
            .flatten()
            .filter(|c| start.is_none_or(|s| c.at >= s))
            .filter(|c| end.is_none_or(|e| c.at <= e))
            .map(|c| (c.at, c.ctx.clone()))
            .collect();
        hits.sort_by_key(|(at, _)| *at);
        hits.into_iter().map(|(_, ctx)| ctx).collect()
    }
}

/// Per-device current readings plus the optional historical cache.
pub struct ReadingStore {
    readings: RwLock<HashMap<String, Arc<Vec<Reading>>>>,
    cache: Option<ReadingCache>,
    live: broadcast::Sender<ReadContext>,
}

impl ReadingStore {
    pub fn new(cache: CacheSettings) -> Self {
        let (live, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            readings: RwLock::new(HashMap::new()),
            cache: cache.enabled.then_some(ReadingCache {
                settings: cache,
                entries: Mutex::new(HashMap::new()),
            }),
            live,
        }
    }

    /// Atomically replace the device's current readings. Also feeds the
    /// cache ring and live subscribers.
    pub fn put(&self, ctx: &ReadContext) {
        trace!(device = %ctx.device, count = ctx.readings.len(), "updating readings");
        {
            let mut readings = self.readings.write();
            readings.insert(ctx.device.clone(), Arc::new(ctx.readings.clone()));
        }
        if let Some(cache) = &self.cache {
            cache.add(ctx);
        }
        // No live subscribers is the normal case.
        let _ = self.live.send(ctx.clone());
    }

    /// Snapshot of the device's current readings.
    pub fn get(&self, device: &str) -> Option<Vec<Reading>> {
        // Take the Arc under the lock; copy the data outside it so readers
        // hold the writer for no longer than the pointer swap.
        let current = self.readings.read().get(device).cloned();
        current.map(|r| r.as_ref().clone())
    }

    /// Snapshot of all current readings. Per-device atomicity is guaranteed;
    /// the cross-device view is best-effort.
    pub fn snapshot(&self) -> HashMap<String, Vec<Reading>> {
        let current: Vec<(String, Arc<Vec<Reading>>)> = self
            .readings
            .read()
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();
        current
            .into_iter()
            .map(|(id, r)| (id, r.as_ref().clone()))
            .collect()
    }

    /// Subscribe to finalized read contexts as they are stored.
    pub fn subscribe(&self) -> broadcast::Receiver<ReadContext> {
        self.live.subscribe()
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Cached read contexts within `[start, end]` (inclusive bounds; `None`
    /// leaves the side open), oldest first. `None` when the cache is
    /// disabled -- callers degrade to a current-value snapshot.
    pub fn cached_window(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Option<Vec<ReadContext>> {
        self.cache.as_ref().map(|c| c.window(start, end))
    }

    /// Drain the reading channel into the store until the channel closes or
    /// the stop signal trips. This is the single writer for current
    /// readings.
    pub async fn run_updater(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<ReadContext>,
        stop: StopSignal,
    ) {
        debug!("reading store updater running");
        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                ctx = rx.recv() => match ctx {
                    Some(ctx) => self.put(&ctx),
                    None => break,
                },
            }
        }
        debug!("reading store updater stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Value;
    use std::time::Duration;

    fn enabled_cache() -> CacheSettings {
        CacheSettings {
            enabled: true,
            ttl_secs: 60,
            size: 4,
        }
    }

    fn ctx(device: &str, value: i64) -> ReadContext {
        ReadContext::new(device, vec![Reading::new("test", value)])
    }

    #[test]
    fn test_put_then_get_returns_exact_readings() {
        let store = ReadingStore::new(CacheSettings::default());

        let readings = vec![Reading::new("test", 1), Reading::new("test", 2)];
        store.put(&ReadContext::new("dev-1", readings.clone()));

        assert_eq!(store.get("dev-1"), Some(readings));
        assert_eq!(store.get("dev-2"), None);
    }

    #[test]
    fn test_put_replaces_whole_set() {
        let store = ReadingStore::new(CacheSettings::default());
        store.put(&ctx("dev-1", 1));
        store.put(&ctx("dev-1", 2));

        let readings = store.get("dev-1").unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, Value::Int(2));
    }

    #[test]
    fn test_snapshot() {
        let store = ReadingStore::new(CacheSettings::default());
        store.put(&ctx("dev-1", 1));
        store.put(&ctx("dev-2", 2));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["dev-1"][0].value, Value::Int(1));
        assert_eq!(snapshot["dev-2"][0].value, Value::Int(2));
    }

    #[test]
    fn test_cache_disabled() {
        let store = ReadingStore::new(CacheSettings::default());
        store.put(&ctx("dev-1", 1));
        assert!(!store.cache_enabled());
        assert!(store.cached_window(None, None).is_none());
    }

    #[test]
    fn test_cache_window_inclusive_bounds() {
        let store = ReadingStore::new(enabled_cache());
        let before = Utc::now();
        store.put(&ctx("dev-1", 1));
        store.put(&ctx("dev-2", 2));
        let after = Utc::now();

        // Both bounds inclusive: entries stamped exactly at the bound match.
        let hits = store.cached_window(Some(before), Some(after)).unwrap();
        assert_eq!(hits.len(), 2);

        let hits = store.cached_window(Some(after), None).unwrap();
        assert!(hits.len() <= 2);

        let hits = store
            .cached_window(None, Some(before - chrono::Duration::seconds(1)))
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_cache_ring_is_bounded() {
        let store = ReadingStore::new(enabled_cache());
        for i in 0..10 {
            store.put(&ctx("dev-1", i));
        }

        let hits = store.cached_window(None, None).unwrap();
        assert_eq!(hits.len(), 4);
        // Oldest entries were evicted; the newest survive in order.
        assert_eq!(hits[0].readings[0].value, Value::Int(6));
        assert_eq!(hits[3].readings[0].value, Value::Int(9));
    }

    #[tokio::test]
    async fn test_subscribe_sees_puts() {
        let store = ReadingStore::new(CacheSettings::default());
        let mut rx = store.subscribe();

        store.put(&ctx("dev-1", 7));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.device, "dev-1");
    }

    #[tokio::test]
    async fn test_updater_applies_and_stops() {
        let store = Arc::new(ReadingStore::new(CacheSettings::default()));
        let (tx, rx) = mpsc::channel(8);
        let stop = StopSignal::new();

        let handle = tokio::spawn(store.clone().run_updater(rx, stop.clone()));

        tx.send(ctx("dev-1", 42)).await.unwrap();
        // Wait for the updater to apply the context.
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if store.get("dev-1").is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        stop.signal();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
