//! Bounded, time-windowed duplicate suppression for polled events.
//!
//! The cache is not persisted. It covers the gap between dispatching a batch
//! and writing its checkpoint: events re-read after a crash inside that gap
//! are skipped if they are still within the window.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use conduit_core::{models::Event, Clock};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

/// Dedup window and capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupConfig {
    /// How long a key suppresses repeats.
    pub window: Duration,
    /// Maximum tracked keys; the oldest are evicted first.
    pub max_entries: usize,
    /// How often the worker sweeps expired keys.
    pub sweep_interval: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            max_entries: 100_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Fingerprint of an event: SHA-256 over its type, org and canonical payload.
///
/// The event id is not part of the key, so a copy re-emitted under a new id
/// collides with the original.
pub fn event_key(event: &Event) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.event_type.as_bytes());
    hasher.update([0]);
    hasher.update(event.org_id.0.to_be_bytes());
    hasher.update([0]);
    write_canonical(&event.payload, &mut hasher);
    hex::encode(hasher.finalize())
}

/// Feeds `value` with object keys sorted so key order never changes the hash.
fn write_canonical(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update(Value::String(key.clone()).to_string().as_bytes());
                hasher.update(b":");
                if let Some(v) = map.get(key) {
                    write_canonical(v, hasher);
                }
                hasher.update(b",");
            }
            hasher.update(b"}");
        },
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                write_canonical(item, hasher);
                hasher.update(b",");
            }
            hasher.update(b"]");
        },
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}

#[derive(Debug, Default)]
struct Entries {
    seen_at: HashMap<String, i64>,
    order: VecDeque<(String, i64)>,
}

impl Entries {
    /// Drops the oldest live key. Stale order records from re-marks are
    /// skipped.
    fn evict_oldest(&mut self) {
        while let Some((key, at)) = self.order.pop_front() {
            if self.seen_at.get(&key) == Some(&at) {
                self.seen_at.remove(&key);
                return;
            }
        }
    }
}

/// Keys seen within the window.
#[derive(Debug)]
pub struct DedupCache {
    config: DedupConfig,
    entries: Mutex<Entries>,
    clock: Arc<dyn Clock>,
}

impl DedupCache {
    /// Creates an empty cache.
    pub fn new(config: DedupConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, entries: Mutex::new(Entries::default()), clock }
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.config.window.as_millis()).unwrap_or(i64::MAX)
    }

    /// Whether `key` was marked within the window.
    pub async fn seen(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let entries = self.entries.lock().await;
        entries
            .seen_at
            .get(key)
            .is_some_and(|&at| now.saturating_sub(at) < self.window_ms())
    }

    /// Records `key` as seen now, evicting the oldest key when full.
    pub async fn mark(&self, key: String) {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        if !entries.seen_at.contains_key(&key) && entries.seen_at.len() >= self.config.max_entries {
            entries.evict_oldest();
        }
        entries.seen_at.insert(key.clone(), now);
        entries.order.push_back((key, now));
    }

    /// Drops keys older than the window and returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let cutoff = self.clock.now_millis().saturating_sub(self.window_ms());
        let mut entries = self.entries.lock().await;
        let before = entries.seen_at.len();

        while let Some((key, at)) = entries.order.front().cloned() {
            if at > cutoff {
                break;
            }
            entries.order.pop_front();
            if entries.seen_at.get(&key) == Some(&at) {
                entries.seen_at.remove(&key);
            }
        }

        let removed = before - entries.seen_at.len();
        if removed > 0 {
            debug!(removed, remaining = entries.seen_at.len(), "swept dedup cache");
        }
        removed
    }

    /// Number of tracked keys.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.seen_at.len()
    }

    /// Whether no key is tracked.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.seen_at.is_empty()
    }

    /// Sweep cadence for the owning worker.
    pub const fn sweep_interval(&self) -> Duration {
        self.config.sweep_interval
    }
}
