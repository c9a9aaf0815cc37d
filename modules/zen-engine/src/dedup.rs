//! Windowed deduplication engine.
//!
//! Suppresses retransmissions of the same logical event within a rolling
//! window: the first occurrence is admitted, later matches only increment a
//! counter. Three strategies select how the dedup key is derived:
//!
//! - `fingerprint` — canonical JSON fingerprint of the raw payload (default)
//! - `event-stream` — rate-limited bucket: up to `maxEventsPerWindow` admits
//!   per key per window
//! - `key` — projection over the configured `fields[]`
//!
//! The engine is content-aware: a live entry whose stored content hash
//! differs from the new payload re-admits the event, so a mutated payload
//! cannot hide behind a familiar key.
//!
//! All window math uses the monotonic clock; wall-clock time is carried only
//! for reporting. The engine never fails an event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::debug;

use zen_common::{lookup_path, DedupConfig, DedupStrategy, RawEvent};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub source: String,
    pub message_hash: String,
}

#[derive(Clone, Debug)]
struct DedupEntry {
    first_seen: Instant,
    last_seen: Instant,
    /// Window anchor for the event-stream strategy.
    window_start: Instant,
    window_count: u32,
    count: u64,
    content_hash: String,
    window: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DedupDecision {
    Admit,
    /// Total occurrences of this key, including the suppressed one.
    Suppress { count: u64 },
}

pub struct DedupEngine {
    cache: RwLock<HashMap<DedupKey, DedupEntry>>,
    max_entries: usize,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl DedupEngine {
    pub fn new(max_entries: usize) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
            sweeper: Mutex::new(None),
        }
    }

    /// Decide whether this event is a duplicate under the source's config.
    pub fn check(&self, cfg: &DedupConfig, event: &RawEvent) -> DedupDecision {
        self.check_at(cfg, event, Instant::now())
    }

    pub fn check_at(&self, cfg: &DedupConfig, event: &RawEvent, now: Instant) -> DedupDecision {
        if !cfg.enabled {
            return DedupDecision::Admit;
        }

        let message_hash = match cfg.strategy {
            DedupStrategy::Fingerprint => canonical_fingerprint(&event.raw_data),
            DedupStrategy::Key => projection_fingerprint(&event.raw_data, &cfg.fields),
            // The stream bucket is the source itself unless fields narrow it.
            DedupStrategy::EventStream => {
                if cfg.fields.is_empty() {
                    "stream".to_string()
                } else {
                    projection_fingerprint(&event.raw_data, &cfg.fields)
                }
            }
        };
        let key = DedupKey {
            source: event.source.clone(),
            message_hash,
        };
        let window = Duration::from_secs(cfg.window_seconds.max(1));
        let content = content_hash(&event.raw_data);

        let mut cache = self.cache.write().expect("dedup cache lock poisoned");

        if let Some(entry) = cache.get_mut(&key) {
            // An entry stays live until last_seen + window < now, inclusive
            // at the boundary.
            let live = match cfg.strategy {
                DedupStrategy::EventStream => now.duration_since(entry.window_start) <= window,
                _ => now.duration_since(entry.last_seen) <= window,
            };

            if live {
                entry.count += 1;
                entry.last_seen = now;

                match cfg.strategy {
                    DedupStrategy::EventStream => {
                        if entry.window_count < cfg.max_events_per_window.max(1) {
                            entry.window_count += 1;
                            return DedupDecision::Admit;
                        }
                        return DedupDecision::Suppress { count: entry.count };
                    }
                    _ => {
                        if entry.content_hash != content {
                            debug!(
                                source = event.source.as_str(),
                                entry_age_secs = now.duration_since(entry.first_seen).as_secs(),
                                "Content hash changed within dedup window, re-admitting"
                            );
                            entry.content_hash = content;
                            return DedupDecision::Admit;
                        }
                        return DedupDecision::Suppress { count: entry.count };
                    }
                }
            }

            // Expired in place: reset rather than reinsert.
            entry.first_seen = now;
            entry.last_seen = now;
            entry.window_start = now;
            entry.window_count = 1;
            entry.count += 1;
            entry.content_hash = content;
            entry.window = window;
            return DedupDecision::Admit;
        }

        if cache.len() >= self.max_entries {
            evict_oldest(&mut cache);
        }
        cache.insert(
            key,
            DedupEntry {
                first_seen: now,
                last_seen: now,
                window_start: now,
                window_count: 1,
                count: 1,
                content_hash: content,
                window,
            },
        );
        DedupDecision::Admit
    }

    pub fn len(&self) -> usize {
        self.cache.read().expect("dedup cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry whose window has elapsed. Returns how many were
    /// removed.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let mut cache = self.cache.write().expect("dedup cache lock poisoned");
        let before = cache.len();
        // Removal condition is last_seen + window < now, strictly.
        cache.retain(|_, e| now.duration_since(e.last_seen) <= e.window);
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, remaining = cache.len(), "Dedup cache sweep");
        }
        removed
    }

    /// Start the periodic expiration sweep. Idempotent: a second call
    /// replaces the previous sweeper.
    pub fn start_sweeper(self: Arc<Self>, every: Duration) {
        let engine = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                engine.sweep_expired();
            }
        });
        if let Some(old) = self
            .sweeper
            .lock()
            .expect("sweeper lock poisoned")
            .replace(handle)
        {
            old.abort();
        }
    }

    /// Cancel the sweep and release references.
    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().expect("sweeper lock poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for DedupEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn evict_oldest(cache: &mut HashMap<DedupKey, DedupEntry>) {
    if let Some(key) = cache
        .iter()
        .min_by_key(|(_, e)| e.last_seen)
        .map(|(k, _)| k.clone())
    {
        cache.remove(&key);
    }
}

// ---------------------------------------------------------------------------
// Fingerprints
// ---------------------------------------------------------------------------

/// Raw-data keys excluded from content hashing: they change on every
/// retransmission without changing what the event means.
const VOLATILE_KEYS: &[&str] = &["timestamp", "time", "eventTime"];

/// Canonical, order-independent fingerprint of a payload.
pub fn canonical_fingerprint(map: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut canon = String::new();
    canonical_object(map, &mut canon, &[]);
    hex_sha256(&canon)
}

/// Fingerprint over an explicit field projection. Missing fields hash as
/// null so that two events differing only in present-ness differ.
pub fn projection_fingerprint(
    map: &serde_json::Map<String, serde_json::Value>,
    fields: &[String],
) -> String {
    let mut canon = String::new();
    for field in fields {
        canon.push_str(field);
        canon.push('=');
        match lookup_path(map, field) {
            Some(v) => canonical_value(v, &mut canon),
            None => canon.push_str("null"),
        }
        canon.push(';');
    }
    hex_sha256(&canon)
}

/// Hash over the semantically significant payload: the canonical form minus
/// volatile top-level keys.
pub fn content_hash(map: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut canon = String::new();
    canonical_object(map, &mut canon, VOLATILE_KEYS);
    hex_sha256(&canon)
}

fn canonical_object(
    map: &serde_json::Map<String, serde_json::Value>,
    out: &mut String,
    skip: &[&str],
) {
    let mut keys: Vec<&String> = map.keys().filter(|k| !skip.contains(&k.as_str())).collect();
    keys.sort();
    out.push('{');
    for key in keys {
        out.push_str(&serde_json::to_string(key).expect("string serializes"));
        out.push(':');
        canonical_value(&map[key.as_str()], out);
        out.push(',');
    }
    out.push('}');
}

fn canonical_value(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => canonical_object(map, out, &[]),
        serde_json::Value::Array(items) => {
            out.push('[');
            for item in items {
                canonical_value(item, out);
                out.push(',');
            }
            out.push(']');
        }
        leaf => out.push_str(&serde_json::to_string(leaf).expect("leaf serializes")),
    }
}

fn hex_sha256(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}
