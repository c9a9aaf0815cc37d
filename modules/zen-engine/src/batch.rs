//! Micro-batching in front of the pipeline. Groups events per source into
//! batches bounded by count and age; a background ticker flushes aged
//! batches. Batching changes scheduling only — every event still goes
//! through the pipeline one at a time, and one event's failure never stops
//! the rest of its batch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::warn;

use zen_common::{RawEvent, SourceConfig};

use crate::pipeline::{Pipeline, PipelineOutcome};

/// Called with the outcome of every processed event. The binary wires this
/// to the status tracker's `last_seen`.
pub type OutcomeObserver = Arc<dyn Fn(&SourceConfig, &PipelineOutcome) + Send + Sync>;

#[derive(Clone, Copy, Debug)]
pub struct BatchOptions {
    pub max_size: usize,
    pub max_age: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_size: 50,
            max_age: Duration::from_secs(1),
        }
    }
}

struct Bucket {
    cfg: Arc<SourceConfig>,
    events: Vec<RawEvent>,
    opened_at: Instant,
}

pub struct BatchProcessor {
    pipeline: Arc<Pipeline>,
    buckets: Mutex<HashMap<String, Bucket>>,
    opts: BatchOptions,
    observer: Option<OutcomeObserver>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl BatchProcessor {
    pub fn new(pipeline: Arc<Pipeline>, opts: BatchOptions) -> Self {
        Self {
            pipeline,
            buckets: Mutex::new(HashMap::new()),
            opts,
            observer: None,
            flusher: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: OutcomeObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Enqueue one event. Flushes the source's batch inline when the size
    /// bound is reached.
    pub async fn submit(&self, cfg: Arc<SourceConfig>, event: RawEvent) {
        let ready = {
            let mut buckets = self.buckets.lock().expect("batch buckets lock poisoned");
            let bucket = buckets.entry(cfg.source.clone()).or_insert_with(|| Bucket {
                cfg: Arc::clone(&cfg),
                events: Vec::with_capacity(self.opts.max_size),
                opened_at: Instant::now(),
            });
            bucket.events.push(event);
            if bucket.events.len() >= self.opts.max_size {
                buckets.remove(&cfg.source)
            } else {
                None
            }
        };

        if let Some(bucket) = ready {
            self.flush_bucket(bucket).await;
        }
    }

    /// Flush every batch whose age bound has elapsed.
    pub async fn flush_aged(&self) {
        let aged: Vec<Bucket> = {
            let mut buckets = self.buckets.lock().expect("batch buckets lock poisoned");
            let expired: Vec<String> = buckets
                .iter()
                .filter(|(_, b)| b.opened_at.elapsed() >= self.opts.max_age)
                .map(|(k, _)| k.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|k| buckets.remove(&k))
                .collect()
        };
        for bucket in aged {
            self.flush_bucket(bucket).await;
        }
    }

    /// Drain everything, ready or not. Called on shutdown.
    pub async fn flush_all(&self) {
        let all: Vec<Bucket> = {
            let mut buckets = self.buckets.lock().expect("batch buckets lock poisoned");
            buckets.drain().map(|(_, b)| b).collect()
        };
        for bucket in all {
            self.flush_bucket(bucket).await;
        }
    }

    async fn flush_bucket(&self, bucket: Bucket) {
        for event in bucket.events {
            match self.pipeline.process(&bucket.cfg, event).await {
                Ok(outcome) => {
                    if let Some(observer) = &self.observer {
                        observer(&bucket.cfg, &outcome);
                    }
                }
                // The event is the unit of failure; the rest of the batch
                // still runs.
                Err(err) => {
                    warn!(
                        source = bucket.cfg.source.as_str(),
                        error = %err,
                        "Pipeline error, continuing batch"
                    );
                }
            }
        }
    }

    /// Start the background ticker that flushes aged batches.
    pub fn start_flusher(self: Arc<Self>) {
        let processor = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(100));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                processor.flush_aged().await;
            }
        });
        if let Some(old) = self
            .flusher
            .lock()
            .expect("flusher lock poisoned")
            .replace(handle)
        {
            old.abort();
        }
    }

    /// Stop the ticker. Callers should `flush_all` first.
    pub fn stop(&self) {
        if let Some(handle) = self.flusher.lock().expect("flusher lock poisoned").take() {
            handle.abort();
        }
    }

    pub fn pending(&self) -> usize {
        self.buckets
            .lock()
            .expect("batch buckets lock poisoned")
            .values()
            .map(|b| b.events.len())
            .sum()
    }
}

impl Drop for BatchProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}
