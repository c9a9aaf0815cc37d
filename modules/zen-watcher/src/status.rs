//! Per-source state tracking and Ingester status publication.
//!
//! Adapters and consumers report into the [`StatusTracker`]; a 10-second
//! ticker publishes each tracked ingester's status through the status
//! subresource. Spec is never touched.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use zen_api::{ready_condition, Condition, Ingester, IngesterStatus, SourceState, SourceStatus};
use zen_common::SourceConfig;
use zen_engine::Metrics;

const PUBLISH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
struct SourceEntry {
    adapter_kind: String,
    state: SourceState,
    last_error: Option<String>,
    last_seen: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct TrackedIngester {
    sources: HashMap<String, SourceEntry>,
    last_ready: Option<Condition>,
}

/// Thread-safe collection of per-ingester, per-source runtime state.
#[derive(Default)]
pub struct StatusTracker {
    inner: RwLock<HashMap<(String, String), TrackedIngester>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, cfg: &SourceConfig, state: SourceState, last_error: Option<String>) {
        let mut inner = self.inner.write().expect("status tracker lock poisoned");
        let tracked = inner
            .entry((cfg.namespace.clone(), cfg.ingester_name.clone()))
            .or_default();
        let entry = tracked
            .sources
            .entry(cfg.source_name.clone())
            .or_insert_with(|| SourceEntry {
                adapter_kind: cfg.ingester.clone(),
                state,
                last_error: None,
                last_seen: None,
            });
        entry.adapter_kind = cfg.ingester.clone();
        entry.state = state;
        entry.last_error = last_error;
    }

    pub fn set_running(&self, cfg: &SourceConfig) {
        self.set(cfg, SourceState::Running, None);
    }

    pub fn set_stopped(&self, cfg: &SourceConfig) {
        self.set(cfg, SourceState::Stopped, None);
    }

    pub fn set_error(&self, cfg: &SourceConfig, error: impl Into<String>) {
        self.set(cfg, SourceState::Error, Some(error.into()));
    }

    /// Update `last_seen` after a successful pipeline completion.
    pub fn touch(&self, cfg: &SourceConfig) {
        let mut inner = self.inner.write().expect("status tracker lock poisoned");
        if let Some(tracked) = inner.get_mut(&(cfg.namespace.clone(), cfg.ingester_name.clone())) {
            if let Some(entry) = tracked.sources.get_mut(&cfg.source_name) {
                entry.last_seen = Some(Utc::now());
            }
        }
    }

    /// Drop a source that is no longer declared; drops the ingester once its
    /// last source goes.
    pub fn remove_source(&self, cfg: &SourceConfig) {
        let mut inner = self.inner.write().expect("status tracker lock poisoned");
        let key = (cfg.namespace.clone(), cfg.ingester_name.clone());
        if let Some(tracked) = inner.get_mut(&key) {
            tracked.sources.remove(&cfg.source_name);
            if tracked.sources.is_empty() {
                inner.remove(&key);
            }
        }
    }

    pub fn ingester_count(&self) -> usize {
        self.inner.read().expect("status tracker lock poisoned").len()
    }

    pub fn running_source_count(&self) -> usize {
        self.inner
            .read()
            .expect("status tracker lock poisoned")
            .values()
            .flat_map(|t| t.sources.values())
            .filter(|e| e.state == SourceState::Running)
            .count()
    }

    /// Build the publishable status for every tracked ingester, computing
    /// Ready and remembering it for transition-time preservation.
    pub fn snapshot(&self) -> Vec<((String, String), IngesterStatus)> {
        let mut inner = self.inner.write().expect("status tracker lock poisoned");
        let now = Utc::now();
        inner
            .iter_mut()
            .map(|((ns, name), tracked)| {
                let mut sources: Vec<SourceStatus> = tracked
                    .sources
                    .iter()
                    .map(|(source_name, entry)| SourceStatus {
                        name: source_name.clone(),
                        r#type: entry.adapter_kind.clone(),
                        state: entry.state,
                        last_error: entry.last_error.clone(),
                        last_seen: entry.last_seen.map(|t| t.to_rfc3339()),
                    })
                    .collect();
                sources.sort_by(|a, b| a.name.cmp(&b.name));

                let ready = ready_condition(&sources, tracked.last_ready.as_ref(), now);
                tracked.last_ready = Some(ready.clone());

                (
                    (ns.clone(), name.clone()),
                    IngesterStatus {
                        sources,
                        conditions: vec![ready],
                    },
                )
            })
            .collect()
    }
}

/// Publish tracked statuses every 10 seconds until shutdown.
pub async fn run_status_updater(
    client: Client,
    tracker: std::sync::Arc<StatusTracker>,
    metrics: Metrics,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(PUBLISH_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tick.tick() => publish(&client, &tracker, &metrics).await,
            _ = shutdown.changed() => break,
        }
    }
    debug!("Status updater stopped");
}

async fn publish(client: &Client, tracker: &StatusTracker, metrics: &Metrics) {
    metrics.ingesters_active.set(tracker.ingester_count() as i64);
    metrics.sources_active.set(tracker.running_source_count() as i64);

    for ((namespace, name), status) in tracker.snapshot() {
        let api: Api<Ingester> = Api::namespaced(client.clone(), &namespace);
        let patch = json!({ "status": status });
        if let Err(e) = api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            warn!(namespace, name, error = %e, "Failed to publish ingester status");
        }
    }
}
