//! Garbage collector: periodic, chunked, deadline-bounded deletion of
//! Observations whose TTL has elapsed. Never deletes an unexpired
//! observation; a run that overruns its timeout exits early and says so.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{Api, DeleteParams, ListParams};
use kube::{Client, ResourceExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use zen_api::Observation;
use zen_engine::Metrics;

const CHUNK_SIZE: u32 = 500;

/// Why an observation is eligible for deletion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtlReason {
    Spec,
    Default,
}

impl TtlReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TtlReason::Spec => "ttl_spec",
            TtlReason::Default => "ttl_default",
        }
    }
}

/// Decide whether an observation created at `created` has expired at `now`.
/// A positive `ttlSecondsAfterCreation` wins; anything else falls back to
/// the process default in days.
pub fn ttl_decision(
    ttl_spec: Option<i64>,
    created: DateTime<Utc>,
    now: DateTime<Utc>,
    default_ttl_days: u32,
) -> Option<TtlReason> {
    match ttl_spec {
        Some(seconds) if seconds > 0 => {
            if created + chrono::Duration::seconds(seconds) <= now {
                Some(TtlReason::Spec)
            } else {
                None
            }
        }
        _ => {
            let ttl = chrono::Duration::days(i64::from(default_ttl_days));
            if created + ttl <= now {
                Some(TtlReason::Default)
            } else {
                None
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct GcConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub default_ttl_days: u32,
    /// Restrict the sweep to one namespace; None sweeps all namespaces.
    pub watch_namespace: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub scanned: u64,
    pub deleted: u64,
    pub errors: u64,
    pub timed_out: bool,
}

pub struct GarbageCollector {
    client: Client,
    cfg: GcConfig,
    metrics: Metrics,
}

impl GarbageCollector {
    pub fn new(client: Client, cfg: GcConfig, metrics: Metrics) -> Self {
        Self {
            client,
            cfg,
            metrics,
        }
    }

    /// Run sweeps on the configured interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.cfg.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup is quiet.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.run_once().await {
                        Ok(stats) => {
                            info!(
                                scanned = stats.scanned,
                                deleted = stats.deleted,
                                errors = stats.errors,
                                timed_out = stats.timed_out,
                                "GC sweep finished"
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "GC sweep failed");
                            self.metrics.gc_runs_total.with_label_values(&["error"]).inc();
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Garbage collector stopped");
    }

    /// One bounded sweep over the configured scope.
    pub async fn run_once(&self) -> anyhow::Result<GcStats> {
        let scope = self.cfg.watch_namespace.as_deref().unwrap_or("cluster");
        let timer = self
            .metrics
            .gc_run_seconds
            .with_label_values(&[scope])
            .start_timer();
        let deadline = tokio::time::Instant::now() + self.cfg.timeout;
        let now = Utc::now();

        let api: Api<Observation> = match &self.cfg.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        let mut stats = GcStats::default();
        let mut params = ListParams::default().limit(CHUNK_SIZE);

        'sweep: loop {
            if tokio::time::Instant::now() >= deadline {
                self.record_timeout(&mut stats);
                break;
            }

            let list = tokio::time::timeout_at(deadline, api.list(&params)).await;
            let list = match list {
                Ok(Ok(list)) => list,
                Ok(Err(e)) => {
                    timer.observe_duration();
                    self.metrics.gc_runs_total.with_label_values(&["error"]).inc();
                    return Err(e.into());
                }
                Err(_) => {
                    self.record_timeout(&mut stats);
                    break;
                }
            };

            for obs in &list.items {
                if tokio::time::Instant::now() >= deadline {
                    self.record_timeout(&mut stats);
                    break 'sweep;
                }
                stats.scanned += 1;

                let Some(created) = obs.metadata.creation_timestamp.as_ref() else {
                    continue;
                };
                let Some(reason) = ttl_decision(
                    obs.spec.ttl_seconds_after_creation,
                    created.0,
                    now,
                    self.cfg.default_ttl_days,
                ) else {
                    continue;
                };

                self.delete_one(obs, reason, &mut stats).await;
            }

            match list.metadata.continue_ {
                Some(token) if !token.is_empty() => {
                    params.continue_token = Some(token);
                }
                _ => break,
            }
        }

        timer.observe_duration();
        if !stats.timed_out {
            self.metrics.gc_runs_total.with_label_values(&["ok"]).inc();
        }
        Ok(stats)
    }

    fn record_timeout(&self, stats: &mut GcStats) {
        stats.timed_out = true;
        self.metrics.gc_errors_total.with_label_values(&["timeout"]).inc();
        self.metrics.gc_runs_total.with_label_values(&["timeout"]).inc();
        warn!("GC sweep hit its timeout, exiting early");
    }

    async fn delete_one(&self, obs: &Observation, reason: TtlReason, stats: &mut GcStats) {
        let name = obs.name_any();
        let namespace = obs.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Observation> = Api::namespaced(self.client.clone(), &namespace);

        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                stats.deleted += 1;
                self.metrics
                    .gc_deleted_total
                    .with_label_values(&[reason.as_str()])
                    .inc();
                debug!(namespace, name, reason = reason.as_str(), "Deleted expired observation");
            }
            Err(e) => {
                stats.errors += 1;
                let label = match &e {
                    kube::Error::Api(ae) if ae.code == 404 => "not_found",
                    kube::Error::Api(ae) if ae.code == 403 => "forbidden",
                    _ => "delete_failed",
                };
                self.metrics.gc_errors_total.with_label_values(&[label]).inc();
                warn!(namespace, name, error = %e, "Failed to delete expired observation");
            }
        }
    }
}
