//! The canonical processing pipeline, strictly ordered:
//! threshold → order decision → filter/dedup → normalize → hooks → write.
//!
//! The order decision happens before any processing so filter/dedup
//! reorderability is explicit and testable. Normalization is deferred until
//! after filter/dedup: the minimal structure is enough for the severity
//! floor and for fingerprinting, so dropped events cost almost nothing.
//!
//! The pipeline is stateless beyond the engines it calls; all per-event
//! state lives in the RawEvent and the intermediate observation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use zen_common::{ProcessingConfig, ProcessingOrder, RawEvent, SourceConfig, ZenError};

use crate::dedup::{DedupDecision, DedupEngine};
use crate::filter::{Filter, FilterDecision, MinimalObservation};
use crate::hooks::{HookRegistry, PendingObservation};
use crate::metrics::Metrics;
use crate::normalize;
use crate::threshold::{ThresholdDecision, ThresholdMonitor};

/// Where decided observations go. The writer in the binary crate is the
/// production implementation; tests use an in-memory sink.
#[async_trait]
pub trait ObservationSink: Send + Sync {
    async fn write(&self, pending: PendingObservation) -> Result<WriteOutcome, ZenError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    /// Idempotent replay; treated as success.
    AlreadyExists,
    /// Refused by the allowlist. Counted by the writer, not retried.
    Denied { reason: &'static str },
}

/// Recommends a filter/dedup order for sources in `auto` mode with
/// auto-optimization enabled. The concrete policy is pluggable.
pub trait OrderAdvisor: Send + Sync {
    fn recommend(&self, source: &str) -> ProcessingOrder;
    fn record_filtered(&self, _source: &str) {}
    fn record_deduped(&self, _source: &str) {}
}

/// Default advisor: prefer dedup first once a source's duplicate volume
/// overtakes its filter-drop volume, so the cheaper stage runs first.
#[derive(Default)]
pub struct SuppressionRatioAdvisor {
    counts: RwLock<HashMap<String, (u64, u64)>>,
}

impl SuppressionRatioAdvisor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrderAdvisor for SuppressionRatioAdvisor {
    fn recommend(&self, source: &str) -> ProcessingOrder {
        let counts = self.counts.read().expect("advisor counts lock poisoned");
        match counts.get(source) {
            Some((filtered, deduped)) if deduped > filtered => ProcessingOrder::DedupFirst,
            _ => ProcessingOrder::FilterFirst,
        }
    }

    fn record_filtered(&self, source: &str) {
        let mut counts = self.counts.write().expect("advisor counts lock poisoned");
        counts.entry(source.to_string()).or_insert((0, 0)).0 += 1;
    }

    fn record_deduped(&self, source: &str) {
        let mut counts = self.counts.write().expect("advisor counts lock poisoned");
        counts.entry(source.to_string()).or_insert((0, 0)).1 += 1;
    }
}

/// Resolve the effective stage order for a source.
pub fn decide_order(
    processing: &ProcessingConfig,
    source: &str,
    advisor: Option<&dyn OrderAdvisor>,
) -> ProcessingOrder {
    match processing.order {
        ProcessingOrder::FilterFirst => ProcessingOrder::FilterFirst,
        ProcessingOrder::DedupFirst => ProcessingOrder::DedupFirst,
        ProcessingOrder::Auto => match (processing.auto_optimize, advisor) {
            (true, Some(advisor)) => match advisor.recommend(source) {
                ProcessingOrder::DedupFirst => ProcessingOrder::DedupFirst,
                _ => ProcessingOrder::FilterFirst,
            },
            _ => ProcessingOrder::FilterFirst,
        },
    }
}

/// How one event left the pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    Written,
    AlreadyExists,
    RateLimited,
    Filtered { reason: String },
    Deduplicated { count: u64 },
    HookAborted { hook: String },
    Denied { reason: &'static str },
}

impl PipelineOutcome {
    /// True when the event made it through to a persisted observation.
    pub fn is_written(&self) -> bool {
        matches!(self, PipelineOutcome::Written | PipelineOutcome::AlreadyExists)
    }
}

pub struct Pipeline {
    filter: Arc<Filter>,
    dedup: Arc<DedupEngine>,
    threshold: Arc<ThresholdMonitor>,
    hooks: Arc<HookRegistry>,
    sink: Arc<dyn ObservationSink>,
    advisor: Option<Arc<dyn OrderAdvisor>>,
    metrics: Metrics,
}

impl Pipeline {
    pub fn new(
        filter: Arc<Filter>,
        dedup: Arc<DedupEngine>,
        threshold: Arc<ThresholdMonitor>,
        hooks: Arc<HookRegistry>,
        sink: Arc<dyn ObservationSink>,
        metrics: Metrics,
    ) -> Self {
        Self {
            filter,
            dedup,
            threshold,
            hooks,
            sink,
            advisor: None,
            metrics,
        }
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn OrderAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub async fn process(
        &self,
        cfg: &SourceConfig,
        event: RawEvent,
    ) -> Result<PipelineOutcome, ZenError> {
        let timer = self
            .metrics
            .processing_seconds
            .with_label_values(&[&cfg.source, "pipeline"])
            .start_timer();
        let outcome = self.process_inner(cfg, event).await;
        timer.observe_duration();
        outcome
    }

    async fn process_inner(
        &self,
        cfg: &SourceConfig,
        event: RawEvent,
    ) -> Result<PipelineOutcome, ZenError> {
        let ncfg = cfg.normalization.as_ref();
        let severity = normalize::derive_severity(&event.raw_data, ncfg);
        let category = normalize::derive_category(ncfg);
        let event_type = ncfg
            .and_then(|c| c.r#type.as_deref())
            .unwrap_or("custom-event");

        self.metrics
            .events_total
            .with_label_values(&[&cfg.source, category.as_str(), severity.as_str(), event_type])
            .inc();

        // 1. Threshold: a rate-limited event is dropped silently.
        if self.threshold.check(&event.source, cfg.rate_limit()) == ThresholdDecision::RateLimited
        {
            self.metrics
                .rate_limited_total
                .with_label_values(&[&cfg.source])
                .inc();
            return Ok(PipelineOutcome::RateLimited);
        }
        self.threshold.record_severity(&event.source, severity);

        // 2. Order decision, before any processing happens.
        let order = decide_order(&cfg.processing, &cfg.source, self.advisor.as_deref());

        // 3. Filter + dedup over the minimal structure.
        let minimal = MinimalObservation {
            source: &cfg.source,
            category,
            severity,
            details: &event.raw_data,
        };

        let stages: [Stage; 2] = match order {
            ProcessingOrder::DedupFirst => [Stage::Dedup, Stage::Filter],
            _ => [Stage::Filter, Stage::Dedup],
        };

        for stage in stages {
            match stage {
                Stage::Filter => {
                    if let FilterDecision::Drop { reason } = self.filter.decide(&cfg.filter, &minimal)
                    {
                        self.metrics
                            .filtered_total
                            .with_label_values(&[&cfg.source, &reason])
                            .inc();
                        if let Some(advisor) = &self.advisor {
                            advisor.record_filtered(&cfg.source);
                        }
                        debug!(source = cfg.source.as_str(), reason, "Event filtered");
                        return Ok(PipelineOutcome::Filtered { reason });
                    }
                }
                Stage::Dedup => {
                    if let DedupDecision::Suppress { count } = self.dedup.check(&cfg.dedup, &event)
                    {
                        self.metrics
                            .deduped_total
                            .with_label_values(&[&cfg.source, cfg.dedup.strategy.as_str()])
                            .inc();
                        if let Some(advisor) = &self.advisor {
                            advisor.record_deduped(&cfg.source);
                        }
                        debug!(source = cfg.source.as_str(), count, "Event deduplicated");
                        return Ok(PipelineOutcome::Deduplicated { count });
                    }
                }
            }
        }

        // 4. Normalize into the full observation.
        let spec = normalize::normalize(&event, cfg);

        // 5. Hooks, post-normalization and pre-write.
        let mut pending = PendingObservation {
            namespace: cfg.namespace.clone(),
            spec,
            labels: BTreeMap::from([(
                "zen.io/source".to_string(),
                sanitize_label_value(&cfg.source_name),
            )]),
            annotations: BTreeMap::new(),
            destinations: cfg.destinations.clone(),
        };
        if let Err(err) = self.hooks.run(&mut pending) {
            let hook = match &err {
                ZenError::Hook { hook, .. } => hook.clone(),
                _ => "unknown".to_string(),
            };
            self.metrics
                .errors_total
                .with_label_values(&[&cfg.source, "hook"])
                .inc();
            debug!(source = cfg.source.as_str(), error = %err, "Hook aborted event");
            return Ok(PipelineOutcome::HookAborted { hook });
        }

        // 6. Write.
        match self.sink.write(pending).await {
            Ok(WriteOutcome::Created) => {
                self.metrics
                    .observations_created_total
                    .with_label_values(&[&cfg.source])
                    .inc();
                Ok(PipelineOutcome::Written)
            }
            Ok(WriteOutcome::AlreadyExists) => Ok(PipelineOutcome::AlreadyExists),
            Ok(WriteOutcome::Denied { reason }) => Ok(PipelineOutcome::Denied { reason }),
            Err(err) => {
                self.metrics
                    .errors_total
                    .with_label_values(&[&cfg.source, err.category()])
                    .inc();
                Err(err)
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Stage {
    Filter,
    Dedup,
}

/// Kubernetes label values are constrained; keep the useful part.
fn sanitize_label_value(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    cleaned.chars().take(63).collect()
}
