//! Prometheus instruments for the whole process, constructed against a
//! caller-supplied registry so tests get isolated instances.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
};

#[derive(Clone)]
pub struct Metrics {
    /// Every event entering the pipeline.
    pub events_total: IntCounterVec,
    pub observations_created_total: IntCounterVec,
    pub observations_create_errors_total: IntCounterVec,
    pub filtered_total: IntCounterVec,
    pub deduped_total: IntCounterVec,
    pub rate_limited_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub adapter_events_total: IntCounterVec,
    pub adapter_errors_total: IntCounterVec,
    pub processing_seconds: HistogramVec,
    pub webhook_requests_total: IntCounterVec,
    pub webhook_events_dropped_total: IntCounterVec,
    pub gc_runs_total: IntCounterVec,
    pub gc_deleted_total: IntCounterVec,
    pub gc_errors_total: IntCounterVec,
    pub gc_run_seconds: HistogramVec,
    pub ingesters_active: IntGauge,
    pub sources_active: IntGauge,
}

impl Metrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let events_total = IntCounterVec::new(
            Opts::new("zen_events_total", "Raw events entering the pipeline"),
            &["source", "category", "severity", "event_type"],
        )?;
        let observations_created_total = IntCounterVec::new(
            Opts::new("zen_observations_created_total", "Observations persisted"),
            &["source"],
        )?;
        let observations_create_errors_total = IntCounterVec::new(
            Opts::new(
                "zen_observations_create_errors_total",
                "Observation writes that failed or were denied",
            ),
            &["source", "reason"],
        )?;
        let filtered_total = IntCounterVec::new(
            Opts::new("zen_filtered_total", "Events dropped by the filter"),
            &["source", "reason"],
        )?;
        let deduped_total = IntCounterVec::new(
            Opts::new("zen_deduped_total", "Events suppressed as duplicates"),
            &["source", "strategy"],
        )?;
        let rate_limited_total = IntCounterVec::new(
            Opts::new("zen_rate_limited_total", "Events dropped by the threshold monitor"),
            &["source"],
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("zen_errors_total", "Per-event processing errors"),
            &["source", "kind"],
        )?;
        let adapter_events_total = IntCounterVec::new(
            Opts::new("zen_adapter_events_total", "Raw events produced by adapters"),
            &["source", "kind"],
        )?;
        let adapter_errors_total = IntCounterVec::new(
            Opts::new("zen_adapter_errors_total", "Adapter validation/start/runtime errors"),
            &["source", "kind"],
        )?;
        let processing_seconds = HistogramVec::new(
            HistogramOpts::new("zen_processing_seconds", "Per-event processing latency"),
            &["source", "processor"],
        )?;
        let webhook_requests_total = IntCounterVec::new(
            Opts::new("zen_webhook_requests_total", "Webhook requests by endpoint and status"),
            &["path", "status"],
        )?;
        let webhook_events_dropped_total = IntCounterVec::new(
            Opts::new(
                "zen_webhook_events_dropped_total",
                "Webhook events dropped due to a full channel",
            ),
            &["source"],
        )?;
        let gc_runs_total = IntCounterVec::new(
            Opts::new("zen_gc_runs_total", "Garbage collection runs by result"),
            &["result"],
        )?;
        let gc_deleted_total = IntCounterVec::new(
            Opts::new("zen_gc_deleted_total", "Observations deleted by TTL reason"),
            &["reason"],
        )?;
        let gc_errors_total = IntCounterVec::new(
            Opts::new("zen_gc_errors_total", "Garbage collection errors"),
            &["reason"],
        )?;
        let gc_run_seconds = HistogramVec::new(
            HistogramOpts::new("zen_gc_run_seconds", "Garbage collection run duration"),
            &["scope"],
        )?;
        let ingesters_active = IntGauge::new("zen_ingesters_active", "Tracked ingesters")?;
        let sources_active = IntGauge::new("zen_sources_active", "Running sources")?;

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(events_total.clone()),
            Box::new(observations_created_total.clone()),
            Box::new(observations_create_errors_total.clone()),
            Box::new(filtered_total.clone()),
            Box::new(deduped_total.clone()),
            Box::new(rate_limited_total.clone()),
            Box::new(errors_total.clone()),
            Box::new(adapter_events_total.clone()),
            Box::new(adapter_errors_total.clone()),
            Box::new(processing_seconds.clone()),
            Box::new(webhook_requests_total.clone()),
            Box::new(webhook_events_dropped_total.clone()),
            Box::new(gc_runs_total.clone()),
            Box::new(gc_deleted_total.clone()),
            Box::new(gc_errors_total.clone()),
            Box::new(gc_run_seconds.clone()),
            Box::new(ingesters_active.clone()),
            Box::new(sources_active.clone()),
        ];
        for collector in collectors {
            registry.register(collector)?;
        }

        Ok(Self {
            events_total,
            observations_created_total,
            observations_create_errors_total,
            filtered_total,
            deduped_total,
            rate_limited_total,
            errors_total,
            adapter_events_total,
            adapter_errors_total,
            processing_seconds,
            webhook_requests_total,
            webhook_events_dropped_total,
            gc_runs_total,
            gc_deleted_total,
            gc_errors_total,
            gc_run_seconds,
            ingesters_active,
            sources_active,
        })
    }

    /// Fresh instruments on a throwaway registry, for tests.
    pub fn for_tests() -> Self {
        Self::new(&Registry::new()).expect("test registry registration")
    }
}
