//! The orchestrator reconciles declared ingester configurations into running
//! adapters: a 30-second tick plus store-change notifications drive a
//! desired-state diff. Each running source gets a consumer task that feeds
//! the batch processor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use zen_common::{RawEvent, SourceConfig};
use zen_engine::batch::BatchProcessor;
use zen_engine::Metrics;

use crate::adapters::{AdapterFactory, AdapterManager};
use crate::status::StatusTracker;
use crate::store::IngesterStore;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
/// How long a stopping source's consumer gets to drain before abort.
const STOP_GRACE: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    store: Arc<IngesterStore>,
    manager: Arc<AdapterManager>,
    factory: AdapterFactory,
    batcher: Arc<BatchProcessor>,
    status: Arc<StatusTracker>,
    metrics: Metrics,
}

impl Orchestrator {
    pub fn new(
        store: Arc<IngesterStore>,
        manager: Arc<AdapterManager>,
        factory: AdapterFactory,
        batcher: Arc<BatchProcessor>,
        status: Arc<StatusTracker>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            manager,
            factory,
            batcher,
            status,
            metrics,
        }
    }

    /// Reconcile until shutdown, then stop every adapter.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.store.subscribe();
        let mut tick = tokio::time::interval(RECONCILE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => self.reconcile().await,
                changed = changes.changed() => {
                    if changed.is_ok() {
                        self.reconcile().await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.shutdown_all().await;
    }

    /// One desired-state diff: stop removed sources, restart changed ones,
    /// start new ones.
    pub async fn reconcile(&self) {
        let desired: HashMap<String, Arc<SourceConfig>> = self
            .store
            .snapshot()
            .into_iter()
            .map(|ic| (ic.key, Arc::new(ic.config)))
            .collect();

        for source in self.manager.sources().await {
            match desired.get(&source) {
                None => {
                    debug!(source, "Source no longer declared, stopping");
                    if let Some(cfg) = self.manager.config(&source).await {
                        self.stop_source(&source).await;
                        self.status.remove_source(&cfg);
                    }
                }
                Some(new_cfg) => {
                    let current = self.manager.config(&source).await;
                    if current.as_deref() != Some(new_cfg.as_ref()) {
                        info!(source, "Source configuration changed, restarting");
                        self.stop_source(&source).await;
                        self.start_source(Arc::clone(new_cfg)).await;
                    }
                }
            }
        }

        for (key, cfg) in &desired {
            if self.manager.config(key).await.is_none() {
                self.start_source(Arc::clone(cfg)).await;
            }
        }
    }

    async fn start_source(&self, cfg: Arc<SourceConfig>) {
        let Some(mut adapter) = self.factory.build(Arc::clone(&cfg)) else {
            let message = format!(
                "unknown ingester kind {:?} (known: {:?})",
                cfg.ingester,
                self.factory.kinds()
            );
            warn!(source = cfg.source.as_str(), message, "Cannot build adapter");
            self.metrics
                .adapter_errors_total
                .with_label_values(&[&cfg.source, &cfg.ingester])
                .inc();
            self.status.set_error(&cfg, message);
            return;
        };

        if let Err(e) = adapter.validate() {
            warn!(source = cfg.source.as_str(), error = %e, "Adapter validation failed");
            self.metrics
                .adapter_errors_total
                .with_label_values(&[&cfg.source, &cfg.ingester])
                .inc();
            self.status.set_error(&cfg, e.to_string());
            return;
        }

        match adapter.start().await {
            Ok(rx) => {
                let consumer = spawn_consumer(Arc::clone(&self.batcher), Arc::clone(&cfg), rx);
                match self.manager.add(adapter, Arc::clone(&cfg), consumer).await {
                    Ok(()) => {
                        info!(source = cfg.source.as_str(), kind = cfg.ingester.as_str(), "Source running");
                        self.status.set_running(&cfg);
                    }
                    Err(e) => {
                        warn!(source = cfg.source.as_str(), error = %e, "Failed to register adapter");
                        self.status.set_error(&cfg, e.to_string());
                    }
                }
            }
            Err(e) => {
                warn!(source = cfg.source.as_str(), error = %e, "Adapter start failed");
                self.metrics
                    .adapter_errors_total
                    .with_label_values(&[&cfg.source, &cfg.ingester])
                    .inc();
                self.status.set_error(&cfg, e.to_string());
            }
        }
    }

    async fn stop_source(&self, source: &str) {
        if let Some((mut adapter, consumer)) = self.manager.remove(source).await {
            adapter.stop().await;
            let abort = consumer.abort_handle();
            if tokio::time::timeout(STOP_GRACE, consumer).await.is_err() {
                warn!(source, "Consumer did not drain in time, aborting");
                abort.abort();
            }
        }
    }

    async fn shutdown_all(&self) {
        let drained = self.manager.drain().await;
        info!(sources = drained.len(), "Stopping all adapters");
        for (cfg, mut adapter, consumer) in drained {
            adapter.stop().await;
            let abort = consumer.abort_handle();
            if tokio::time::timeout(STOP_GRACE, consumer).await.is_err() {
                warn!(source = cfg.source.as_str(), "Consumer did not drain in time, aborting");
                abort.abort();
            }
            self.status.set_stopped(&cfg);
        }
    }
}

/// Read raw events until the adapter closes its channel, feeding each event
/// through the batch processor.
fn spawn_consumer(
    batcher: Arc<BatchProcessor>,
    cfg: Arc<SourceConfig>,
    mut rx: mpsc::Receiver<RawEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            batcher.submit(Arc::clone(&cfg), event).await;
        }
        debug!(source = cfg.source.as_str(), "Consumer loop ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Adapter;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use zen_api::SourceState;
    use zen_common::{
        DedupConfig, FilterConfig, IngesterConfig, ProcessingConfig, ZenError,
    };
    use zen_engine::batch::BatchOptions;
    use zen_engine::hooks::{HookRegistry, PendingObservation};
    use zen_engine::{
        DedupEngine, Filter, ObservationSink, Pipeline, ThresholdMonitor, WriteOutcome,
    };

    use crate::adapters::webhook::{SecretCache, WebhookRegistry};
    use crate::adapters::AdapterDeps;

    #[derive(Default)]
    struct MemorySink {
        written: Mutex<Vec<PendingObservation>>,
    }

    #[async_trait]
    impl ObservationSink for MemorySink {
        async fn write(&self, pending: PendingObservation) -> Result<WriteOutcome, ZenError> {
            self.written.lock().unwrap().push(pending);
            Ok(WriteOutcome::Created)
        }
    }

    /// Adapter whose producer side is handed to the test.
    struct MockAdapter {
        cfg: Arc<SourceConfig>,
        handle: Arc<Mutex<Option<mpsc::Sender<RawEvent>>>>,
        valid: bool,
    }

    #[async_trait]
    impl Adapter for MockAdapter {
        fn kind(&self) -> &'static str {
            "mock"
        }
        fn validate(&self) -> Result<(), ZenError> {
            if self.valid {
                Ok(())
            } else {
                Err(ZenError::Adapter {
                    kind: "mock".to_string(),
                    source_name: self.cfg.source.clone(),
                    message: "intentionally invalid".to_string(),
                })
            }
        }
        async fn start(&mut self) -> Result<mpsc::Receiver<RawEvent>, ZenError> {
            let (tx, rx) = mpsc::channel(16);
            *self.handle.lock().unwrap() = Some(tx);
            Ok(rx)
        }
        async fn stop(&mut self) {
            // Dropping the producer closes the channel exactly once.
            self.handle.lock().unwrap().take();
        }
    }

    fn mock_client() -> kube::Client {
        let service = tower::service_fn(|_req: axum::http::Request<kube::client::Body>| async {
            Ok::<_, std::convert::Infallible>(
                axum::http::Response::builder()
                    .status(404)
                    .body(kube::client::Body::empty())
                    .unwrap(),
            )
        });
        kube::Client::new(service, "default")
    }

    struct TestBed {
        orchestrator: Arc<Orchestrator>,
        store: Arc<IngesterStore>,
        manager: Arc<AdapterManager>,
        status: Arc<StatusTracker>,
        sink: Arc<MemorySink>,
        producer: Arc<Mutex<Option<mpsc::Sender<RawEvent>>>>,
    }

    fn testbed(valid: bool) -> TestBed {
        let metrics = zen_engine::Metrics::for_tests();
        let sink = Arc::new(MemorySink::default());
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(Filter::new()),
            Arc::new(DedupEngine::new(100)),
            Arc::new(ThresholdMonitor::new()),
            Arc::new(HookRegistry::new()),
            sink.clone() as Arc<dyn ObservationSink>,
            metrics.clone(),
        ));
        let batcher = Arc::new(BatchProcessor::new(
            pipeline,
            BatchOptions {
                max_size: 1,
                max_age: Duration::from_millis(10),
            },
        ));
        let status = Arc::new(StatusTracker::new());
        let webhooks = Arc::new(WebhookRegistry::new());
        let deps = AdapterDeps {
            client: mock_client(),
            webhooks,
            secrets: Arc::new(SecretCache::detached()),
            status: Arc::clone(&status),
            metrics: metrics.clone(),
        };

        let producer: Arc<Mutex<Option<mpsc::Sender<RawEvent>>>> = Arc::new(Mutex::new(None));
        let producer_for_factory = Arc::clone(&producer);
        let mut factory = AdapterFactory::new(deps);
        factory.register("mock", move |cfg, _deps| {
            Box::new(MockAdapter {
                cfg,
                handle: Arc::clone(&producer_for_factory),
                valid,
            })
        });

        let store = Arc::new(IngesterStore::new());
        let manager = Arc::new(AdapterManager::new());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&manager),
            factory,
            batcher,
            Arc::clone(&status),
            metrics,
        ));

        TestBed {
            orchestrator,
            store,
            manager,
            status,
            sink,
            producer,
        }
    }

    fn mock_config(source: &str) -> IngesterConfig {
        let key = format!("default/test/{source}");
        IngesterConfig {
            key: key.clone(),
            config: SourceConfig {
                source: key,
                source_name: source.to_string(),
                ingester: "mock".to_string(),
                namespace: "default".to_string(),
                ingester_name: "test".to_string(),
                webhook: None,
                informer: None,
                filter: FilterConfig::default(),
                dedup: DedupConfig::default(),
                normalization: None,
                processing: ProcessingConfig::default(),
                destinations: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn declared_source_starts_and_events_flow() {
        let bed = testbed(true);
        bed.store
            .replace_ingester("default", "test", vec![mock_config("alpha")]);
        bed.orchestrator.reconcile().await;

        assert_eq!(bed.manager.len().await, 1);
        assert_eq!(bed.status.running_source_count(), 1);

        let tx = bed.producer.lock().unwrap().clone().unwrap();
        let event = RawEvent::new(
            "default/test/alpha",
            serde_json::json!({"x": 1}).as_object().unwrap().clone(),
        );
        tx.send(event).await.unwrap();

        // Batch size is 1, so the consumer flushes inline.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if !bed.sink.written.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("event should reach the sink");
    }

    #[tokio::test]
    async fn undeclared_source_is_stopped_and_untracked() {
        let bed = testbed(true);
        bed.store
            .replace_ingester("default", "test", vec![mock_config("alpha")]);
        bed.orchestrator.reconcile().await;
        assert_eq!(bed.manager.len().await, 1);

        bed.store.remove_ingester("default", "test");
        bed.orchestrator.reconcile().await;

        assert!(bed.manager.is_empty().await);
        assert_eq!(bed.status.ingester_count(), 0);
    }

    #[tokio::test]
    async fn invalid_adapter_surfaces_error_state() {
        let bed = testbed(false);
        bed.store
            .replace_ingester("default", "test", vec![mock_config("alpha")]);
        bed.orchestrator.reconcile().await;

        assert!(bed.manager.is_empty().await);
        let snapshot = bed.status.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].1.sources[0].state, SourceState::Error);
        assert_eq!(snapshot[0].1.conditions[0].status, "False");
    }

    #[tokio::test]
    async fn unknown_kind_surfaces_error_state() {
        let bed = testbed(true);
        let mut config = mock_config("alpha");
        config.config.ingester = "nonexistent".to_string();
        bed.store.replace_ingester("default", "test", vec![config]);
        bed.orchestrator.reconcile().await;

        assert!(bed.manager.is_empty().await);
        let snapshot = bed.status.snapshot();
        assert_eq!(snapshot[0].1.sources[0].state, SourceState::Error);
    }

    #[tokio::test]
    async fn changed_config_restarts_the_adapter() {
        let bed = testbed(true);
        bed.store
            .replace_ingester("default", "test", vec![mock_config("alpha")]);
        bed.orchestrator.reconcile().await;
        assert_eq!(bed.manager.len().await, 1);

        let mut changed = mock_config("alpha");
        changed.config.dedup.window_seconds = 300;
        bed.store.replace_ingester("default", "test", vec![changed]);
        bed.orchestrator.reconcile().await;

        assert_eq!(bed.manager.len().await, 1);
        let cfg = bed.manager.config("default/test/alpha").await.unwrap();
        assert_eq!(cfg.dedup.window_seconds, 300);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let bed = testbed(true);
        bed.store
            .replace_ingester("default", "test", vec![mock_config("alpha")]);
        bed.orchestrator.reconcile().await;
        let first = bed.producer.lock().unwrap().clone();
        bed.orchestrator.reconcile().await;
        let second = bed.producer.lock().unwrap().clone();

        assert_eq!(bed.manager.len().await, 1);
        // No restart happened: the producer handle was not replaced.
        assert!(first.unwrap().same_channel(&second.unwrap()));
    }
}
