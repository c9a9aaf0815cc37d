use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kube::Client;
use prometheus::Registry;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use zen_common::{Config, GvrSpec};
use zen_engine::batch::{BatchOptions, BatchProcessor};
use zen_engine::hooks::HookRegistry;
use zen_engine::pipeline::SuppressionRatioAdvisor;
use zen_engine::{
    Allowlist, AllowlistConfig, DedupEngine, Filter, Metrics, ObservationSink, OrderAdvisor,
    Pipeline, ThresholdMonitor,
};

use zen_watcher::adapters::webhook::{SecretCache, WebhookRegistry};
use zen_watcher::adapters::{AdapterDeps, AdapterFactory, AdapterManager};
use zen_watcher::config_loader;
use zen_watcher::gc::{GarbageCollector, GcConfig};
use zen_watcher::orchestrator::Orchestrator;
use zen_watcher::server::{self, AppState};
use zen_watcher::shutdown::{self, Shutdown, TaskGroup};
use zen_watcher::status::{run_status_updater, StatusTracker};
use zen_watcher::store::IngesterStore;
use zen_watcher::writer::CrdWriter;

/// How long background tasks get to wind down after the signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

/// Map the LOG_LEVEL env convention onto tracing directives.
fn log_directives(level: &str) -> String {
    let level = match level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARN" => "warn",
        "ERROR" | "CRIT" => "error",
        _ => "info",
    };
    ["zen_watcher", "zen_engine", "zen_api", "zen_common"]
        .map(|krate| format!("{krate}={level}"))
        .join(",")
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_directives(&config.log_level))),
        )
        .init();

    info!("Zen Watcher starting...");
    config.log_startup();

    let client = Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;

    // Metrics registry and instruments.
    let registry = Registry::new();
    let metrics = Metrics::new(&registry).context("failed to register metrics")?;

    // Engines.
    let filter = Arc::new(Filter::new());
    let dedup = Arc::new(DedupEngine::new(config.dedup_max_entries));
    Arc::clone(&dedup).start_sweeper(Duration::from_secs(60));
    let threshold = Arc::new(ThresholdMonitor::new());
    let hooks = Arc::new(HookRegistry::new());

    // The writer may always target the Observation CRD; further GVRs come
    // from the environment.
    let mut allowed_gvrs = vec![GvrSpec {
        group: zen_api::GROUP.to_string(),
        version: zen_api::VERSION.to_string(),
        resource: "observations".to_string(),
    }];
    allowed_gvrs.extend(config.allowed_gvrs.clone());
    let allowlist = Allowlist::new(AllowlistConfig {
        allowed_gvrs,
        denied_gvrs: Vec::new(),
        allowed_namespaces: config.allowed_namespaces.clone(),
        allow_cluster_scoped: config.allow_cluster_scoped,
        watch_namespace: config.watch_namespace.clone(),
    });

    let writer = Arc::new(CrdWriter::new(
        client.clone(),
        allowlist,
        metrics.clone(),
        config.watch_namespace.clone(),
    ));

    let advisor: Arc<dyn OrderAdvisor> = Arc::new(SuppressionRatioAdvisor::new());
    let pipeline = Arc::new(
        Pipeline::new(
            Arc::clone(&filter),
            Arc::clone(&dedup),
            threshold,
            hooks,
            writer as Arc<dyn ObservationSink>,
            metrics.clone(),
        )
        .with_advisor(advisor),
    );

    let status = Arc::new(StatusTracker::new());
    let tracker_for_observer = Arc::clone(&status);
    let batcher = Arc::new(
        BatchProcessor::new(Arc::clone(&pipeline), BatchOptions::default()).with_observer(
            Arc::new(move |cfg, outcome| {
                if outcome.is_written() {
                    tracker_for_observer.touch(cfg);
                }
            }),
        ),
    );
    Arc::clone(&batcher).start_flusher();

    // Adapter runtime.
    let webhooks = Arc::new(WebhookRegistry::new());
    let secrets = Arc::new(SecretCache::new(client.clone()));
    let factory = AdapterFactory::new(AdapterDeps {
        client: client.clone(),
        webhooks: Arc::clone(&webhooks),
        secrets: Arc::clone(&secrets),
        status: Arc::clone(&status),
        metrics: metrics.clone(),
    });
    let manager = Arc::new(AdapterManager::new());

    let store = Arc::new(IngesterStore::new());
    let ready = Arc::new(AtomicBool::new(false));

    let shutdown = Shutdown::new();
    let mut tasks = TaskGroup::new();

    // Config loaders.
    tasks.register(
        "ingester-loader",
        tokio::spawn(config_loader::run_ingester_loader(
            client.clone(),
            Arc::clone(&store),
            Arc::clone(&status),
            Arc::clone(&ready),
            shutdown.subscribe(),
        )),
    );
    tasks.register(
        "configmap-loader",
        tokio::spawn(config_loader::run_configmap_loader(
            client.clone(),
            Arc::clone(&filter),
            config.filter_configmap_namespace(),
            config.filter_configmap.clone(),
            shutdown.subscribe(),
        )),
    );

    // Orchestrator. Its task is joined separately at shutdown: adapters and
    // consumers must be fully stopped before the final batch flush.
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&manager),
        factory,
        Arc::clone(&batcher),
        Arc::clone(&status),
        metrics.clone(),
    ));
    let orchestrator_task = tokio::spawn(Arc::clone(&orchestrator).run(shutdown.subscribe()));

    // Status updater.
    tasks.register(
        "status-updater",
        tokio::spawn(run_status_updater(
            client.clone(),
            Arc::clone(&status),
            metrics.clone(),
            shutdown.subscribe(),
        )),
    );

    // Garbage collector.
    let gc = GarbageCollector::new(
        client.clone(),
        GcConfig {
            interval: config.gc_interval,
            timeout: config.gc_timeout,
            default_ttl_days: config.observation_ttl_days,
            watch_namespace: config.watch_namespace.clone(),
        },
        metrics.clone(),
    );
    let gc_shutdown = shutdown.subscribe();
    tasks.register(
        "garbage-collector",
        tokio::spawn(async move { gc.run(gc_shutdown).await }),
    );

    // HTTP surface.
    let app_state = AppState {
        webhooks,
        secrets,
        metrics,
        registry,
        ready,
        max_body_bytes: config.server_max_request_bytes,
    };
    let listener = TcpListener::bind((config.server_host.as_str(), config.server_port))
        .await
        .with_context(|| {
            format!("failed to bind {}:{}", config.server_host, config.server_port)
        })?;
    let server_shutdown = shutdown.subscribe();
    tasks.register(
        "http-server",
        tokio::spawn(async move {
            if let Err(e) = server::serve(listener, server::router(app_state), server_shutdown).await
            {
                tracing::error!(error = %e, "HTTP server failed");
            }
        }),
    );

    shutdown::wait_for_signal().await;
    info!("Shutting down");
    shutdown.trigger();

    // Wait for the orchestrator to stop every adapter and drain every
    // consumer; only then is the batcher's content final.
    let abort_orchestrator = orchestrator_task.abort_handle();
    if tokio::time::timeout(SHUTDOWN_GRACE, orchestrator_task)
        .await
        .is_err()
    {
        tracing::warn!("Orchestrator did not stop within the grace period, aborting");
        abort_orchestrator.abort();
    }

    // Final flush of whatever the consumers queued, then stop the timers.
    batcher.flush_all().await;
    batcher.stop();
    dedup.stop();

    tasks.join_with_grace(SHUTDOWN_GRACE).await;
    info!("Zen Watcher stopped");
    Ok(())
}
