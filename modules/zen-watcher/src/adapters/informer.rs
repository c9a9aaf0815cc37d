//! Informer adapter: surfaces a watched resource kind as a stream of raw
//! events. Waits for the initial cache sync before declaring itself running;
//! list-watch failures surface on the Ingester status while the watch keeps
//! retrying with backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::{watcher, WatchStreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use zen_common::{RawEvent, SourceConfig, ZenError};

use crate::util::api_resource_for;

use super::{Adapter, AdapterDeps, EVENT_CHANNEL_CAPACITY};

/// How long `start` waits for the initial list to complete.
const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

pub struct InformerAdapter {
    cfg: Arc<SourceConfig>,
    deps: AdapterDeps,
    task: Option<JoinHandle<()>>,
}

impl InformerAdapter {
    pub fn new(cfg: Arc<SourceConfig>, deps: AdapterDeps) -> Self {
        Self {
            cfg,
            deps,
            task: None,
        }
    }

    fn adapter_error(&self, message: impl Into<String>) -> ZenError {
        ZenError::Adapter {
            kind: "informer".to_string(),
            source_name: self.cfg.source.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Adapter for InformerAdapter {
    fn kind(&self) -> &'static str {
        "informer"
    }

    fn validate(&self) -> Result<(), ZenError> {
        let binding = self
            .cfg
            .informer
            .as_ref()
            .ok_or_else(|| self.adapter_error("informer block is required"))?;
        if binding.gvr.version.trim().is_empty() {
            return Err(self.adapter_error("informer.gvr.version must not be empty"));
        }
        if binding.gvr.resource.trim().is_empty() {
            return Err(self.adapter_error("informer.gvr.resource must not be empty"));
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<RawEvent>, ZenError> {
        self.validate()?;
        let binding = self.cfg.informer.clone().expect("validated above");

        let ar = api_resource_for(&binding.gvr);
        let api: Api<DynamicObject> = match &binding.namespace {
            Some(ns) => Api::namespaced_with(self.deps.client.clone(), ns, &ar),
            None => Api::all_with(self.deps.client.clone(), &ar),
        };

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();

        let cfg = Arc::clone(&self.cfg);
        let deps = self.deps.clone();
        let gvr = binding.gvr.to_string();
        let include_deletes = binding.include_deletes;

        let task = tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            // Until the first sync completes there is no consumer attached;
            // initial-list objects are held back so the producer cannot wedge
            // on a full channel before `start` returns.
            let mut backlog: Option<Vec<DynamicObject>> = Some(Vec::new());
            let mut stream = watcher(api, watcher::Config::default())
                .default_backoff()
                .boxed();

            while let Some(item) = stream.next().await {
                match item {
                    Ok(watcher::Event::Init) => {
                        debug!(source = cfg.source.as_str(), gvr, "Informer relisting");
                    }
                    Ok(watcher::Event::InitDone) => {
                        if let Some(tx_ready) = ready_tx.take() {
                            let _ = tx_ready.send(Ok(()));
                        } else {
                            // A relist after a watch error recovered.
                            deps.status.set_running(&cfg);
                        }
                        debug!(source = cfg.source.as_str(), gvr, "Informer cache synced");

                        let mut closed = false;
                        if let Some(buffered) = backlog.take() {
                            for obj in buffered {
                                if send_event(&tx, &cfg, &gvr, obj, "apply").await.is_err() {
                                    closed = true;
                                    break;
                                }
                                deps.metrics
                                    .adapter_events_total
                                    .with_label_values(&[&cfg.source, "informer"])
                                    .inc();
                            }
                        }
                        if closed {
                            break;
                        }
                    }
                    Ok(watcher::Event::InitApply(obj)) | Ok(watcher::Event::Apply(obj)) => {
                        if let Some(buffered) = backlog.as_mut() {
                            buffered.push(obj);
                            continue;
                        }
                        if send_event(&tx, &cfg, &gvr, obj, "apply").await.is_err() {
                            break;
                        }
                        deps.metrics
                            .adapter_events_total
                            .with_label_values(&[&cfg.source, "informer"])
                            .inc();
                    }
                    Ok(watcher::Event::Delete(obj)) => {
                        if !include_deletes {
                            continue;
                        }
                        if send_event(&tx, &cfg, &gvr, obj, "delete").await.is_err() {
                            break;
                        }
                        deps.metrics
                            .adapter_events_total
                            .with_label_values(&[&cfg.source, "informer"])
                            .inc();
                    }
                    Err(e) => {
                        let message = format!("watch on {gvr} failed: {e}");
                        warn!(source = cfg.source.as_str(), error = %e, gvr, "Informer watch error");
                        deps.metrics
                            .adapter_errors_total
                            .with_label_values(&[&cfg.source, "informer"])
                            .inc();
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Err(message));
                            break;
                        }
                        deps.status.set_error(&cfg, message);
                    }
                }
            }
            debug!(source = cfg.source.as_str(), "Informer producer exited");
        });

        match tokio::time::timeout(SYNC_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                info!(source = self.cfg.source.as_str(), "Informer adapter running");
                self.task = Some(task);
                Ok(rx)
            }
            Ok(Ok(Err(message))) => {
                task.abort();
                Err(self.adapter_error(message))
            }
            // Sender dropped or the sync deadline passed.
            Ok(Err(_)) | Err(_) => {
                task.abort();
                Err(self.adapter_error("timed out waiting for initial cache sync"))
            }
        }
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(source = self.cfg.source.as_str(), "Informer adapter stopped");
        }
    }
}

async fn send_event(
    tx: &mpsc::Sender<RawEvent>,
    cfg: &SourceConfig,
    gvr: &str,
    obj: DynamicObject,
    action: &str,
) -> Result<(), ()> {
    let raw_data = match serde_json::to_value(&obj) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => {
            warn!(source = cfg.source.as_str(), "Watched object did not serialize to a map");
            return Ok(());
        }
    };
    let mut event = RawEvent::new(cfg.source.clone(), raw_data);
    event.metadata.insert("event".to_string(), action.to_string());
    event.metadata.insert("gvr".to_string(), gvr.to_string());

    // Blocking send: a slow consumer slows the producer, and the API-server
    // watch applies its own backpressure upstream.
    tx.send(event).await.map_err(|_| ())
}
