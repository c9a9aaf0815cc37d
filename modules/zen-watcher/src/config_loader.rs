//! Informer-driven loaders: Ingester CRDs → the ingester store, and the
//! well-known filter ConfigMap → the Filter's override set.
//!
//! Both loaders keep the last-known-good state on malformed input — a bad
//! payload never clears working configuration.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use zen_api::Ingester;
use zen_common::{
    DedupConfig, FilterConfig, IngesterConfig, ProcessingConfig, SourceConfig, ZenError,
};
use zen_engine::Filter;

use crate::status::StatusTracker;
use crate::store::IngesterStore;

/// Key inside the filter ConfigMap holding the per-source override JSON.
pub const FILTER_CONFIGMAP_KEY: &str = "filters.json";

/// Project one Ingester item into adapter-ready configurations — one per
/// declared source. Supports both the legacy flat `source` and the
/// multi-source shape; source-level blocks override ingester-level ones.
pub fn project_ingester(ing: &Ingester) -> Result<Vec<IngesterConfig>, ZenError> {
    let namespace = ing
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let name = ing
        .metadata
        .name
        .clone()
        .ok_or_else(|| ZenError::Config("ingester has no name".to_string()))?;
    let spec = &ing.spec;

    if spec.ingester.trim().is_empty() {
        return Err(ZenError::Config(format!(
            "{namespace}/{name}: spec.ingester must not be empty"
        )));
    }

    if !spec.sources.is_empty() {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut configs = Vec::with_capacity(spec.sources.len());
        for entry in &spec.sources {
            if entry.name.trim().is_empty() {
                return Err(ZenError::Config(format!(
                    "{namespace}/{name}: sources[].name must not be empty"
                )));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(ZenError::Config(format!(
                    "{namespace}/{name}: duplicate source name {:?}",
                    entry.name
                )));
            }
            let key = format!("{namespace}/{name}/{}", entry.name);
            configs.push(IngesterConfig {
                key: key.clone(),
                config: SourceConfig {
                    source: key,
                    source_name: entry.name.clone(),
                    ingester: spec.ingester.clone(),
                    namespace: namespace.clone(),
                    ingester_name: name.clone(),
                    webhook: entry.webhook.clone().or_else(|| spec.webhook.clone()),
                    informer: entry.informer.clone().or_else(|| spec.informer.clone()),
                    filter: entry
                        .filter
                        .clone()
                        .or_else(|| spec.filter.clone())
                        .unwrap_or_default(),
                    dedup: entry
                        .dedup
                        .clone()
                        .or_else(|| spec.dedup.clone())
                        .unwrap_or_default(),
                    normalization: entry
                        .normalization
                        .clone()
                        .or_else(|| spec.normalization.clone()),
                    processing: entry
                        .processing
                        .clone()
                        .or_else(|| spec.processing.clone())
                        .unwrap_or_default(),
                    destinations: spec.destinations.clone(),
                },
            });
        }
        return Ok(configs);
    }

    let source = spec
        .source
        .clone()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            ZenError::Config(format!(
                "{namespace}/{name}: either source or sources[] is required"
            ))
        })?;

    Ok(vec![IngesterConfig {
        key: source.clone(),
        config: SourceConfig {
            source: source.clone(),
            source_name: source,
            ingester: spec.ingester.clone(),
            namespace,
            ingester_name: name,
            webhook: spec.webhook.clone(),
            informer: spec.informer.clone(),
            filter: spec.filter.clone().unwrap_or_default(),
            dedup: spec.dedup.clone().unwrap_or_default(),
            normalization: spec.normalization.clone(),
            processing: spec.processing.clone().unwrap_or_default(),
            destinations: spec.destinations.clone(),
        },
    }])
}

/// Synthetic source config used to surface projection failures on the
/// Ingester status.
fn config_error_source(namespace: &str, name: &str) -> SourceConfig {
    SourceConfig {
        source: format!("{namespace}/{name}/_config"),
        source_name: "_config".to_string(),
        ingester: "config".to_string(),
        namespace: namespace.to_string(),
        ingester_name: name.to_string(),
        webhook: None,
        informer: None,
        filter: FilterConfig::default(),
        dedup: DedupConfig::default(),
        normalization: None,
        processing: ProcessingConfig::default(),
        destinations: Vec::new(),
    }
}

/// Watch Ingester CRDs and keep the store current. Sets `ready` after the
/// first full list so the health endpoint can report sync.
pub async fn run_ingester_loader(
    client: Client,
    store: Arc<IngesterStore>,
    tracker: Arc<StatusTracker>,
    ready: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let api: Api<Ingester> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    let mut pending: Option<Vec<IngesterConfig>> = None;

    loop {
        tokio::select! {
            item = stream.next() => {
                let Some(item) = item else { break };
                match item {
                    Ok(watcher::Event::Init) => {
                        pending = Some(Vec::new());
                    }
                    Ok(watcher::Event::InitApply(ing)) => {
                        match project_ingester(&ing) {
                            Ok(mut configs) => {
                                if let Some(pending) = pending.as_mut() {
                                    pending.append(&mut configs);
                                }
                            }
                            Err(e) => report_config_error(&tracker, &ing, &e),
                        }
                    }
                    Ok(watcher::Event::InitDone) => {
                        if let Some(configs) = pending.take() {
                            info!(configs = configs.len(), "Ingester list synced");
                            store.replace_all(configs);
                        }
                        ready.store(true, Ordering::SeqCst);
                    }
                    Ok(watcher::Event::Apply(ing)) => {
                        let namespace = ing.metadata.namespace.clone().unwrap_or_default();
                        let name = ing.metadata.name.clone().unwrap_or_default();
                        match project_ingester(&ing) {
                            Ok(configs) => {
                                debug!(namespace, name, sources = configs.len(), "Ingester updated");
                                store.replace_ingester(&namespace, &name, configs);
                            }
                            // Keep the last-known-good projection.
                            Err(e) => report_config_error(&tracker, &ing, &e),
                        }
                    }
                    Ok(watcher::Event::Delete(ing)) => {
                        let namespace = ing.metadata.namespace.clone().unwrap_or_default();
                        let name = ing.metadata.name.clone().unwrap_or_default();
                        info!(namespace, name, "Ingester deleted");
                        store.remove_ingester(&namespace, &name);
                    }
                    Err(e) => {
                        warn!(error = %e, "Ingester watch error");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Ingester loader stopped");
}

fn report_config_error(tracker: &StatusTracker, ing: &Ingester, err: &ZenError) {
    let namespace = ing.metadata.namespace.clone().unwrap_or_default();
    let name = ing.metadata.name.clone().unwrap_or_default();
    warn!(namespace, name, error = %err, "Rejecting invalid ingester");
    tracker.set_error(&config_error_source(&namespace, &name), err.to_string());
}

/// Parse the filter ConfigMap payload into per-source overrides.
pub fn parse_filter_overrides(raw: &str) -> Result<HashMap<String, FilterConfig>, ZenError> {
    serde_json::from_str(raw)
        .map_err(|e| ZenError::Config(format!("invalid {FILTER_CONFIGMAP_KEY}: {e}")))
}

/// Watch the well-known filter ConfigMap and hand valid payloads to the
/// Filter atomically.
pub async fn run_configmap_loader(
    client: Client,
    filter: Arc<Filter>,
    namespace: String,
    name: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    let wc = watcher::Config::default().fields(&format!("metadata.name={name}"));
    let mut stream = watcher(api, wc).default_backoff().boxed();

    loop {
        tokio::select! {
            item = stream.next() => {
                let Some(item) = item else { break };
                match item {
                    Ok(watcher::Event::Apply(cm)) | Ok(watcher::Event::InitApply(cm)) => {
                        apply_configmap(&filter, &namespace, &name, &cm);
                    }
                    Ok(watcher::Event::Delete(_)) => {
                        info!(namespace, name, "Filter ConfigMap deleted; keeping last-known-good overrides");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Filter ConfigMap watch error"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("ConfigMap loader stopped");
}

fn apply_configmap(filter: &Filter, namespace: &str, name: &str, cm: &ConfigMap) {
    let Some(raw) = cm.data.as_ref().and_then(|d| d.get(FILTER_CONFIGMAP_KEY)) else {
        warn!(
            namespace,
            name, "Filter ConfigMap has no {FILTER_CONFIGMAP_KEY} key; keeping last-known-good"
        );
        return;
    };
    match parse_filter_overrides(raw) {
        Ok(overrides) => {
            info!(namespace, name, sources = overrides.len(), "Filter overrides updated");
            filter.replace_overrides(overrides);
        }
        Err(e) => {
            warn!(namespace, name, error = %e, "Malformed filter ConfigMap; keeping last-known-good");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zen_api::{IngesterSpec, SourceSpec};
    use zen_common::{GvrSpec, InformerBinding, Severity, WebhookAuth, WebhookBinding};

    fn base_spec() -> IngesterSpec {
        IngesterSpec {
            ingester: "webhook".to_string(),
            source: None,
            sources: Vec::new(),
            webhook: None,
            informer: None,
            filter: None,
            dedup: None,
            normalization: None,
            processing: None,
            destinations: Vec::new(),
        }
    }

    fn ingester(name: &str, namespace: &str, spec: IngesterSpec) -> Ingester {
        let mut ing = Ingester::new(name, spec);
        ing.metadata.namespace = Some(namespace.to_string());
        ing
    }

    #[test]
    fn legacy_single_source_projects_flat_key() {
        let mut spec = base_spec();
        spec.source = Some("trivy".to_string());
        spec.webhook = Some(WebhookBinding {
            path: "/hooks/trivy".to_string(),
            port: None,
            methods: vec!["POST".to_string()],
            auth: WebhookAuth::default(),
            rate_limit: None,
        });

        let configs = project_ingester(&ingester("scanners", "default", spec)).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].key, "trivy");
        assert_eq!(configs[0].config.source_name, "trivy");
        assert_eq!(configs[0].config.namespace, "default");
        assert_eq!(configs[0].config.ingester_name, "scanners");
        assert!(configs[0].config.webhook.is_some());
    }

    #[test]
    fn multi_source_projects_namespaced_keys() {
        let mut spec = base_spec();
        spec.ingester = "informer".to_string();
        spec.informer = Some(InformerBinding {
            gvr: GvrSpec::parse("v1/pods").unwrap(),
            namespace: None,
            include_deletes: false,
        });
        spec.sources = vec![
            SourceSpec {
                name: "pods".to_string(),
                webhook: None,
                informer: None,
                filter: None,
                dedup: None,
                normalization: None,
                processing: None,
            },
            SourceSpec {
                name: "deployments".to_string(),
                webhook: None,
                informer: Some(InformerBinding {
                    gvr: GvrSpec::parse("apps/v1/deployments").unwrap(),
                    namespace: None,
                    include_deletes: false,
                }),
                filter: None,
                dedup: None,
                normalization: None,
                processing: None,
            },
        ];

        let configs = project_ingester(&ingester("watcher", "zen-system", spec)).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].key, "zen-system/watcher/pods");
        // Entry without its own informer inherits the ingester-level one.
        assert_eq!(
            configs[0].config.informer.as_ref().unwrap().gvr.resource,
            "pods"
        );
        // Entry with its own informer keeps it.
        assert_eq!(
            configs[1].config.informer.as_ref().unwrap().gvr.resource,
            "deployments"
        );
    }

    #[test]
    fn source_level_filter_overrides_ingester_level() {
        let mut spec = base_spec();
        spec.filter = Some(FilterConfig {
            min_severity: Some(Severity::Low),
            ..FilterConfig::default()
        });
        spec.sources = vec![SourceSpec {
            name: "strict".to_string(),
            webhook: None,
            informer: None,
            filter: Some(FilterConfig {
                min_severity: Some(Severity::Critical),
                ..FilterConfig::default()
            }),
            dedup: None,
            normalization: None,
            processing: None,
        }];

        let configs = project_ingester(&ingester("i", "default", spec)).unwrap();
        assert_eq!(configs[0].config.filter.min_severity, Some(Severity::Critical));
    }

    #[test]
    fn missing_source_is_a_config_error() {
        let spec = base_spec();
        let err = project_ingester(&ingester("broken", "default", spec)).unwrap_err();
        assert!(matches!(err, ZenError::Config(_)));
    }

    #[test]
    fn duplicate_source_names_rejected() {
        let mut spec = base_spec();
        let entry = SourceSpec {
            name: "dup".to_string(),
            webhook: None,
            informer: None,
            filter: None,
            dedup: None,
            normalization: None,
            processing: None,
        };
        spec.sources = vec![entry.clone(), entry];
        assert!(project_ingester(&ingester("i", "default", spec)).is_err());
    }

    #[test]
    fn filter_overrides_parse_and_reject() {
        let good = r#"{"trivy": {"minSeverity": "HIGH"}}"#;
        let parsed = parse_filter_overrides(good).unwrap();
        assert_eq!(parsed["trivy"].min_severity, Some(Severity::High));

        assert!(parse_filter_overrides("not json").is_err());
        assert!(parse_filter_overrides(r#"{"x": {"minSeverity": "BOGUS"}}"#).is_err());
    }
}
