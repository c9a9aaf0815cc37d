//! Registry of live adapters, their configs, and their consumer tasks, keyed
//! by source. Only the orchestrator writes; everything else reads.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use zen_common::{SourceConfig, ZenError};

use super::Adapter;

#[derive(Default)]
struct Registry {
    adapters: HashMap<String, Box<dyn Adapter>>,
    configs: HashMap<String, Arc<SourceConfig>>,
    consumers: HashMap<String, JoinHandle<()>>,
}

#[derive(Default)]
pub struct AdapterManager {
    inner: RwLock<Registry>,
}

impl AdapterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a started adapter. Refuses duplicate source keys — the
    /// caller must have removed the old entry first.
    pub async fn add(
        &self,
        adapter: Box<dyn Adapter>,
        cfg: Arc<SourceConfig>,
        consumer: JoinHandle<()>,
    ) -> Result<(), ZenError> {
        let mut inner = self.inner.write().await;
        if inner.adapters.contains_key(&cfg.source) {
            consumer.abort();
            return Err(ZenError::Adapter {
                kind: cfg.ingester.clone(),
                source_name: cfg.source.clone(),
                message: "source is already registered".to_string(),
            });
        }
        inner.consumers.insert(cfg.source.clone(), consumer);
        inner.configs.insert(cfg.source.clone(), Arc::clone(&cfg));
        inner.adapters.insert(cfg.source.clone(), adapter);
        Ok(())
    }

    /// Take a source's adapter and consumer out of the registry. Idempotent;
    /// the caller stops the adapter and joins the consumer.
    pub async fn remove(&self, source: &str) -> Option<(Box<dyn Adapter>, JoinHandle<()>)> {
        let mut inner = self.inner.write().await;
        let adapter = inner.adapters.remove(source)?;
        inner.configs.remove(source);
        let consumer = inner.consumers.remove(source)?;
        Some((adapter, consumer))
    }

    pub async fn config(&self, source: &str) -> Option<Arc<SourceConfig>> {
        self.inner.read().await.configs.get(source).cloned()
    }

    pub async fn sources(&self) -> Vec<String> {
        self.inner.read().await.adapters.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.adapters.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drain everything for shutdown.
    pub async fn drain(&self) -> Vec<(Arc<SourceConfig>, Box<dyn Adapter>, JoinHandle<()>)> {
        let mut inner = self.inner.write().await;
        let sources: Vec<String> = inner.adapters.keys().cloned().collect();
        let mut drained = Vec::with_capacity(sources.len());
        for source in sources {
            let adapter = inner.adapters.remove(&source).expect("listed above");
            let cfg = inner.configs.remove(&source).expect("added together");
            let consumer = inner.consumers.remove(&source).expect("added together");
            drained.push((cfg, adapter, consumer));
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use zen_common::{DedupConfig, FilterConfig, ProcessingConfig, RawEvent};

    struct NullAdapter;

    #[async_trait]
    impl Adapter for NullAdapter {
        fn kind(&self) -> &'static str {
            "null"
        }
        fn validate(&self) -> Result<(), ZenError> {
            Ok(())
        }
        async fn start(&mut self) -> Result<mpsc::Receiver<RawEvent>, ZenError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
        async fn stop(&mut self) {}
    }

    fn cfg(source: &str) -> Arc<SourceConfig> {
        Arc::new(SourceConfig {
            source: source.to_string(),
            source_name: source.to_string(),
            ingester: "null".to_string(),
            namespace: "default".to_string(),
            ingester_name: source.to_string(),
            webhook: None,
            informer: None,
            filter: FilterConfig::default(),
            dedup: DedupConfig::default(),
            normalization: None,
            processing: ProcessingConfig::default(),
            destinations: Vec::new(),
        })
    }

    fn consumer() -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    #[tokio::test]
    async fn add_and_remove_round_trip() {
        let manager = AdapterManager::new();
        manager
            .add(Box::new(NullAdapter), cfg("a"), consumer())
            .await
            .unwrap();
        assert_eq!(manager.len().await, 1);
        assert!(manager.config("a").await.is_some());

        let removed = manager.remove("a").await;
        assert!(removed.is_some());
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_source_refused() {
        let manager = AdapterManager::new();
        manager
            .add(Box::new(NullAdapter), cfg("a"), consumer())
            .await
            .unwrap();
        let err = manager
            .add(Box::new(NullAdapter), cfg("a"), consumer())
            .await
            .unwrap_err();
        assert!(matches!(err, ZenError::Adapter { .. }));
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let manager = AdapterManager::new();
        assert!(manager.remove("missing").await.is_none());
        manager
            .add(Box::new(NullAdapter), cfg("a"), consumer())
            .await
            .unwrap();
        assert!(manager.remove("a").await.is_some());
        assert!(manager.remove("a").await.is_none());
    }

    #[tokio::test]
    async fn drain_empties_the_registry() {
        let manager = AdapterManager::new();
        manager
            .add(Box::new(NullAdapter), cfg("a"), consumer())
            .await
            .unwrap();
        manager
            .add(Box::new(NullAdapter), cfg("b"), consumer())
            .await
            .unwrap();
        let drained = manager.drain().await;
        assert_eq!(drained.len(), 2);
        assert!(manager.is_empty().await);
    }
}
