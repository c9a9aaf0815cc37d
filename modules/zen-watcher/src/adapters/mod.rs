//! Adapter runtime: the trait every source kind implements, the registry
//! based factory that constructs them, and the live-adapter manager.
//!
//! Adding a new source kind is one `register` call — no reflection, no
//! central match.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use tokio::sync::mpsc;

use zen_common::{RawEvent, SourceConfig, ZenError};
use zen_engine::Metrics;

use crate::adapters::webhook::{SecretCache, WebhookRegistry};
use crate::status::StatusTracker;

pub mod informer;
pub mod manager;
pub mod webhook;

pub use manager::AdapterManager;

/// Capacity of each adapter's event channel. Webhook sends are non-blocking
/// against this bound; informer sends block and let the watch slow down.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One running source. `start` is called at most once; `stop` closes the
/// event channel exactly once and is idempotent.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Static config validation, run before `start`. A failed validation
    /// surfaces on the Ingester status as `Error`.
    fn validate(&self) -> Result<(), ZenError>;

    async fn start(&mut self) -> Result<mpsc::Receiver<RawEvent>, ZenError>;

    async fn stop(&mut self);
}

/// Everything an adapter constructor might need.
#[derive(Clone)]
pub struct AdapterDeps {
    pub client: Client,
    pub webhooks: Arc<WebhookRegistry>,
    pub secrets: Arc<SecretCache>,
    pub status: Arc<StatusTracker>,
    pub metrics: Metrics,
}

type Constructor = Box<dyn Fn(Arc<SourceConfig>, &AdapterDeps) -> Box<dyn Adapter> + Send + Sync>;

/// Constructors keyed by the Ingester's `ingester` kind string.
pub struct AdapterFactory {
    deps: AdapterDeps,
    constructors: HashMap<&'static str, Constructor>,
}

impl AdapterFactory {
    /// Factory with the built-in kinds registered.
    pub fn new(deps: AdapterDeps) -> Self {
        let mut factory = Self {
            deps,
            constructors: HashMap::new(),
        };
        factory.register("informer", |cfg, deps| {
            Box::new(informer::InformerAdapter::new(cfg, deps.clone()))
        });
        factory.register("webhook", |cfg, deps| {
            Box::new(webhook::WebhookAdapter::new(cfg, deps.clone()))
        });
        factory
    }

    pub fn register(
        &mut self,
        kind: &'static str,
        constructor: impl Fn(Arc<SourceConfig>, &AdapterDeps) -> Box<dyn Adapter> + Send + Sync + 'static,
    ) {
        self.constructors.insert(kind, Box::new(constructor));
    }

    /// Construct an adapter for the config's declared kind, or None for an
    /// unknown kind.
    pub fn build(&self, cfg: Arc<SourceConfig>) -> Option<Box<dyn Adapter>> {
        self.constructors
            .get(cfg.ingester.as_str())
            .map(|ctor| ctor(cfg, &self.deps))
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = self.constructors.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}
