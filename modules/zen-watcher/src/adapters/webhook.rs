//! Webhook adapter: authenticated HTTP posts on declared paths become raw
//! events. The adapter registers its path with the process HTTP server's
//! dynamic registry; the server routes unmatched paths here.
//!
//! Backpressure is explicit: a full channel returns 503 and counts the drop,
//! never blocks the request.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::StatusCode;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use zen_common::{AuthType, RawEvent, SourceConfig, WebhookAuth, ZenError};
use zen_engine::Metrics;

use super::{Adapter, AdapterDeps, EVENT_CHANNEL_CAPACITY};

/// Paths owned by the process server, never available to webhooks.
const RESERVED_PATHS: &[&str] = &["/metrics", "/health"];

/// How long a loaded Secret stays cached.
const SECRET_TTL: Duration = Duration::from_secs(300);

/// One registered webhook endpoint.
pub struct Endpoint {
    pub source: String,
    pub namespace: String,
    pub methods: Vec<String>,
    pub auth: WebhookAuth,
    pub(crate) tx: mpsc::Sender<RawEvent>,
}

/// Path → endpoint registry shared between adapters and the HTTP server.
#[derive(Default)]
pub struct WebhookRegistry {
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: &str, endpoint: Endpoint) -> Result<(), ZenError> {
        let mut endpoints = self.endpoints.write().expect("webhook registry lock poisoned");
        if endpoints.contains_key(path) {
            return Err(ZenError::Adapter {
                kind: "webhook".to_string(),
                source_name: endpoint.source,
                message: format!("path {path} is already registered"),
            });
        }
        endpoints.insert(path.to_string(), Arc::new(endpoint));
        Ok(())
    }

    pub fn deregister(&self, path: &str) {
        self.endpoints
            .write()
            .expect("webhook registry lock poisoned")
            .remove(path);
    }

    pub fn lookup(&self, path: &str) -> Option<Arc<Endpoint>> {
        self.endpoints
            .read()
            .expect("webhook registry lock poisoned")
            .get(path)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().expect("webhook registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type SecretData = BTreeMap<String, Vec<u8>>;

/// Secrets cached per `{namespace, name}` for five minutes.
pub struct SecretCache {
    client: Option<Client>,
    entries: tokio::sync::RwLock<HashMap<(String, String), (Instant, Arc<SecretData>)>>,
}

impl SecretCache {
    pub fn new(client: Client) -> Self {
        Self {
            client: Some(client),
            entries: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Cache-only instance for tests.
    pub fn detached() -> Self {
        Self {
            client: None,
            entries: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, namespace: &str, name: &str, data: SecretData) {
        self.entries.write().await.insert(
            (namespace.to_string(), name.to_string()),
            (Instant::now(), Arc::new(data)),
        );
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<Arc<SecretData>, ZenError> {
        let key = (namespace.to_string(), name.to_string());
        {
            let entries = self.entries.read().await;
            if let Some((loaded, data)) = entries.get(&key) {
                if loaded.elapsed() < SECRET_TTL {
                    return Ok(Arc::clone(data));
                }
            }
        }

        let client = self.client.as_ref().ok_or_else(|| {
            ZenError::Config(format!("secret {namespace}/{name} is not cached"))
        })?;
        let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
        let secret = tokio::time::timeout(Duration::from_secs(5), api.get(name))
            .await
            .map_err(|_| ZenError::Config(format!("timed out loading secret {namespace}/{name}")))?
            .map_err(|e| ZenError::Config(format!("failed to load secret {namespace}/{name}: {e}")))?;

        let mut data: SecretData = BTreeMap::new();
        if let Some(bytes) = secret.data {
            for (k, v) in bytes {
                data.insert(k, v.0);
            }
        }
        if let Some(strings) = secret.string_data {
            for (k, v) in strings {
                data.insert(k, v.into_bytes());
            }
        }

        let data = Arc::new(data);
        self.entries
            .write()
            .await
            .insert(key, (Instant::now(), Arc::clone(&data)));
        Ok(data)
    }
}

/// Equality without a data-dependent early exit: compare digests instead of
/// the raw bytes.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    Sha256::digest(a) == Sha256::digest(b)
}

/// Check the Authorization header against the endpoint's auth config.
/// A configured auth type with no secret available always fails closed.
pub fn authorize(auth: &WebhookAuth, secret: Option<&SecretData>, header: Option<&str>) -> bool {
    match auth.r#type {
        AuthType::None => true,
        AuthType::Bearer => {
            let Some(secret) = secret else { return false };
            let Some(expected) = secret.get("token") else { return false };
            let Some(header) = header else { return false };
            let Some(token) = header.strip_prefix("Bearer ") else { return false };
            constant_time_eq(token.as_bytes(), expected)
        }
        AuthType::Basic => {
            let Some(secret) = secret else { return false };
            let (Some(expected_user), Some(expected_pass)) =
                (secret.get("username"), secret.get("password"))
            else {
                return false;
            };
            let Some(header) = header else { return false };
            let Some(encoded) = header.strip_prefix("Basic ") else { return false };
            let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
                return false;
            };
            let Ok(decoded) = String::from_utf8(decoded) else { return false };
            let Some((user, pass)) = decoded.split_once(':') else { return false };

            if !constant_time_eq(user.as_bytes(), expected_user) {
                return false;
            }
            verify_password(pass, expected_pass)
        }
    }
}

/// Bcrypt when the stored password is a bcrypt hash; constant-time equality
/// for plain-text back-compat.
fn verify_password(given: &str, stored: &[u8]) -> bool {
    let stored_str = std::str::from_utf8(stored).unwrap_or_default();
    if stored_str.starts_with("$2a$") || stored_str.starts_with("$2b$") || stored_str.starts_with("$2y$")
    {
        bcrypt::verify(given, stored_str).unwrap_or(false)
    } else {
        constant_time_eq(given.as_bytes(), stored)
    }
}

/// Handle one webhook request after the server has read the (size-capped)
/// body. Returns the status and a JSON body.
pub async fn handle_request(
    endpoint: &Endpoint,
    method: &str,
    auth_header: Option<&str>,
    body: &[u8],
    secrets: &SecretCache,
    metrics: &Metrics,
) -> (StatusCode, Value) {
    if !endpoint.methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            json!({"error": "method not allowed"}),
        );
    }

    if endpoint.auth.r#type != AuthType::None {
        // Misconfiguration fails closed: no secret name means no way in.
        let secret = match &endpoint.auth.secret_name {
            Some(name) => secrets.get(&endpoint.namespace, name).await.ok(),
            None => None,
        };
        if !authorize(&endpoint.auth, secret.as_deref(), auth_header) {
            return (StatusCode::UNAUTHORIZED, json!({"error": "unauthorized"}));
        }
    }

    let parsed: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                json!({"error": "body must be valid JSON"}),
            );
        }
    };
    let raw_data = match parsed {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("payload".to_string(), other);
            map
        }
    };

    let event = RawEvent::new(endpoint.source.clone(), raw_data);
    match endpoint.tx.try_send(event) {
        Ok(()) => {
            metrics
                .adapter_events_total
                .with_label_values(&[&endpoint.source, "webhook"])
                .inc();
            (StatusCode::OK, json!({"status": "accepted"}))
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            metrics
                .webhook_events_dropped_total
                .with_label_values(&[&endpoint.source])
                .inc();
            warn!(source = endpoint.source.as_str(), "Webhook channel full, dropping event");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"error": "event channel is full"}),
            )
        }
        Err(mpsc::error::TrySendError::Closed(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"error": "source is shutting down"}),
        ),
    }
}

pub struct WebhookAdapter {
    cfg: Arc<SourceConfig>,
    deps: AdapterDeps,
    registered_path: Option<String>,
}

impl WebhookAdapter {
    pub fn new(cfg: Arc<SourceConfig>, deps: AdapterDeps) -> Self {
        Self {
            cfg,
            deps,
            registered_path: None,
        }
    }

    fn adapter_error(&self, message: impl Into<String>) -> ZenError {
        ZenError::Adapter {
            kind: "webhook".to_string(),
            source_name: self.cfg.source.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Adapter for WebhookAdapter {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    fn validate(&self) -> Result<(), ZenError> {
        let binding = self
            .cfg
            .webhook
            .as_ref()
            .ok_or_else(|| self.adapter_error("webhook block is required"))?;

        if !binding.path.starts_with('/') {
            return Err(self.adapter_error(format!("path {:?} must start with /", binding.path)));
        }
        if RESERVED_PATHS.contains(&binding.path.as_str()) {
            return Err(self.adapter_error(format!("path {} is reserved", binding.path)));
        }
        if binding.methods.is_empty() {
            return Err(self.adapter_error("at least one method must be declared"));
        }
        if binding.auth.r#type != AuthType::None && binding.auth.secret_name.is_none() {
            return Err(self.adapter_error(format!(
                "auth type {:?} requires auth.secretName",
                binding.auth.r#type
            )));
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<RawEvent>, ZenError> {
        self.validate()?;
        let binding = self.cfg.webhook.clone().expect("validated above");

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.deps.webhooks.register(
            &binding.path,
            Endpoint {
                source: self.cfg.source.clone(),
                namespace: self.cfg.namespace.clone(),
                methods: binding.methods.iter().map(|m| m.to_uppercase()).collect(),
                auth: binding.auth.clone(),
                tx,
            },
        )?;
        self.registered_path = Some(binding.path.clone());
        info!(
            source = self.cfg.source.as_str(),
            path = binding.path.as_str(),
            "Webhook adapter running"
        );
        Ok(rx)
    }

    async fn stop(&mut self) {
        if let Some(path) = self.registered_path.take() {
            self.deps.webhooks.deregister(&path);
            debug!(source = self.cfg.source.as_str(), path, "Webhook adapter stopped");
        }
    }
}
