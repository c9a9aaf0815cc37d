//! The CRD writer: the production [`ObservationSink`]. Consults the
//! allowlist before any API call, creates through the dynamic API surface
//! with generate-name, treats AlreadyExists as success, and retries
//! conflict/transient failures with jittered backoff.
//!
//! The writer is a sink. It does not re-run filter, dedup, or normalization;
//! the pipeline hands it an already-decided observation.

use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, PostParams};
use kube::Client;
use rand::Rng;
use serde_json::json;
use tracing::{debug, warn};

use zen_common::{Destination, GvrSpec, WriteErrorKind, ZenError};
use zen_engine::{
    Allowlist, GvrTarget, Metrics, ObservationSink, PendingObservation, WriteOutcome,
};

use crate::util::{api_resource_for_target, generate_name_prefix};

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(200);
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// The built-in `crd` destination: the Observation CRD itself.
fn default_target() -> GvrTarget {
    GvrTarget::new(zen_api::GROUP, zen_api::VERSION, "observations")
}

/// Resolve destination declarations into concrete GVR targets. Unknown
/// destination types are warned about and ignored; no declared `crd`
/// destination means the default Observation target.
pub fn resolve_targets(destinations: &[Destination]) -> Vec<GvrTarget> {
    let mut targets = Vec::new();
    for dest in destinations {
        match dest.r#type.as_str() {
            "crd" => match &dest.value {
                Some(value) => match GvrSpec::parse(value) {
                    Some(gvr) => targets.push(GvrTarget::from(&gvr)),
                    None => {
                        warn!(value = value.as_str(), "Ignoring crd destination with invalid GVR")
                    }
                },
                None => targets.push(default_target()),
            },
            other => {
                warn!(destination = other, "Ignoring unknown destination type");
            }
        }
    }
    if targets.is_empty() {
        targets.push(default_target());
    }
    targets
}

/// Classification of a kube API error: the metric kind and whether a retry
/// can help.
fn classify(err: &kube::Error) -> (WriteErrorKind, bool) {
    match err {
        kube::Error::Api(ae) => match ae.code {
            404 => (WriteErrorKind::NotFound, false),
            403 => (WriteErrorKind::Forbidden, false),
            409 => (WriteErrorKind::Conflict, true),
            429 => (WriteErrorKind::Transient, true),
            code if code >= 500 => (WriteErrorKind::Transient, true),
            _ => (WriteErrorKind::Other, false),
        },
        // Transport-level failures are worth retrying.
        _ => (WriteErrorKind::Transient, true),
    }
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1));
    base + Duration::from_millis(rand::rng().random_range(0..100))
}

pub struct CrdWriter {
    client: Client,
    allowlist: Allowlist,
    metrics: Metrics,
    default_namespace: Option<String>,
}

impl CrdWriter {
    pub fn new(
        client: Client,
        allowlist: Allowlist,
        metrics: Metrics,
        default_namespace: Option<String>,
    ) -> Self {
        Self {
            client,
            allowlist,
            metrics,
            default_namespace,
        }
    }

    async fn create_with_retry(
        &self,
        api: &Api<DynamicObject>,
        obj: &DynamicObject,
        source: &str,
    ) -> Result<WriteOutcome, ZenError> {
        let mut attempt = 1;
        loop {
            let result = tokio::time::timeout(CALL_TIMEOUT, api.create(&PostParams::default(), obj))
                .await;

            let err = match result {
                Ok(Ok(_)) => return Ok(WriteOutcome::Created),
                Ok(Err(e)) if is_already_exists(&e) => return Ok(WriteOutcome::AlreadyExists),
                Ok(Err(e)) => e,
                Err(_) => {
                    // Per-call deadline; counts as transient.
                    if attempt < MAX_ATTEMPTS {
                        attempt += 1;
                        tokio::time::sleep(backoff_with_jitter(attempt)).await;
                        continue;
                    }
                    self.metrics
                        .observations_create_errors_total
                        .with_label_values(&[source, WriteErrorKind::Transient.as_str()])
                        .inc();
                    return Err(ZenError::Write {
                        kind: WriteErrorKind::Transient,
                        message: "create timed out".to_string(),
                    });
                }
            };

            let (kind, retryable) = classify(&err);
            if retryable && attempt < MAX_ATTEMPTS {
                debug!(source, attempt, error = %err, "Retrying observation create");
                attempt += 1;
                tokio::time::sleep(backoff_with_jitter(attempt)).await;
                continue;
            }

            self.metrics
                .observations_create_errors_total
                .with_label_values(&[source, kind.as_str()])
                .inc();
            return Err(ZenError::Write {
                kind,
                message: err.to_string(),
            });
        }
    }
}

#[async_trait]
impl ObservationSink for CrdWriter {
    async fn write(&self, pending: PendingObservation) -> Result<WriteOutcome, ZenError> {
        let source = pending.spec.source.clone();

        if let Err(message) = pending.spec.validate() {
            self.metrics
                .observations_create_errors_total
                .with_label_values(&[&source, "invalid_spec"])
                .inc();
            return Err(ZenError::Write {
                kind: WriteErrorKind::Other,
                message,
            });
        }

        let namespace = if !pending.namespace.is_empty() {
            pending.namespace.clone()
        } else {
            self.default_namespace
                .clone()
                .unwrap_or_else(|| "default".to_string())
        };

        let mut outcome: Option<WriteOutcome> = None;
        let mut denied: Option<&'static str> = None;

        for target in resolve_targets(&pending.destinations) {
            if let Err(denial) = self.allowlist.allows(&target, Some(&namespace)) {
                let reason = denial.reason();
                self.metrics
                    .observations_create_errors_total
                    .with_label_values(&[&source, reason])
                    .inc();
                warn!(
                    source = source.as_str(),
                    namespace,
                    gvr = format!("{}/{}/{}", target.group, target.version, target.resource),
                    reason,
                    "Write target denied by allowlist"
                );
                denied.get_or_insert(reason);
                continue;
            }

            let ar = api_resource_for_target(&target);
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), &namespace, &ar);

            let mut obj = DynamicObject::new("", &ar);
            obj.metadata.name = None;
            obj.metadata.generate_name = Some(generate_name_prefix(&source));
            obj.metadata.namespace = Some(namespace.clone());
            if !pending.labels.is_empty() {
                obj.metadata.labels = Some(pending.labels.clone());
            }
            if !pending.annotations.is_empty() {
                obj.metadata.annotations = Some(pending.annotations.clone());
            }
            obj.data = json!({ "spec": &pending.spec });

            match self.create_with_retry(&api, &obj, &source).await? {
                WriteOutcome::Created => {
                    outcome = Some(WriteOutcome::Created);
                }
                WriteOutcome::AlreadyExists => {
                    outcome.get_or_insert(WriteOutcome::AlreadyExists);
                }
                WriteOutcome::Denied { .. } => unreachable!("denials never reach create"),
            }
        }

        match (outcome, denied) {
            (Some(outcome), _) => Ok(outcome),
            (None, Some(reason)) => Ok(WriteOutcome::Denied { reason }),
            // resolve_targets never returns an empty list.
            (None, None) => Ok(WriteOutcome::Denied { reason: "no_target" }),
        }
    }
}
