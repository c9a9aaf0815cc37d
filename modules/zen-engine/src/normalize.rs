//! Normalization: map a raw event into the canonical Observation spec using
//! the source's normalization rules. Deterministic and total — every raw
//! event normalizes to something.

use serde_json::Value;

use zen_api::{ObservationSpec, ResourceRef};
use zen_common::{lookup_path, Category, NormalizationConfig, RawEvent, Severity, SourceConfig};

const DEFAULT_EVENT_TYPE: &str = "custom-event";

/// Fixed priority-to-severity mapping.
fn priority_to_severity(priority: f64) -> Severity {
    if priority >= 0.9 {
        Severity::Critical
    } else if priority >= 0.7 {
        Severity::High
    } else if priority >= 0.4 {
        Severity::Medium
    } else if priority >= 0.2 {
        Severity::Low
    } else {
        Severity::Info
    }
}

/// Derive the severity for a raw payload. Each configured `{key → priority}`
/// pair is matched against raw-data keys and values; the first match wins
/// and unmatched payloads default to 0.5.
pub fn derive_severity(
    raw: &serde_json::Map<String, Value>,
    cfg: Option<&NormalizationConfig>,
) -> Severity {
    let Some(cfg) = cfg else {
        return Severity::Medium;
    };
    if cfg.priority.is_empty() {
        return Severity::Medium;
    }

    for (key, priority) in &cfg.priority {
        if lookup_path(raw, key).is_some() || value_matches(raw, key) {
            return priority_to_severity(*priority);
        }
    }
    priority_to_severity(0.5)
}

/// True when any top-level string value equals `needle` (case-insensitive),
/// so priority keys like "HIGH" match severity-carrying payloads.
fn value_matches(raw: &serde_json::Map<String, Value>, needle: &str) -> bool {
    raw.values()
        .any(|v| v.as_str().is_some_and(|s| s.eq_ignore_ascii_case(needle)))
}

pub fn derive_category(cfg: Option<&NormalizationConfig>) -> Category {
    cfg.and_then(|c| c.domain).unwrap_or(Category::Security)
}

/// Pull a resource reference out of well-known raw keys: an explicit
/// `resource` object, or the shape of a watched Kubernetes object.
fn extract_resource(raw: &serde_json::Map<String, Value>) -> Option<ResourceRef> {
    if let Some(res) = raw.get("resource").and_then(|v| v.as_object()) {
        return Some(ResourceRef {
            api_version: str_field(res, "apiVersion"),
            kind: str_field(res, "kind"),
            namespace: str_field(res, "namespace"),
            name: str_field(res, "name"),
        });
    }

    if raw.contains_key("kind") && raw.contains_key("metadata") {
        let meta = raw.get("metadata").and_then(|v| v.as_object());
        return Some(ResourceRef {
            api_version: str_field(raw, "apiVersion"),
            kind: str_field(raw, "kind"),
            namespace: meta.and_then(|m| str_field(m, "namespace")),
            name: meta.and_then(|m| str_field(m, "name")),
        });
    }

    None
}

fn str_field(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Normalize a raw event into an Observation spec.
pub fn normalize(event: &RawEvent, cfg: &SourceConfig) -> ObservationSpec {
    let ncfg = cfg.normalization.as_ref();

    let mut details = event.raw_data.clone();
    if let Some(ncfg) = ncfg {
        for mapping in &ncfg.field_mapping {
            if let Some(value) = lookup_path(&event.raw_data, &mapping.from) {
                details.insert(mapping.to.clone(), value.clone());
            }
        }
    }

    ObservationSpec {
        source: event.source.clone(),
        category: derive_category(ncfg),
        severity: derive_severity(&event.raw_data, ncfg),
        event_type: ncfg
            .and_then(|c| c.r#type.clone())
            .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
        resource: extract_resource(&event.raw_data),
        details: Some(details),
        detected_at: Some(event.timestamp.to_rfc3339()),
        ttl_seconds_after_creation: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use zen_common::{
        DedupConfig, FieldMapping, FilterConfig, ProcessingConfig,
    };

    fn source_config(normalization: Option<NormalizationConfig>) -> SourceConfig {
        SourceConfig {
            source: "trivy".into(),
            source_name: "trivy".into(),
            ingester: "webhook".into(),
            namespace: "default".into(),
            ingester_name: "trivy".into(),
            webhook: None,
            informer: None,
            filter: FilterConfig::default(),
            dedup: DedupConfig::default(),
            normalization,
            processing: ProcessingConfig::default(),
            destinations: Vec::new(),
        }
    }

    fn event(data: serde_json::Value) -> RawEvent {
        RawEvent::new("trivy", data.as_object().unwrap().clone())
    }

    #[test]
    fn defaults_without_config() {
        let e = event(json!({"cve": "CVE-1"}));
        let spec = normalize(&e, &source_config(None));
        assert_eq!(spec.category, Category::Security);
        assert_eq!(spec.severity, Severity::Medium);
        assert_eq!(spec.event_type, "custom-event");
        assert_eq!(spec.details.as_ref().unwrap()["cve"], json!("CVE-1"));
        assert_eq!(spec.source, "trivy");
    }

    #[test]
    fn config_sets_category_and_event_type() {
        let cfg = NormalizationConfig {
            domain: Some(Category::Compliance),
            r#type: Some("policy-violation".into()),
            ..NormalizationConfig::default()
        };
        let spec = normalize(&event(json!({})), &source_config(Some(cfg)));
        assert_eq!(spec.category, Category::Compliance);
        assert_eq!(spec.event_type, "policy-violation");
    }

    #[test]
    fn priority_value_match_wins() {
        let mut priority = BTreeMap::new();
        priority.insert("HIGH".to_string(), 0.8);
        let cfg = NormalizationConfig {
            r#type: Some("vulnerability".into()),
            priority,
            ..NormalizationConfig::default()
        };
        let spec = normalize(
            &event(json!({"severity": "HIGH", "cve": "CVE-1"})),
            &source_config(Some(cfg)),
        );
        assert_eq!(spec.severity, Severity::High);
        assert_eq!(spec.event_type, "vulnerability");
    }

    #[test]
    fn priority_key_match_wins() {
        let mut priority = BTreeMap::new();
        priority.insert("panic".to_string(), 0.95);
        let cfg = NormalizationConfig {
            priority,
            ..NormalizationConfig::default()
        };
        let spec = normalize(
            &event(json!({"panic": {"stack": "..."}})),
            &source_config(Some(cfg)),
        );
        assert_eq!(spec.severity, Severity::Critical);
    }

    #[test]
    fn unmatched_priority_defaults_to_medium() {
        let mut priority = BTreeMap::new();
        priority.insert("CRITICAL".to_string(), 0.95);
        let cfg = NormalizationConfig {
            priority,
            ..NormalizationConfig::default()
        };
        let spec = normalize(&event(json!({"severity": "LOW"})), &source_config(Some(cfg)));
        // Default priority 0.5 → MEDIUM.
        assert_eq!(spec.severity, Severity::Medium);
    }

    #[test]
    fn priority_thresholds() {
        assert_eq!(priority_to_severity(0.95), Severity::Critical);
        assert_eq!(priority_to_severity(0.9), Severity::Critical);
        assert_eq!(priority_to_severity(0.89), Severity::High);
        assert_eq!(priority_to_severity(0.7), Severity::High);
        assert_eq!(priority_to_severity(0.5), Severity::Medium);
        assert_eq!(priority_to_severity(0.4), Severity::Medium);
        assert_eq!(priority_to_severity(0.3), Severity::Low);
        assert_eq!(priority_to_severity(0.2), Severity::Low);
        assert_eq!(priority_to_severity(0.1), Severity::Info);
    }

    #[test]
    fn field_mapping_extracts_dotted_paths() {
        let cfg = NormalizationConfig {
            field_mapping: vec![FieldMapping {
                from: "output.fields.container".into(),
                to: "container".into(),
            }],
            ..NormalizationConfig::default()
        };
        let spec = normalize(
            &event(json!({"output": {"fields": {"container": "nginx"}}})),
            &source_config(Some(cfg)),
        );
        let details = spec.details.unwrap();
        assert_eq!(details["container"], json!("nginx"));
        // Original payload is preserved alongside.
        assert!(details.contains_key("output"));
    }

    #[test]
    fn explicit_resource_extracted() {
        let spec = normalize(
            &event(json!({
                "resource": {"apiVersion": "v1", "kind": "Pod", "namespace": "prod", "name": "api-0"}
            })),
            &source_config(None),
        );
        let res = spec.resource.unwrap();
        assert_eq!(res.kind.as_deref(), Some("Pod"));
        assert_eq!(res.namespace.as_deref(), Some("prod"));
        assert_eq!(res.name.as_deref(), Some("api-0"));
    }

    #[test]
    fn watched_object_shape_extracted() {
        let spec = normalize(
            &event(json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web", "namespace": "default"}
            })),
            &source_config(None),
        );
        let res = spec.resource.unwrap();
        assert_eq!(res.api_version.as_deref(), Some("apps/v1"));
        assert_eq!(res.kind.as_deref(), Some("Deployment"));
        assert_eq!(res.name.as_deref(), Some("web"));
    }

    #[test]
    fn normalization_is_deterministic() {
        let mut priority = BTreeMap::new();
        priority.insert("HIGH".to_string(), 0.8);
        let cfg = source_config(Some(NormalizationConfig {
            domain: Some(Category::Security),
            r#type: Some("vulnerability".into()),
            priority,
            ..NormalizationConfig::default()
        }));
        let e = event(json!({"severity": "HIGH", "cve": "CVE-1"}));
        let a = normalize(&e, &cfg);
        let b = normalize(&e, &cfg);
        assert_eq!(serde_json::to_value(&a).unwrap(), serde_json::to_value(&b).unwrap());
    }
}
