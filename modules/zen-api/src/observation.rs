//! The `Observation` custom resource — the externally visible product of the
//! ingest pipeline. Created by the writer, deleted by the garbage collector;
//! spec is never updated by this process.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use zen_common::{Category, Severity};

/// Reference to the Kubernetes object an observation is about.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "zen.io",
    version = "v1alpha1",
    kind = "Observation",
    plural = "observations",
    shortname = "obs",
    namespaced,
    status = "ObservationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ObservationSpec {
    /// Producer identifier.
    pub source: String,
    pub category: Category,
    pub severity: Severity,
    /// Source-defined event tag.
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,
    /// Schema-free carrier of the raw payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Map<String, Value>>,
    /// RFC3339 detection time as reported by the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<String>,
    /// Seconds after creation at which the GC may delete this observation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_creation: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_at: Option<String>,
}

impl ObservationSpec {
    /// Writer-side validation: the required fields must be non-blank and the
    /// TTL, when present, non-negative.
    pub fn validate(&self) -> Result<(), String> {
        if self.source.trim().is_empty() {
            return Err("spec.source must not be blank".to_string());
        }
        if self.event_type.trim().is_empty() {
            return Err("spec.eventType must not be blank".to_string());
        }
        if let Some(ttl) = self.ttl_seconds_after_creation {
            if ttl < 0 {
                return Err(format!("spec.ttlSecondsAfterCreation must be >= 0, got {ttl}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> ObservationSpec {
        ObservationSpec {
            source: "trivy".into(),
            category: Category::Security,
            severity: Severity::High,
            event_type: "vulnerability".into(),
            resource: None,
            details: None,
            detected_at: None,
            ttl_seconds_after_creation: None,
        }
    }

    #[test]
    fn valid_spec_passes() {
        assert!(spec().validate().is_ok());
    }

    #[test]
    fn blank_source_rejected() {
        let mut s = spec();
        s.source = "  ".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn blank_event_type_rejected() {
        let mut s = spec();
        s.event_type = String::new();
        assert!(s.validate().is_err());
    }

    #[test]
    fn negative_ttl_rejected() {
        let mut s = spec();
        s.ttl_seconds_after_creation = Some(-1);
        assert!(s.validate().is_err());
        s.ttl_seconds_after_creation = Some(0);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn spec_serializes_camel_case() {
        let mut s = spec();
        s.ttl_seconds_after_creation = Some(3600);
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["eventType"], json!("vulnerability"));
        assert_eq!(v["ttlSecondsAfterCreation"], json!(3600));
        assert_eq!(v["severity"], json!("HIGH"));
        assert_eq!(v["category"], json!("security"));
    }
}
