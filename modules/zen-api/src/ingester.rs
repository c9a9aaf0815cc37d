//! The `Ingester` custom resource — declarative configuration for one event
//! source (or several, in multi-source mode). Owned by external actors; this
//! process reads spec and writes only status.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use zen_common::{
    DedupConfig, Destination, FilterConfig, InformerBinding, NormalizationConfig, ProcessingConfig,
    WebhookBinding,
};

/// A named source entry in multi-source mode. Every block is optional and
/// falls back to the Ingester-level block of the same name.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub informer: Option<InformerBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup: Option<DedupConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalization: Option<NormalizationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing: Option<ProcessingConfig>,
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "zen.io",
    version = "v1alpha1",
    kind = "Ingester",
    plural = "ingesters",
    shortname = "ing",
    namespaced,
    status = "IngesterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct IngesterSpec {
    /// Adapter kind: `informer` or `webhook`.
    pub ingester: String,
    /// Legacy single-source identifier; unique within the namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Multi-source mode; takes precedence over `source` when non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub informer: Option<InformerBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup: Option<DedupConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalization: Option<NormalizationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing: Option<ProcessingConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<Destination>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SourceState {
    Running,
    Stopped,
    Error,
}

impl SourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceState::Running => "Running",
            SourceState::Stopped => "Stopped",
            SourceState::Error => "Error",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    pub name: String,
    /// Adapter kind serving this source.
    pub r#type: String,
    pub state: SourceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// RFC3339 time of the last successful pipeline completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    /// "True" | "False".
    pub status: String,
    pub reason: String,
    pub message: String,
    pub last_transition_time: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngesterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Compute the `Ready` condition from per-source states.
///
/// Ready is True only when every source is Running; `previous` preserves the
/// transition time when the boolean status did not flip.
pub fn ready_condition(
    sources: &[SourceStatus],
    previous: Option<&Condition>,
    now: DateTime<Utc>,
) -> Condition {
    let bad: Vec<&SourceStatus> = sources
        .iter()
        .filter(|s| s.state != SourceState::Running)
        .collect();

    let (status, reason, message) = if sources.is_empty() {
        (
            "False",
            "NoSources".to_string(),
            "no sources are tracked for this ingester".to_string(),
        )
    } else if bad.is_empty() {
        (
            "True",
            "AllSourcesRunning".to_string(),
            format!("{} source(s) running", sources.len()),
        )
    } else {
        let names: Vec<String> = bad
            .iter()
            .map(|s| format!("{} ({})", s.name, s.state.as_str()))
            .collect();
        (
            "False",
            "SourcesNotRunning".to_string(),
            format!("sources not running: {}", names.join(", ")),
        )
    };

    let last_transition_time = match previous {
        Some(prev) if prev.status == status => prev.last_transition_time.clone(),
        _ => now.to_rfc3339(),
    };

    Condition {
        r#type: "Ready".to_string(),
        status: status.to_string(),
        reason,
        message,
        last_transition_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(name: &str, state: SourceState) -> SourceStatus {
        SourceStatus {
            name: name.to_string(),
            r#type: "webhook".to_string(),
            state,
            last_error: None,
            last_seen: None,
        }
    }

    #[test]
    fn all_running_is_ready() {
        let c = ready_condition(
            &[src("a", SourceState::Running), src("b", SourceState::Running)],
            None,
            Utc::now(),
        );
        assert_eq!(c.status, "True");
        assert_eq!(c.reason, "AllSourcesRunning");
    }

    #[test]
    fn any_error_is_not_ready() {
        let c = ready_condition(
            &[src("a", SourceState::Running), src("b", SourceState::Error)],
            None,
            Utc::now(),
        );
        assert_eq!(c.status, "False");
        assert!(c.message.contains("b (Error)"));
    }

    #[test]
    fn stopped_is_not_ready() {
        let c = ready_condition(&[src("a", SourceState::Stopped)], None, Utc::now());
        assert_eq!(c.status, "False");
    }

    #[test]
    fn empty_sources_is_not_ready() {
        let c = ready_condition(&[], None, Utc::now());
        assert_eq!(c.status, "False");
        assert_eq!(c.reason, "NoSources");
    }

    #[test]
    fn transition_time_preserved_when_status_unchanged() {
        let now = Utc::now();
        let first = ready_condition(&[src("a", SourceState::Running)], None, now);
        let later = ready_condition(
            &[src("a", SourceState::Running)],
            Some(&first),
            now + chrono::Duration::seconds(30),
        );
        assert_eq!(first.last_transition_time, later.last_transition_time);
    }

    #[test]
    fn transition_time_updates_on_flip() {
        let now = Utc::now();
        let first = ready_condition(&[src("a", SourceState::Running)], None, now);
        let later = ready_condition(
            &[src("a", SourceState::Error)],
            Some(&first),
            now + chrono::Duration::seconds(30),
        );
        assert_ne!(first.last_transition_time, later.last_transition_time);
        assert_eq!(later.status, "False");
    }
}
