//! Shared domain types: severities, categories, raw events, and the
//! per-source configuration blocks embedded in the Ingester CRD.
//!
//! The config structs here carry `JsonSchema` so the CRD crate can embed them
//! directly into generated schemas.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event severity, ordered INFO < LOW < MEDIUM < HIGH < CRITICAL.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Case-insensitive parse. Returns None for unknown values; callers decide
    /// the fallback.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INFO" => Some(Severity::Info),
            "LOW" => Some(Severity::Low),
            "MEDIUM" => Some(Severity::Medium),
            "HIGH" => Some(Severity::High),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observation category.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Security,
    Compliance,
    Operations,
    Cost,
    Performance,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Security => "security",
            Category::Compliance => "compliance",
            Category::Operations => "operations",
            Category::Cost => "cost",
            Category::Performance => "performance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "security" => Some(Category::Security),
            "compliance" => Some(Category::Compliance),
            "operations" => Some(Category::Operations),
            "cost" => Some(Category::Cost),
            "performance" => Some(Category::Performance),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw event as produced by an adapter. Immutable once handed to the
/// pipeline.
#[derive(Clone, Debug)]
pub struct RawEvent {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub raw_data: serde_json::Map<String, Value>,
    pub metadata: HashMap<String, String>,
}

impl RawEvent {
    pub fn new(source: impl Into<String>, raw_data: serde_json::Map<String, Value>) -> Self {
        Self {
            source: source.into(),
            timestamp: Utc::now(),
            raw_data,
            metadata: HashMap::new(),
        }
    }
}

/// Look up a dotted path (`a.b.c`) in a JSON object.
pub fn lookup_path<'a>(map: &'a serde_json::Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = map.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Per-source configuration blocks (embedded in the Ingester CRD)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Bearer,
    Basic,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAuth {
    #[serde(default)]
    pub r#type: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub requests_per_minute: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,
}

fn default_methods() -> Vec<String> {
    vec!["POST".to_string()]
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookBinding {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub auth: WebhookAuth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GvrSpec {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl std::fmt::Display for GvrSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

impl GvrSpec {
    /// Parse `group/version/resource` or `version/resource` (core group).
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split('/').filter(|p| !p.is_empty()).collect();
        match parts.as_slice() {
            [version, resource] => Some(GvrSpec {
                group: String::new(),
                version: (*version).to_string(),
                resource: (*resource).to_string(),
            }),
            [group, version, resource] => Some(GvrSpec {
                group: (*group).to_string(),
                version: (*version).to_string(),
                resource: (*resource).to_string(),
            }),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InformerBinding {
    pub gvr: GvrSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub include_deletes: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    In,
    NotIn,
    Gt,
    Gte,
    Lt,
}

impl RuleOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleOperator::Equals => "equals",
            RuleOperator::In => "in",
            RuleOperator::NotIn => "not_in",
            RuleOperator::Gt => "gt",
            RuleOperator::Gte => "gte",
            RuleOperator::Lt => "lt",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterRule {
    pub field: String,
    pub operator: RuleOperator,
    pub value: Value,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<FilterRule>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_severity: None,
            rules: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DedupStrategy {
    #[default]
    Fingerprint,
    EventStream,
    Key,
}

impl DedupStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupStrategy::Fingerprint => "fingerprint",
            DedupStrategy::EventStream => "event-stream",
            DedupStrategy::Key => "key",
        }
    }
}

fn default_window_seconds() -> u64 {
    60
}

fn default_max_events_per_window() -> u32 {
    1
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DedupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default)]
    pub strategy: DedupStrategy,
    #[serde(default = "default_max_events_per_window")]
    pub max_events_per_window: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_seconds: default_window_seconds(),
            strategy: DedupStrategy::Fingerprint,
            max_events_per_window: default_max_events_per_window(),
            fields: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub from: String,
    pub to: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NormalizationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    /// Raw-data key (or value) → priority in [0,1]. First match wins.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub priority: std::collections::BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_mapping: Vec<FieldMapping>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOrder {
    #[default]
    Auto,
    FilterFirst,
    DedupFirst,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingConfig {
    #[serde(default)]
    pub order: ProcessingOrder,
    #[serde(default)]
    pub auto_optimize: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

// ---------------------------------------------------------------------------
// In-memory projections
// ---------------------------------------------------------------------------

/// The adapter-facing view of one source, materialized from an Ingester item.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceConfig {
    /// Process-wide unique source key (`<ns>/<ingester>/<sourceName>` in
    /// multi-source mode, the flat `source` in legacy mode).
    pub source: String,
    /// Short source name within its Ingester.
    pub source_name: String,
    /// Adapter kind (`informer`, `webhook`, ...).
    pub ingester: String,
    pub namespace: String,
    pub ingester_name: String,
    pub webhook: Option<WebhookBinding>,
    pub informer: Option<InformerBinding>,
    pub filter: FilterConfig,
    pub dedup: DedupConfig,
    pub normalization: Option<NormalizationConfig>,
    pub processing: ProcessingConfig,
    pub destinations: Vec<Destination>,
}

impl SourceConfig {
    /// The rate ceiling declared for this source, if any.
    pub fn rate_limit(&self) -> Option<&RateLimit> {
        self.webhook.as_ref().and_then(|w| w.rate_limit.as_ref())
    }
}

/// One Ingester CRD item projected into one adapter-ready configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct IngesterConfig {
    /// Store key; equals `config.source`.
    pub key: String,
    pub config: SourceConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn severity_order() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn severity_parse_case_insensitive() {
        assert_eq!(Severity::parse("critical"), Some(Severity::Critical));
        assert_eq!(Severity::parse(" High "), Some(Severity::High));
        assert_eq!(Severity::parse("bogus"), None);
    }

    #[test]
    fn severity_serde_uppercase() {
        assert_eq!(serde_json::to_string(&Severity::High).unwrap(), "\"HIGH\"");
        let s: Severity = serde_json::from_str("\"CRITICAL\"").unwrap();
        assert_eq!(s, Severity::Critical);
    }

    #[test]
    fn category_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Category::Security).unwrap(), "\"security\"");
        let c: Category = serde_json::from_str("\"compliance\"").unwrap();
        assert_eq!(c, Category::Compliance);
    }

    #[test]
    fn dedup_strategy_kebab_case() {
        let s: DedupStrategy = serde_json::from_str("\"event-stream\"").unwrap();
        assert_eq!(s, DedupStrategy::EventStream);
    }

    #[test]
    fn processing_order_snake_case() {
        let o: ProcessingOrder = serde_json::from_str("\"filter_first\"").unwrap();
        assert_eq!(o, ProcessingOrder::FilterFirst);
        let o: ProcessingOrder = serde_json::from_str("\"dedup_first\"").unwrap();
        assert_eq!(o, ProcessingOrder::DedupFirst);
    }

    #[test]
    fn gvr_parse_two_and_three_part() {
        let g = GvrSpec::parse("v1/pods").unwrap();
        assert_eq!(g.group, "");
        assert_eq!(g.version, "v1");
        assert_eq!(g.resource, "pods");

        let g = GvrSpec::parse("apps/v1/deployments").unwrap();
        assert_eq!(g.group, "apps");
        assert_eq!(g.resource, "deployments");

        assert!(GvrSpec::parse("pods").is_none());
        assert!(GvrSpec::parse("a/b/c/d").is_none());
    }

    #[test]
    fn lookup_path_nested() {
        let map = json!({"a": {"b": {"c": 7}}, "top": "x"});
        let map = map.as_object().unwrap();
        assert_eq!(lookup_path(map, "a.b.c"), Some(&json!(7)));
        assert_eq!(lookup_path(map, "top"), Some(&json!("x")));
        assert_eq!(lookup_path(map, "a.missing"), None);
        assert_eq!(lookup_path(map, "top.deeper"), None);
    }

    #[test]
    fn filter_config_defaults_enabled() {
        let f: FilterConfig = serde_json::from_str("{}").unwrap();
        assert!(f.enabled);
        assert!(f.min_severity.is_none());
        assert!(f.rules.is_empty());
    }

    #[test]
    fn dedup_config_defaults() {
        let d: DedupConfig = serde_json::from_str("{}").unwrap();
        assert!(d.enabled);
        assert_eq!(d.window_seconds, 60);
        assert_eq!(d.strategy, DedupStrategy::Fingerprint);
        assert_eq!(d.max_events_per_window, 1);
    }

    #[test]
    fn webhook_binding_default_methods() {
        let w: WebhookBinding = serde_json::from_value(json!({"path": "/hooks/x"})).unwrap();
        assert_eq!(w.methods, vec!["POST"]);
        assert_eq!(w.auth.r#type, AuthType::None);
    }
}
