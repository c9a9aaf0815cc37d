//! Per-source event filtering: a severity floor plus AND-composed field
//! predicates over the raw details.
//!
//! Runs on a minimal observation structure before normalization. Per-source
//! overrides arrive at runtime from the filter ConfigMap; malformed updates
//! never reach this module, and the last good override set is kept until
//! replaced.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use tracing::info;

use zen_common::{lookup_path, Category, FilterConfig, FilterRule, RuleOperator, Severity};

/// The minimal view of an event sufficient for filtering: identity, derived
/// severity, and the raw details. Full normalization is deferred.
#[derive(Debug)]
pub struct MinimalObservation<'a> {
    pub source: &'a str,
    pub category: Category,
    pub severity: Severity,
    pub details: &'a serde_json::Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterDecision {
    Allow,
    Drop { reason: String },
}

impl FilterDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, FilterDecision::Allow)
    }
}

#[derive(Default)]
pub struct Filter {
    /// Source → override config, fed by the ConfigMap loader.
    overrides: RwLock<HashMap<String, FilterConfig>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether the event passes. `cfg` is the source's declared filter;
    /// a ConfigMap override for the same source takes precedence.
    pub fn decide(&self, cfg: &FilterConfig, obs: &MinimalObservation<'_>) -> FilterDecision {
        let overrides = self.overrides.read().expect("filter overrides lock poisoned");
        let effective = overrides.get(obs.source).unwrap_or(cfg);
        decide(effective, obs)
    }

    /// Atomically replace the override set. Callers only hand in parsed,
    /// valid configuration; a failed parse upstream keeps the previous set.
    pub fn replace_overrides(&self, new: HashMap<String, FilterConfig>) {
        let mut overrides = self.overrides.write().expect("filter overrides lock poisoned");
        info!(sources = new.len(), "Filter overrides replaced");
        *overrides = new;
    }

    pub fn override_count(&self) -> usize {
        self.overrides.read().expect("filter overrides lock poisoned").len()
    }
}

/// Pure decision function over one config.
pub fn decide(cfg: &FilterConfig, obs: &MinimalObservation<'_>) -> FilterDecision {
    if !cfg.enabled {
        return FilterDecision::Allow;
    }

    if let Some(floor) = cfg.min_severity {
        if obs.severity < floor {
            return FilterDecision::Drop {
                reason: "severity_filter".to_string(),
            };
        }
    }

    for rule in &cfg.rules {
        if !rule_allows(rule, obs.details) {
            return FilterDecision::Drop {
                reason: rule_reason(rule),
            };
        }
    }

    FilterDecision::Allow
}

fn rule_reason(rule: &FilterRule) -> String {
    format!("rule_{}_{}", rule.field.replace('.', "_"), rule.operator.as_str())
}

fn rule_allows(rule: &FilterRule, details: &serde_json::Map<String, Value>) -> bool {
    let actual = lookup_path(details, &rule.field);
    match rule.operator {
        RuleOperator::Equals => actual.is_some_and(|a| json_eq(a, &rule.value)),
        RuleOperator::In => actual.is_some_and(|a| in_list(a, &rule.value)),
        RuleOperator::NotIn => actual.is_none_or(|a| !in_list(a, &rule.value)),
        RuleOperator::Gt => numeric_cmp(actual, &rule.value).is_some_and(|o| o == std::cmp::Ordering::Greater),
        RuleOperator::Gte => numeric_cmp(actual, &rule.value)
            .is_some_and(|o| o != std::cmp::Ordering::Less),
        RuleOperator::Lt => numeric_cmp(actual, &rule.value).is_some_and(|o| o == std::cmp::Ordering::Less),
    }
}

/// Equality that tolerates string/number representation differences
/// ("5" == 5), since raw payloads are not consistently typed.
fn json_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => as_string(a) == as_string(b),
    }
}

fn in_list(actual: &Value, list: &Value) -> bool {
    match list.as_array() {
        Some(items) => items.iter().any(|item| json_eq(actual, item)),
        // A scalar "in" degenerates to equality.
        None => json_eq(actual, list),
    }
}

fn numeric_cmp(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let a = as_f64(actual?)?;
    let b = as_f64(expected)?;
    a.partial_cmp(&b)
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn details(v: serde_json::Value) -> serde_json::Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn obs<'a>(
        severity: Severity,
        details: &'a serde_json::Map<String, Value>,
    ) -> MinimalObservation<'a> {
        MinimalObservation {
            source: "trivy",
            category: Category::Security,
            severity,
            details,
        }
    }

    fn rule(field: &str, operator: RuleOperator, value: serde_json::Value) -> FilterRule {
        FilterRule {
            field: field.to_string(),
            operator,
            value,
        }
    }

    // --- severity floor ---

    #[test]
    fn below_floor_dropped_with_severity_reason() {
        let cfg = FilterConfig {
            min_severity: Some(Severity::High),
            ..FilterConfig::default()
        };
        let d = details(json!({}));
        let decision = decide(&cfg, &obs(Severity::Low, &d));
        assert_eq!(
            decision,
            FilterDecision::Drop {
                reason: "severity_filter".to_string()
            }
        );
    }

    #[test]
    fn at_floor_allowed() {
        let cfg = FilterConfig {
            min_severity: Some(Severity::High),
            ..FilterConfig::default()
        };
        let d = details(json!({}));
        assert!(decide(&cfg, &obs(Severity::High, &d)).is_allowed());
        assert!(decide(&cfg, &obs(Severity::Critical, &d)).is_allowed());
    }

    #[test]
    fn disabled_filter_admits_below_floor() {
        let cfg = FilterConfig {
            enabled: false,
            min_severity: Some(Severity::Critical),
            ..FilterConfig::default()
        };
        let d = details(json!({}));
        assert!(decide(&cfg, &obs(Severity::Info, &d)).is_allowed());
    }

    // --- field rules ---

    #[test]
    fn equals_rule() {
        let cfg = FilterConfig {
            rules: vec![rule("kind", RuleOperator::Equals, json!("Pod"))],
            ..FilterConfig::default()
        };
        let d = details(json!({"kind": "Pod"}));
        assert!(decide(&cfg, &obs(Severity::Medium, &d)).is_allowed());

        let d = details(json!({"kind": "Deployment"}));
        assert_eq!(
            decide(&cfg, &obs(Severity::Medium, &d)),
            FilterDecision::Drop {
                reason: "rule_kind_equals".to_string()
            }
        );
    }

    #[test]
    fn equals_tolerates_string_number_mismatch() {
        let cfg = FilterConfig {
            rules: vec![rule("code", RuleOperator::Equals, json!(403))],
            ..FilterConfig::default()
        };
        let d = details(json!({"code": "403"}));
        assert!(decide(&cfg, &obs(Severity::Medium, &d)).is_allowed());
    }

    #[test]
    fn in_and_not_in_rules() {
        let cfg = FilterConfig {
            rules: vec![rule("ns", RuleOperator::In, json!(["prod", "staging"]))],
            ..FilterConfig::default()
        };
        let d = details(json!({"ns": "prod"}));
        assert!(decide(&cfg, &obs(Severity::Medium, &d)).is_allowed());
        let d = details(json!({"ns": "dev"}));
        assert!(!decide(&cfg, &obs(Severity::Medium, &d)).is_allowed());

        let cfg = FilterConfig {
            rules: vec![rule("ns", RuleOperator::NotIn, json!(["kube-system"]))],
            ..FilterConfig::default()
        };
        let d = details(json!({"ns": "prod"}));
        assert!(decide(&cfg, &obs(Severity::Medium, &d)).is_allowed());
        let d = details(json!({"ns": "kube-system"}));
        assert!(!decide(&cfg, &obs(Severity::Medium, &d)).is_allowed());
    }

    #[test]
    fn not_in_allows_missing_field() {
        let cfg = FilterConfig {
            rules: vec![rule("ns", RuleOperator::NotIn, json!(["kube-system"]))],
            ..FilterConfig::default()
        };
        let d = details(json!({}));
        assert!(decide(&cfg, &obs(Severity::Medium, &d)).is_allowed());
    }

    #[test]
    fn numeric_comparisons() {
        let cfg = FilterConfig {
            rules: vec![rule("score", RuleOperator::Gte, json!(7.0))],
            ..FilterConfig::default()
        };
        let d = details(json!({"score": 7.5}));
        assert!(decide(&cfg, &obs(Severity::Medium, &d)).is_allowed());
        let d = details(json!({"score": "8"}));
        assert!(decide(&cfg, &obs(Severity::Medium, &d)).is_allowed());
        let d = details(json!({"score": 6.9}));
        assert!(!decide(&cfg, &obs(Severity::Medium, &d)).is_allowed());
        // Non-numeric actual fails the comparison.
        let d = details(json!({"score": "n/a"}));
        assert!(!decide(&cfg, &obs(Severity::Medium, &d)).is_allowed());
    }

    #[test]
    fn missing_field_fails_positive_rules() {
        let cfg = FilterConfig {
            rules: vec![rule("kind", RuleOperator::Equals, json!("Pod"))],
            ..FilterConfig::default()
        };
        let d = details(json!({}));
        assert_eq!(
            decide(&cfg, &obs(Severity::Medium, &d)),
            FilterDecision::Drop {
                reason: "rule_kind_equals".to_string()
            }
        );
    }

    #[test]
    fn first_failing_rule_names_the_reason() {
        let cfg = FilterConfig {
            rules: vec![
                rule("a", RuleOperator::Equals, json!(1)),
                rule("b", RuleOperator::Equals, json!(2)),
            ],
            ..FilterConfig::default()
        };
        let d = details(json!({"a": 1, "b": 3}));
        assert_eq!(
            decide(&cfg, &obs(Severity::Medium, &d)),
            FilterDecision::Drop {
                reason: "rule_b_equals".to_string()
            }
        );
    }

    #[test]
    fn dotted_path_rule() {
        let cfg = FilterConfig {
            rules: vec![rule("output.fields.proc", RuleOperator::Equals, json!("bash"))],
            ..FilterConfig::default()
        };
        let d = details(json!({"output": {"fields": {"proc": "bash"}}}));
        assert!(decide(&cfg, &obs(Severity::Medium, &d)).is_allowed());
    }

    // --- overrides ---

    #[test]
    fn override_takes_precedence() {
        let filter = Filter::new();
        let declared = FilterConfig::default();
        let d = details(json!({}));

        assert!(filter.decide(&declared, &obs(Severity::Info, &d)).is_allowed());

        let mut overrides = HashMap::new();
        overrides.insert(
            "trivy".to_string(),
            FilterConfig {
                min_severity: Some(Severity::High),
                ..FilterConfig::default()
            },
        );
        filter.replace_overrides(overrides);

        assert!(!filter.decide(&declared, &obs(Severity::Info, &d)).is_allowed());
        assert_eq!(filter.override_count(), 1);
    }
}
