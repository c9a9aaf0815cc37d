use std::env;
use std::time::Duration;

use crate::types::GvrSpec;

/// Process configuration loaded from environment variables.
///
/// Everything has a default; a misconfigured value fails fast at startup
/// rather than surfacing later as a half-working controller.
#[derive(Debug, Clone)]
pub struct Config {
    /// Restrict GC and some watches to a single namespace. None = cluster-wide.
    pub watch_namespace: Option<String>,

    /// Namespaces the writer may target. Empty = any namespace (subject to
    /// `watch_namespace`).
    pub allowed_namespaces: Vec<String>,

    /// GVRs the writer may target, beyond the built-in Observation CRD.
    pub allowed_gvrs: Vec<GvrSpec>,

    /// Opt-in for cluster-scoped write targets.
    pub allow_cluster_scoped: bool,

    /// Default Observation TTL in days when the spec carries none.
    pub observation_ttl_days: u32,

    pub gc_interval: Duration,
    pub gc_timeout: Duration,

    /// Webhook request body cap in bytes.
    pub server_max_request_bytes: usize,

    pub server_host: String,
    pub server_port: u16,

    /// Process-wide dedup cache entry cap.
    pub dedup_max_entries: usize,

    /// Name of the well-known filter ConfigMap (watched in `watch_namespace`
    /// or `zen-system`).
    pub filter_configmap: String,

    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables. Panics with a clear
    /// message on unparsable values.
    pub fn from_env() -> Self {
        Self {
            watch_namespace: env::var("WATCH_NAMESPACE").ok().filter(|s| !s.is_empty()),
            allowed_namespaces: comma_list("ALLOWED_NAMESPACES"),
            allowed_gvrs: comma_list("ALLOWED_GVRS")
                .iter()
                .map(|s| {
                    GvrSpec::parse(s)
                        .unwrap_or_else(|| panic!("ALLOWED_GVRS entry {s:?} is not group/version/resource"))
                })
                .collect(),
            allow_cluster_scoped: env::var("ALLOW_CLUSTER_SCOPED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            observation_ttl_days: parsed_env("OBSERVATION_TTL_DAYS", 7),
            gc_interval: duration_env("GC_INTERVAL", Duration::from_secs(3600)),
            gc_timeout: duration_env("GC_TIMEOUT", Duration::from_secs(300)),
            server_max_request_bytes: parsed_env("SERVER_MAX_REQUEST_BYTES", 1_048_576),
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: parsed_env("SERVER_PORT", 8080),
            dedup_max_entries: parsed_env("DEDUP_MAX_ENTRIES", 10_000),
            filter_configmap: env::var("FILTER_CONFIGMAP")
                .unwrap_or_else(|_| "zen-watcher-filters".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
        }
    }

    /// Namespace in which the filter ConfigMap lives.
    pub fn filter_configmap_namespace(&self) -> String {
        self.watch_namespace
            .clone()
            .unwrap_or_else(|| "zen-system".to_string())
    }

    /// Log the effective configuration at startup.
    pub fn log_startup(&self) {
        tracing::info!(
            watch_namespace = self.watch_namespace.as_deref().unwrap_or("(all)"),
            allowed_namespaces = self.allowed_namespaces.len(),
            allowed_gvrs = self.allowed_gvrs.len(),
            allow_cluster_scoped = self.allow_cluster_scoped,
            observation_ttl_days = self.observation_ttl_days,
            gc_interval = %humantime::format_duration(self.gc_interval),
            gc_timeout = %humantime::format_duration(self.gc_timeout),
            server_max_request_bytes = self.server_max_request_bytes,
            dedup_max_entries = self.dedup_max_entries,
            "Effective configuration"
        );
    }
}

fn comma_list(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a valid number, got {v:?}")),
        Err(_) => default,
    }
}

fn duration_env(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(v) => humantime::parse_duration(&v)
            .unwrap_or_else(|_| panic!("{key} must be a duration string like 1h or 5m, got {v:?}")),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them to pure helpers where
    // possible and serialize the rest by testing distinct keys.

    #[test]
    fn comma_list_trims_and_drops_empty() {
        env::set_var("ZEN_TEST_LIST", " a , b ,, c ");
        assert_eq!(comma_list("ZEN_TEST_LIST"), vec!["a", "b", "c"]);
        env::remove_var("ZEN_TEST_LIST");
        assert!(comma_list("ZEN_TEST_LIST").is_empty());
    }

    #[test]
    fn parsed_env_defaults_when_unset() {
        assert_eq!(parsed_env("ZEN_TEST_UNSET_NUM", 42u32), 42);
    }

    #[test]
    fn duration_env_parses_humantime() {
        env::set_var("ZEN_TEST_DUR", "90s");
        assert_eq!(
            duration_env("ZEN_TEST_DUR", Duration::from_secs(1)),
            Duration::from_secs(90)
        );
        env::remove_var("ZEN_TEST_DUR");
        assert_eq!(
            duration_env("ZEN_TEST_DUR", Duration::from_secs(7)),
            Duration::from_secs(7)
        );
    }
}
