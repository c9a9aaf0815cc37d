//! Write-target policy gate. A single predicate over `{GVR, namespace}`
//! consulted by the writer before any create call.
//!
//! Deny rules always win. A fixed set of privilege-escalation targets is
//! denied no matter what the configuration says: Secrets, RBAC bindings and
//! roles, admission-webhook configurations, and CRDs.

use zen_common::{GvrSpec, WriteDenied};

/// The target of a prospective write, resolved by the writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GvrTarget {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GvrTarget {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }
}

impl From<&GvrSpec> for GvrTarget {
    fn from(g: &GvrSpec) -> Self {
        GvrTarget::new(&g.group, &g.version, &g.resource)
    }
}

/// `{group, resource}` match entry. Versions are irrelevant to policy.
#[derive(Clone, Debug, PartialEq, Eq)]
struct GvrPattern {
    group: String,
    resource: String,
}

impl GvrPattern {
    fn matches(&self, target: &GvrTarget) -> bool {
        self.group.eq_ignore_ascii_case(&target.group)
            && self.resource.eq_ignore_ascii_case(&target.resource)
    }
}

/// Targets denied regardless of configuration.
const MANDATORY_DENIALS: &[(&str, &str)] = &[
    ("", "secrets"),
    ("rbac.authorization.k8s.io", "roles"),
    ("rbac.authorization.k8s.io", "rolebindings"),
    ("rbac.authorization.k8s.io", "clusterroles"),
    ("rbac.authorization.k8s.io", "clusterrolebindings"),
    ("admissionregistration.k8s.io", "validatingwebhookconfigurations"),
    ("admissionregistration.k8s.io", "mutatingwebhookconfigurations"),
    ("apiextensions.k8s.io", "customresourcedefinitions"),
];

#[derive(Clone, Debug, Default)]
pub struct AllowlistConfig {
    pub allowed_gvrs: Vec<GvrSpec>,
    pub denied_gvrs: Vec<GvrSpec>,
    /// Empty = any namespace permitted, subject to `watch_namespace`.
    pub allowed_namespaces: Vec<String>,
    pub allow_cluster_scoped: bool,
    pub watch_namespace: Option<String>,
}

pub struct Allowlist {
    allowed: Vec<GvrPattern>,
    denied: Vec<GvrPattern>,
    allowed_namespaces: Vec<String>,
    allow_cluster_scoped: bool,
    watch_namespace: Option<String>,
}

impl Allowlist {
    pub fn new(cfg: AllowlistConfig) -> Self {
        let mut denied: Vec<GvrPattern> = MANDATORY_DENIALS
            .iter()
            .map(|(g, r)| GvrPattern {
                group: (*g).to_string(),
                resource: (*r).to_string(),
            })
            .collect();
        denied.extend(cfg.denied_gvrs.iter().map(|g| GvrPattern {
            group: g.group.clone(),
            resource: g.resource.clone(),
        }));

        Self {
            allowed: cfg
                .allowed_gvrs
                .iter()
                .map(|g| GvrPattern {
                    group: g.group.clone(),
                    resource: g.resource.clone(),
                })
                .collect(),
            denied,
            allowed_namespaces: cfg.allowed_namespaces,
            allow_cluster_scoped: cfg.allow_cluster_scoped,
            watch_namespace: cfg.watch_namespace,
        }
    }

    /// Decide whether `target` in `namespace` is a permitted write target.
    /// `namespace = None` means a cluster-scoped write.
    pub fn allows(&self, target: &GvrTarget, namespace: Option<&str>) -> Result<(), WriteDenied> {
        if self.denied.iter().any(|p| p.matches(target)) {
            return Err(WriteDenied::GvrDenied);
        }
        if !self.allowed.iter().any(|p| p.matches(target)) {
            return Err(WriteDenied::GvrNotAllowed);
        }

        match namespace {
            None => {
                if !self.allow_cluster_scoped {
                    return Err(WriteDenied::ClusterScopedNotAllowed);
                }
            }
            Some(ns) => {
                if let Some(watch) = &self.watch_namespace {
                    if watch != ns {
                        return Err(WriteDenied::NamespaceNotAllowed);
                    }
                }
                if !self.allowed_namespaces.is_empty()
                    && !self.allowed_namespaces.iter().any(|a| a == ns)
                {
                    return Err(WriteDenied::NamespaceNotAllowed);
                }
            }
        }

        Ok(())
    }
}
