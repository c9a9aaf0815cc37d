use thiserror::Error;

/// Why the allowlist refused a write target.
///
/// Deny rules always win over allow rules; the reason string is stable and
/// used as a metric label.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteDenied {
    #[error("target GVR is not in the allowed set")]
    GvrNotAllowed,

    #[error("target GVR is explicitly denied")]
    GvrDenied,

    #[error("target namespace is not in the allowed set")]
    NamespaceNotAllowed,

    #[error("cluster-scoped writes are not enabled")]
    ClusterScopedNotAllowed,
}

impl WriteDenied {
    /// Stable snake_case reason for metric labels and status messages.
    pub fn reason(&self) -> &'static str {
        match self {
            WriteDenied::GvrNotAllowed => "gvr_not_allowed",
            WriteDenied::GvrDenied => "gvr_denied",
            WriteDenied::NamespaceNotAllowed => "namespace_not_allowed",
            WriteDenied::ClusterScopedNotAllowed => "cluster_scoped_not_allowed",
        }
    }
}

/// Classification of a terminal API-server write failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorKind {
    NotFound,
    Forbidden,
    Conflict,
    Transient,
    Other,
}

impl WriteErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteErrorKind::NotFound => "not_found",
            WriteErrorKind::Forbidden => "forbidden",
            WriteErrorKind::Conflict => "conflict",
            WriteErrorKind::Transient => "transient",
            WriteErrorKind::Other => "other",
        }
    }
}

#[derive(Error, Debug)]
pub enum ZenError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("filter error for source {source_name}: {message}")]
    Filter { source_name: String, message: String },

    #[error("dedup error for source {source_name}: {message}")]
    Dedup { source_name: String, message: String },

    #[error("normalization error for source {source_name}: {message}")]
    Normalize { source_name: String, message: String },

    #[error("hook {hook} rejected event: {message}")]
    Hook { hook: String, message: String },

    #[error("write denied: {0}")]
    WriteDenied(#[from] WriteDenied),

    #[error("write failed ({}): {message}", kind.as_str())]
    Write { kind: WriteErrorKind, message: String },

    #[error("adapter {kind} for source {source_name}: {message}")]
    Adapter {
        kind: String,
        source_name: String,
        message: String,
    },

    #[error("pipeline error for source {source_name}: {message}")]
    Pipeline { source_name: String, message: String },

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl ZenError {
    /// Metric-label category for this error.
    pub fn category(&self) -> &'static str {
        match self {
            ZenError::Config(_) => "config",
            ZenError::Filter { .. } => "filter",
            ZenError::Dedup { .. } => "dedup",
            ZenError::Normalize { .. } => "normalize",
            ZenError::Hook { .. } => "hook",
            ZenError::WriteDenied(_) | ZenError::Write { .. } => "write",
            ZenError::Adapter { .. } => "adapter",
            ZenError::Pipeline { .. } => "pipeline",
            ZenError::Anyhow(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_reasons_are_snake_case() {
        assert_eq!(WriteDenied::GvrDenied.reason(), "gvr_denied");
        assert_eq!(
            WriteDenied::ClusterScopedNotAllowed.reason(),
            "cluster_scoped_not_allowed"
        );
    }

    #[test]
    fn write_error_kinds_label() {
        assert_eq!(WriteErrorKind::Transient.as_str(), "transient");
        assert_eq!(WriteErrorKind::NotFound.as_str(), "not_found");
    }

    #[test]
    fn error_categories() {
        let e = ZenError::Adapter {
            kind: "webhook".into(),
            source_name: "falco".into(),
            message: "missing secret".into(),
        };
        assert_eq!(e.category(), "adapter");
        assert_eq!(ZenError::WriteDenied(WriteDenied::GvrDenied).category(), "write");
    }
}
