//! The processing core: allowlist, dedup, filter, normalizer, hooks,
//! threshold monitor, pipeline, and batch scheduling. No Kubernetes client
//! in here — persistence goes through the [`pipeline::ObservationSink`] seam.

pub mod allowlist;
pub mod batch;
pub mod dedup;
pub mod filter;
pub mod hooks;
pub mod metrics;
pub mod normalize;
pub mod pipeline;
pub mod threshold;

pub use allowlist::{Allowlist, AllowlistConfig, GvrTarget};
pub use dedup::{DedupDecision, DedupEngine};
pub use filter::{Filter, FilterDecision, MinimalObservation};
pub use hooks::{HookRegistry, PendingObservation};
pub use metrics::Metrics;
pub use pipeline::{ObservationSink, OrderAdvisor, Pipeline, PipelineOutcome, WriteOutcome};
pub use threshold::ThresholdMonitor;
