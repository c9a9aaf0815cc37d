//! CRD surface: the `Observation` produced by the pipeline and the
//! user-authored `Ingester` that declares sources.

pub mod ingester;
pub mod observation;

pub use ingester::{
    ready_condition, Condition, Ingester, IngesterSpec, IngesterStatus, SourceSpec, SourceState,
    SourceStatus,
};
pub use observation::{Observation, ObservationSpec, ObservationStatus, ResourceRef};

/// API group for all Zen Watcher CRDs.
pub const GROUP: &str = "zen.io";
/// API version for all Zen Watcher CRDs.
pub const VERSION: &str = "v1alpha1";
