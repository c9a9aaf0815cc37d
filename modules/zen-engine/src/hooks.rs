//! Compile-time-registered, in-process hooks applied to an observation after
//! normalization and before the write. A hook that errors aborts its event;
//! nothing is retried. Hooks must be idempotent and must not perform I/O.

use std::collections::BTreeMap;

use zen_api::ObservationSpec;
use zen_common::{Destination, ZenError};

/// The fully decided observation on its way to the sink. Hooks may mutate
/// labels, annotations, and details; mutating identity fields (source,
/// severity, category) is undefined behavior.
#[derive(Clone, Debug)]
pub struct PendingObservation {
    pub namespace: String,
    pub spec: ObservationSpec,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub destinations: Vec<Destination>,
}

type HookFn = Box<dyn Fn(&mut PendingObservation) -> Result<(), String> + Send + Sync>;

#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<(String, HookFn)>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        hook: impl Fn(&mut PendingObservation) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.hooks.push((name.into(), Box::new(hook)));
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook in registration order. The first failure wins and the
    /// event is dropped by the caller.
    pub fn run(&self, pending: &mut PendingObservation) -> Result<(), ZenError> {
        for (name, hook) in &self.hooks {
            hook(pending).map_err(|message| ZenError::Hook {
                hook: name.clone(),
                message,
            })?;
        }
        Ok(())
    }
}
