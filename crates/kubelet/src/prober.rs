//! Liveness probe results, written by probe workers and read by the action planner.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::container::ContainerId;

/// Outcome of the last probe of a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    /// The probe passed.
    Success,
    /// The probe failed past its threshold.
    Failure,
    /// Not probed yet.
    Unknown,
}

/// Latest probe result per container.
#[derive(Debug, Default)]
pub struct ResultsManager {
    results: RwLock<HashMap<ContainerId, ProbeResult>>,
}

impl ResultsManager {
    /// The cached result for a container, if any.
    pub fn get(&self, id: &ContainerId) -> Option<ProbeResult> {
        self.results
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
    }

    /// Caches a result.
    pub fn set(&self, id: ContainerId, result: ProbeResult) {
        self.results
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, result);
    }

    /// Drops the result of a container that is gone.
    pub fn remove(&self, id: &ContainerId) {
        self.results
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}
