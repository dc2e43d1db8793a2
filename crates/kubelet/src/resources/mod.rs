//! `resources` contains the resource model shared by pods, containers and the cgroup manager.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub(crate) mod quantity;

pub use quantity::Quantity;

/// Resource name for CPU.
pub const CPU: &str = "cpu";
/// Resource name for memory.
pub const MEMORY: &str = "memory";

/// A set of named resource quantities.
pub type ResourceList = BTreeMap<String, Quantity>;

/// Compute resource requests and limits for a container or VM.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// Maximum amount of compute resources allowed.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: ResourceList,
    /// Minimum amount of compute resources required.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: ResourceList,
}

impl ResourceRequirements {
    /// The CPU request in millicores, if one is set and parses.
    pub fn cpu_request_milli(&self) -> Option<i64> {
        self.requests.get(CPU).and_then(|q| q.milli_value().ok())
    }

    /// The CPU limit in millicores, if one is set and parses.
    pub fn cpu_limit_milli(&self) -> Option<i64> {
        self.limits.get(CPU).and_then(|q| q.milli_value().ok())
    }

    /// The memory limit in bytes, if one is set and parses.
    pub fn memory_limit_bytes(&self) -> Option<i64> {
        self.limits.get(MEMORY).and_then(|q| q.value().ok())
    }

    /// The memory request in bytes, if one is set and parses.
    pub fn memory_request_bytes(&self) -> Option<i64> {
        self.requests.get(MEMORY).and_then(|q| q.value().ok())
    }

    /// Compares both lists by numeric value rather than by spelling, so `"1"` equals `"1000m"`.
    pub fn semantic_eq(&self, other: &ResourceRequirements) -> bool {
        lists_semantic_eq(&self.limits, &other.limits)
            && lists_semantic_eq(&self.requests, &other.requests)
    }
}

/// The resource dimensions that can be resized in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResizeKind {
    /// The memory limit.
    MemoryLimit,
    /// The CPU limit, applied as a CFS quota.
    CpuLimit,
    /// The CPU request, applied as CPU shares.
    CpuRequest,
}

impl ResizeKind {
    /// The resource name the kind belongs to.
    pub fn resource_name(&self) -> &'static str {
        match self {
            ResizeKind::MemoryLimit => MEMORY,
            ResizeKind::CpuLimit | ResizeKind::CpuRequest => CPU,
        }
    }
}

impl std::fmt::Display for ResizeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResizeKind::MemoryLimit => "memory limit".fmt(f),
            ResizeKind::CpuLimit => "cpu limit".fmt(f),
            ResizeKind::CpuRequest => "cpu request".fmt(f),
        }
    }
}

/// Compares two resource lists by value. Quantities that fail to parse fall back to a string
/// comparison.
pub fn lists_semantic_eq(a: &ResourceList, b: &ResourceList) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(name, qa)| match b.get(name) {
        None => false,
        Some(qb) => match (qa.milli_value(), qb.milli_value()) {
            (Ok(x), Ok(y)) => x == y,
            _ => qa == qb,
        },
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn list(pairs: &[(&str, &str)]) -> ResourceList {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity::from(*v)))
            .collect()
    }

    #[test]
    fn semantic_equality_ignores_spelling() {
        let a = ResourceRequirements {
            limits: list(&[(CPU, "1"), (MEMORY, "1Gi")]),
            requests: list(&[(CPU, "500m")]),
        };
        let b = ResourceRequirements {
            limits: list(&[(CPU, "1000m"), (MEMORY, "1073741824")]),
            requests: list(&[(CPU, "0.5")]),
        };
        assert!(a.semantic_eq(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn semantic_equality_detects_missing_keys() {
        let a = ResourceRequirements {
            limits: list(&[(CPU, "1")]),
            ..Default::default()
        };
        let b = ResourceRequirements::default();
        assert!(!a.semantic_eq(&b));
    }

    #[test]
    fn accessors_parse_values() {
        let r = ResourceRequirements {
            limits: list(&[(CPU, "2"), (MEMORY, "256Mi")]),
            requests: list(&[(CPU, "250m"), (MEMORY, "128Mi")]),
        };
        assert_eq!(r.cpu_limit_milli(), Some(2000));
        assert_eq!(r.cpu_request_milli(), Some(250));
        assert_eq!(r.memory_limit_bytes(), Some(256 * 1024 * 1024));
        assert_eq!(r.memory_request_bytes(), Some(128 * 1024 * 1024));
    }
}
