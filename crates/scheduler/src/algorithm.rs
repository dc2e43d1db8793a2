//! Picking the cloud host a pod is scheduled onto.

use std::sync::atomic::{AtomicUsize, Ordering};

use kubelet::Pod;
use tracing::debug;

use crate::ScheduleError;

/// Where a pod goes and how many hosts were looked at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScheduleResult {
    /// The chosen host.
    pub suggested_host: String,
    /// Hosts evaluated.
    pub evaluated_nodes: usize,
    /// Hosts found feasible.
    pub feasible_nodes: usize,
}

/// Chooses a host for a pod.
#[async_trait::async_trait]
pub trait ScheduleAlgorithm: Send + Sync {
    /// Picks the host the pod is scheduled onto.
    async fn global_schedule(&self, pod: &Pod) -> Result<ScheduleResult, ScheduleError>;
}

/// Hands out the configured hosts in turn. Every host is considered feasible.
#[derive(Debug, Default)]
pub struct RoundRobin {
    hosts: Vec<String>,
    next: AtomicUsize,
}

impl RoundRobin {
    /// Rotates over the given hosts.
    pub fn new(hosts: Vec<String>) -> Self {
        RoundRobin {
            hosts,
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ScheduleAlgorithm for RoundRobin {
    async fn global_schedule(&self, pod: &Pod) -> Result<ScheduleResult, ScheduleError> {
        if self.hosts.is_empty() {
            return Err(ScheduleError::NoHostAvailable(pod.full_name()));
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        let host = self.hosts[idx].clone();
        debug!(pod = %pod.full_name(), %host, "selected host");
        Ok(ScheduleResult {
            suggested_host: host,
            evaluated_nodes: self.hosts.len(),
            feasible_nodes: self.hosts.len(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_round_robin() {
        let algorithm = RoundRobin::new(vec!["a".to_owned(), "b".to_owned()]);
        let pod = Pod::default();
        let hosts: Vec<String> = pick(&algorithm, &pod, 3).await;
        assert_eq!(hosts, vec!["a", "b", "a"]);
        let result = algorithm.global_schedule(&pod).await.unwrap();
        assert_eq!(result.evaluated_nodes, 2);
        assert_eq!(result.feasible_nodes, 2);
    }

    async fn pick(algorithm: &RoundRobin, pod: &Pod, n: usize) -> Vec<String> {
        let mut hosts = Vec::new();
        for _ in 0..n {
            hosts.push(algorithm.global_schedule(pod).await.unwrap().suggested_host);
        }
        hosts
    }

    #[tokio::test]
    async fn test_no_hosts() {
        let err = RoundRobin::default()
            .global_schedule(&Pod::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::NoHostAvailable(_)));
    }
}
