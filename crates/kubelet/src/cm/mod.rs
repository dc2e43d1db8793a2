//! `cm` is the seam to the pod-level cgroup envelope that in-place resize brackets container
//! updates with, plus the conversions between resource quantities and cgroup values.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::pod::Pod;
use crate::resources::ResizeKind;
use crate::runtime::fake::Journal;

/// Shares per CPU.
pub const SHARES_PER_CPU: i64 = 1024;
/// Millicores per CPU.
pub const MILLI_CPU_TO_CPU: i64 = 1000;
/// Smallest shares value the kernel accepts.
pub const MIN_SHARES: i64 = 2;
/// CFS period in microseconds.
pub const QUOTA_PERIOD: i64 = 100_000;
/// Smallest CFS quota the kernel accepts.
pub const MIN_QUOTA_PERIOD: i64 = 1000;
/// Envelope value meaning "no limit".
pub const UNLIMITED: i64 = -1;

/// Converts millicores to CPU shares.
pub fn milli_cpu_to_shares(milli_cpu: i64) -> i64 {
    if milli_cpu == 0 {
        // Docker converts zero to the default of 1024, so the minimum is used instead.
        return MIN_SHARES;
    }
    let shares = (milli_cpu * SHARES_PER_CPU) / MILLI_CPU_TO_CPU;
    shares.max(MIN_SHARES)
}

/// Converts millicores to a CFS quota for the given period. Zero millicores means no quota.
pub fn milli_cpu_to_quota(milli_cpu: i64, period: i64) -> i64 {
    if milli_cpu == 0 {
        return 0;
    }
    let quota = (milli_cpu * period) / MILLI_CPU_TO_CPU;
    quota.max(MIN_QUOTA_PERIOD)
}

/// Converts CPU shares back to millicores, rounding up.
pub fn shares_to_milli_cpu(shares: i64) -> i64 {
    if shares < MIN_SHARES {
        return 0;
    }
    div_ceil(shares * MILLI_CPU_TO_CPU, SHARES_PER_CPU)
}

/// Converts a CFS quota back to millicores, rounding up. An unlimited quota stays unlimited.
pub fn quota_to_milli_cpu(quota: i64, period: i64) -> i64 {
    if quota <= 0 || period <= 0 {
        return UNLIMITED;
    }
    div_ceil(quota * MILLI_CPU_TO_CPU, period)
}

fn div_ceil(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

/// Maps an envelope value onto an ordering where "unlimited" exceeds every finite value.
pub fn comparable(value: i64) -> i64 {
    if value < 0 {
        i64::MAX
    } else {
        value
    }
}

/// The cgroup envelope a pod should have, derived from its spec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PodResourceConfig {
    /// CPU shares from the summed requests.
    pub cpu_shares: i64,
    /// CFS quota from the summed limits, [`UNLIMITED`] unless every container declares one.
    pub cpu_quota: i64,
    /// CFS period.
    pub cpu_period: i64,
    /// Memory limit from the summed limits, [`UNLIMITED`] unless every container declares one.
    pub memory_limit: i64,
}

impl PodResourceConfig {
    /// The envelope value for one resize kind.
    pub fn value(&self, kind: ResizeKind) -> i64 {
        match kind {
            ResizeKind::MemoryLimit => self.memory_limit,
            ResizeKind::CpuLimit => self.cpu_quota,
            ResizeKind::CpuRequest => self.cpu_shares,
        }
    }
}

/// Derives the pod envelope. Regular containers are summed; an init container larger than
/// that sum raises it, since init containers run one at a time.
pub fn pod_resource_config(pod: &Pod) -> PodResourceConfig {
    let mut cpu_requests = 0;
    let mut cpu_limits = 0;
    let mut memory_limits = 0;
    let mut cpu_limits_declared = true;
    let mut memory_limits_declared = true;

    for c in &pod.spec.containers {
        cpu_requests += c.resources.cpu_request_milli().unwrap_or(0);
        match c.resources.cpu_limit_milli() {
            Some(l) => cpu_limits += l,
            None => cpu_limits_declared = false,
        }
        match c.resources.memory_limit_bytes() {
            Some(l) => memory_limits += l,
            None => memory_limits_declared = false,
        }
    }
    for c in &pod.spec.init_containers {
        cpu_requests = cpu_requests.max(c.resources.cpu_request_milli().unwrap_or(0));
        if let Some(l) = c.resources.cpu_limit_milli() {
            cpu_limits = cpu_limits.max(l);
        }
        if let Some(l) = c.resources.memory_limit_bytes() {
            memory_limits = memory_limits.max(l);
        }
    }

    PodResourceConfig {
        cpu_shares: milli_cpu_to_shares(cpu_requests),
        cpu_quota: if cpu_limits_declared && !pod.spec.containers.is_empty() {
            milli_cpu_to_quota(cpu_limits, QUOTA_PERIOD)
        } else {
            UNLIMITED
        },
        cpu_period: QUOTA_PERIOD,
        memory_limit: if memory_limits_declared && !pod.spec.containers.is_empty() {
            memory_limits
        } else {
            UNLIMITED
        },
    }
}

/// Reads and writes the cgroup envelope of a pod.
#[async_trait::async_trait]
pub trait PodContainerManager: Send + Sync {
    /// The current envelope value of a pod for one resize kind.
    async fn get_pod_cgroup_config(&self, pod: &Pod, kind: ResizeKind) -> anyhow::Result<i64>;
    /// Writes the envelope value of a pod for one resize kind.
    async fn set_pod_cgroup_config(
        &self,
        pod: &Pod,
        kind: ResizeKind,
        value: i64,
    ) -> anyhow::Result<()>;
    /// Current memory usage of the pod in bytes.
    async fn get_pod_cgroup_mem_usage(&self, pod: &Pod) -> anyhow::Result<i64>;
}

#[derive(Default)]
struct CgroupState {
    configs: HashMap<(String, ResizeKind), i64>,
    usage: HashMap<String, i64>,
    fail_set: Option<ResizeKind>,
}

/// A pod container manager holding envelopes in memory. Unknown pods are an error.
#[derive(Default)]
pub struct InMemoryPodContainerManager {
    state: Mutex<CgroupState>,
    journal: Journal,
}

impl InMemoryPodContainerManager {
    /// A manager recording writes into the given journal.
    pub fn with_journal(journal: Journal) -> Self {
        InMemoryPodContainerManager {
            state: Mutex::new(CgroupState::default()),
            journal,
        }
    }

    /// Seeds the envelope of a pod from its spec, as cgroup creation would.
    pub async fn create_pod_cgroup(&self, pod: &Pod) {
        let config = pod_resource_config(pod);
        let mut state = self.state.lock().await;
        for kind in [
            ResizeKind::MemoryLimit,
            ResizeKind::CpuLimit,
            ResizeKind::CpuRequest,
        ] {
            state
                .configs
                .insert((pod.pod_uid().to_owned(), kind), config.value(kind));
        }
    }

    /// Sets one envelope value directly.
    pub async fn set_config(&self, pod_uid: &str, kind: ResizeKind, value: i64) {
        self.state
            .lock()
            .await
            .configs
            .insert((pod_uid.to_owned(), kind), value);
    }

    /// Sets the reported memory usage of a pod.
    pub async fn set_mem_usage(&self, pod_uid: &str, bytes: i64) {
        self.state
            .lock()
            .await
            .usage
            .insert(pod_uid.to_owned(), bytes);
    }

    /// Makes writes of one kind fail.
    pub async fn fail_set(&self, kind: Option<ResizeKind>) {
        self.state.lock().await.fail_set = kind;
    }

    /// Writes seen so far, in order.
    pub async fn calls(&self) -> Vec<String> {
        self.journal.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl PodContainerManager for InMemoryPodContainerManager {
    async fn get_pod_cgroup_config(&self, pod: &Pod, kind: ResizeKind) -> anyhow::Result<i64> {
        self.state
            .lock()
            .await
            .configs
            .get(&(pod.pod_uid().to_owned(), kind))
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no cgroup for pod {}", pod.pod_uid()))
    }

    async fn set_pod_cgroup_config(
        &self,
        pod: &Pod,
        kind: ResizeKind,
        value: i64,
    ) -> anyhow::Result<()> {
        self.journal
            .lock()
            .await
            .push(format!("SetPodCgroup {} {} {}", pod.pod_uid(), kind, value));
        let mut state = self.state.lock().await;
        if state.fail_set == Some(kind) {
            anyhow::bail!("unable to write {} of pod {}", kind, pod.pod_uid());
        }
        state
            .configs
            .insert((pod.pod_uid().to_owned(), kind), value);
        Ok(())
    }

    async fn get_pod_cgroup_mem_usage(&self, pod: &Pod) -> anyhow::Result<i64> {
        Ok(self
            .state
            .lock()
            .await
            .usage
            .get(pod.pod_uid())
            .copied()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::container::Container;
    use crate::pod::{ObjectMeta, PodSpec};
    use crate::resources::{Quantity, ResourceRequirements, CPU, MEMORY};

    fn container(name: &str, cpu_req: &str, cpu_lim: Option<&str>, mem_lim: Option<&str>) -> Container {
        let mut resources = ResourceRequirements::default();
        resources
            .requests
            .insert(CPU.to_owned(), Quantity::from(cpu_req));
        if let Some(l) = cpu_lim {
            resources.limits.insert(CPU.to_owned(), Quantity::from(l));
        }
        if let Some(l) = mem_lim {
            resources.limits.insert(MEMORY.to_owned(), Quantity::from(l));
        }
        Container {
            name: name.to_owned(),
            image: "busybox".to_owned(),
            resources,
            ..Default::default()
        }
    }

    fn pod(containers: Vec<Container>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: "p".to_owned(),
                uid: "u".to_owned(),
                ..Default::default()
            },
            spec: PodSpec {
                containers,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_cpu_conversions() {
        assert_eq!(milli_cpu_to_shares(0), 2);
        assert_eq!(milli_cpu_to_shares(1), 2);
        assert_eq!(milli_cpu_to_shares(100), 102);
        assert_eq!(milli_cpu_to_shares(1000), 1024);
        assert_eq!(milli_cpu_to_quota(0, QUOTA_PERIOD), 0);
        assert_eq!(milli_cpu_to_quota(5, QUOTA_PERIOD), 1000);
        assert_eq!(milli_cpu_to_quota(500, QUOTA_PERIOD), 50_000);
        assert_eq!(shares_to_milli_cpu(102), 100);
        assert_eq!(shares_to_milli_cpu(1024), 1000);
        assert_eq!(shares_to_milli_cpu(0), 0);
        assert_eq!(quota_to_milli_cpu(50_000, QUOTA_PERIOD), 500);
        assert_eq!(quota_to_milli_cpu(-1, QUOTA_PERIOD), UNLIMITED);
    }

    #[test]
    fn test_unlimited_compares_highest() {
        assert!(comparable(UNLIMITED) > comparable(1 << 40));
        assert_eq!(comparable(5), 5);
    }

    #[test]
    fn test_pod_resource_config_sums_containers() {
        let config = pod_resource_config(&pod(vec![
            container("a", "100m", Some("200m"), Some("128Mi")),
            container("b", "300m", Some("1"), Some("64Mi")),
        ]));
        assert_eq!(config.cpu_shares, milli_cpu_to_shares(400));
        assert_eq!(config.cpu_quota, 120_000);
        assert_eq!(config.memory_limit, 192 * 1024 * 1024);
        assert_eq!(config.value(ResizeKind::CpuRequest), config.cpu_shares);
    }

    #[test]
    fn test_pod_resource_config_missing_limit_is_unlimited() {
        let config = pod_resource_config(&pod(vec![
            container("a", "100m", Some("200m"), None),
            container("b", "300m", None, Some("64Mi")),
        ]));
        assert_eq!(config.cpu_quota, UNLIMITED);
        assert_eq!(config.memory_limit, UNLIMITED);
    }

    #[tokio::test]
    async fn test_in_memory_manager() {
        let manager = InMemoryPodContainerManager::default();
        let p = pod(vec![container("a", "100m", Some("200m"), Some("128Mi"))]);
        assert!(manager
            .get_pod_cgroup_config(&p, ResizeKind::CpuLimit)
            .await
            .is_err());
        manager.create_pod_cgroup(&p).await;
        assert_eq!(
            manager
                .get_pod_cgroup_config(&p, ResizeKind::CpuLimit)
                .await
                .unwrap(),
            20_000
        );
        manager
            .set_pod_cgroup_config(&p, ResizeKind::CpuLimit, 30_000)
            .await
            .unwrap();
        manager.fail_set(Some(ResizeKind::MemoryLimit)).await;
        assert!(manager
            .set_pod_cgroup_config(&p, ResizeKind::MemoryLimit, 1)
            .await
            .is_err());
        assert_eq!(manager.calls().await.len(), 2);
        manager.set_mem_usage("u", 42).await;
        assert_eq!(manager.get_pod_cgroup_mem_usage(&p).await.unwrap(), 42);
    }
}
