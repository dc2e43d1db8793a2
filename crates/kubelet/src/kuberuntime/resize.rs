//! In-place resize of running containers and their pod cgroup.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::actions::{ContainerResources, ContainerToUpdateInfo, PodActions};
use super::container::linux_resources;
use super::result::{PodSyncResult, SyncAction, SyncError, SyncResult};
use super::RuntimeManager;
use crate::cm::{comparable, pod_resource_config, UNLIMITED};
use crate::events::{self, EventType, ObjectReference};
use crate::pod::Pod;
use crate::resources::{Quantity, ResizeKind, ResourceRequirements, CPU, MEMORY};
use crate::runtime::RuntimeEndpoint;

const RESIZE_ORDER: [ResizeKind; 3] = [
    ResizeKind::MemoryLimit,
    ResizeKind::CpuLimit,
    ResizeKind::CpuRequest,
];

fn to_requirements(r: &ContainerResources) -> ResourceRequirements {
    let mut out = ResourceRequirements::default();
    if r.cpu_limit > 0 {
        out.limits
            .insert(CPU.to_owned(), Quantity::from_milli_cpu(r.cpu_limit));
    }
    if r.memory_limit > 0 {
        out.limits
            .insert(MEMORY.to_owned(), Quantity::from_value(r.memory_limit));
    }
    if r.cpu_request > 0 {
        out.requests
            .insert(CPU.to_owned(), Quantity::from_milli_cpu(r.cpu_request));
    }
    if r.memory_request > 0 {
        out.requests
            .insert(MEMORY.to_owned(), Quantity::from_value(r.memory_request));
    }
    out
}

fn apply(kind: ResizeKind, base: ContainerResources, desired: &ContainerResources) -> ContainerResources {
    let mut r = base;
    match kind {
        ResizeKind::MemoryLimit => {
            r.memory_limit = desired.memory_limit;
            r.memory_request = desired.memory_request;
        }
        ResizeKind::CpuLimit => r.cpu_limit = desired.cpu_limit,
        ResizeKind::CpuRequest => r.cpu_request = desired.cpu_request,
    }
    r
}

impl RuntimeManager {
    async fn set_pod_cgroup(
        &self,
        pod: &Pod,
        kind: ResizeKind,
        value: i64,
        result: &mut PodSyncResult,
    ) -> Result<(), SyncError> {
        let mut r = SyncResult::new(SyncAction::UpdatePodCgroup, kind.to_string());
        let outcome = self
            .cgroups
            .set_pod_cgroup_config(pod, kind, value)
            .await
            .map_err(|e| {
                SyncError::UpdateContainerFailed(format!(
                    "failed to set {} of pod {} cgroup: {}",
                    kind,
                    pod.full_name(),
                    e
                ))
            });
        if let Err(e) = &outcome {
            r.fail(e.clone(), e.to_string());
        }
        result.add_sync_result(r);
        outcome
    }

    /// Writes one resource kind to each container in order. Values written earlier in the
    /// same sync are carried forward so that later kinds do not undo them.
    pub(crate) async fn update_pod_container_resources(
        &self,
        endpoint: &RuntimeEndpoint,
        kind: ResizeKind,
        containers: &[ContainerToUpdateInfo],
        written: &mut BTreeMap<String, ContainerResources>,
        result: &mut PodSyncResult,
    ) -> Result<(), SyncError> {
        for info in containers {
            let name = info.container.name.clone();
            let base = written.get(&name).copied().unwrap_or(info.current);
            let target = apply(kind, base, &info.desired);
            let mut r = SyncResult::new(SyncAction::UpdateContainerResources, name.clone());
            debug!(container = %name, %kind, ?target, "updating container resources");
            if let Err(e) = endpoint
                .service
                .update_container_resources(&info.kube_status.id.id, &linux_resources(&target))
                .await
            {
                let err = SyncError::UpdateContainerFailed(format!(
                    "failed to update {} of container {}: {}",
                    kind, name, e
                ));
                r.fail(err.clone(), err.to_string());
                result.add_sync_result(r);
                return Err(err);
            }
            result.add_sync_result(r);
            written.insert(name.clone(), target);
            result.resized_containers.insert(name, to_requirements(&target));
        }
        Ok(())
    }

    // Grows the pod envelope before the containers and shrinks it after, so the containers
    // always fit.
    async fn resize_kind(
        &self,
        endpoint: &RuntimeEndpoint,
        pod: &Pod,
        kind: ResizeKind,
        containers: &[ContainerToUpdateInfo],
        written: &mut BTreeMap<String, ContainerResources>,
        result: &mut PodSyncResult,
    ) -> Result<(), SyncError> {
        let desired = pod_resource_config(pod).value(kind);
        let current = self
            .cgroups
            .get_pod_cgroup_config(pod, kind)
            .await
            .map_err(|e| {
                SyncError::UpdateContainerFailed(format!(
                    "failed to read {} of pod {} cgroup: {}",
                    kind,
                    pod.full_name(),
                    e
                ))
            })?;

        if kind == ResizeKind::MemoryLimit && desired != UNLIMITED {
            let usage = self
                .cgroups
                .get_pod_cgroup_mem_usage(pod)
                .await
                .map_err(|e| {
                    SyncError::UpdateContainerFailed(format!(
                        "failed to read memory usage of pod {}: {}",
                        pod.full_name(),
                        e
                    ))
                })?;
            if usage >= desired {
                return Err(SyncError::UpdateContainerFailed(format!(
                    "aborting attempt to set pod memory limit less than current memory usage for pod {}",
                    pod.full_name()
                )));
            }
        }

        if comparable(desired) > comparable(current) {
            self.set_pod_cgroup(pod, kind, desired, result).await?;
        }
        if !containers.is_empty() {
            self.update_pod_container_resources(endpoint, kind, containers, written, result)
                .await?;
        }
        if comparable(desired) < comparable(current) {
            self.set_pod_cgroup(pod, kind, desired, result).await?;
        }
        Ok(())
    }

    /// Applies the planned in-place resizes. A failure aborts the resize but not the sync.
    pub(crate) async fn do_pod_resize_action(
        &self,
        endpoint: &RuntimeEndpoint,
        pod: &Pod,
        actions: &PodActions,
        result: &mut PodSyncResult,
    ) {
        let mut written = BTreeMap::new();
        let empty = Vec::new();
        for kind in RESIZE_ORDER {
            let containers = actions.containers_to_update.get(&kind).unwrap_or(&empty);
            if containers.is_empty() && !actions.update_pod_resources {
                continue;
            }
            if let Err(e) = self
                .resize_kind(endpoint, pod, kind, containers, &mut written, result)
                .await
            {
                warn!(pod = %pod.full_name(), %kind, error = %e, "pod resize aborted");
                if !result
                    .sync_results
                    .last()
                    .map(|r| r.error.is_some())
                    .unwrap_or(false)
                {
                    let mut r = SyncResult::new(SyncAction::UpdatePodCgroup, kind.to_string());
                    r.fail(e.clone(), e.to_string());
                    result.add_sync_result(r);
                }
                return;
            }
        }
        if !written.is_empty() {
            info!(pod = %pod.full_name(), containers = written.len(), "resized pod in place");
            self.recorder.event(
                &ObjectReference::for_pod(pod),
                EventType::Normal,
                events::RESIZED,
                &format!("Pod resized: {} container(s) updated", written.len()),
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::test_util::{harness, Harness};
    use super::*;
    use crate::container::{Container, ContainerId, ContainerState, ContainerStatus};
    use crate::pod::{self, ObjectMeta, PodSpec};
    use crate::runtime::fake::{fake_container_status, FakeContainer};
    use chrono::{TimeZone, Utc};

    fn container(name: &str, cpu: &str, memory: &str) -> Container {
        let mut c = Container {
            name: name.to_owned(),
            image: "busybox".to_owned(),
            ..Default::default()
        };
        for list in [&mut c.resources.limits, &mut c.resources.requests] {
            list.insert(CPU.to_owned(), Quantity::from(cpu));
            list.insert(MEMORY.to_owned(), Quantity::from(memory));
        }
        c.resources_allocated = c.resources.requests.clone();
        c
    }

    fn pod(containers: Vec<Container>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: "web".to_owned(),
                uid: "u1".to_owned(),
                ..Default::default()
            },
            spec: PodSpec {
                containers,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn info(c: &Container, id: &str, current: ContainerResources) -> ContainerToUpdateInfo {
        let desired = ContainerResources {
            memory_limit: c.resources.memory_limit_bytes().unwrap_or(0),
            memory_request: c.resources.memory_request_bytes().unwrap_or(0),
            cpu_limit: c.resources.cpu_limit_milli().unwrap_or(0),
            cpu_request: c.resources.cpu_request_milli().unwrap_or(0),
        };
        ContainerToUpdateInfo {
            index: 0,
            container: c.clone(),
            api_status: pod::ContainerStatus::default(),
            kube_status: ContainerStatus {
                id: ContainerId::new("default", id),
                name: c.name.clone(),
                state: ContainerState::Running,
                created_at: Utc.timestamp_nanos(1),
                started_at: None,
                finished_at: None,
                exit_code: 0,
                image: "busybox".to_owned(),
                image_id: String::new(),
                hash: 0,
                restart_count: 0,
                reason: String::new(),
                message: String::new(),
                resources: None,
            },
            desired,
            current,
        }
    }

    async fn seed(h: &Harness, ids: &[&str]) {
        h.runtime
            .set_fake_containers(
                ids.iter()
                    .map(|id| FakeContainer {
                        pod_sandbox_id: "s1".to_owned(),
                        status: fake_container_status(id, id, 0, ContainerState::Running, 1),
                    })
                    .collect(),
            )
            .await;
    }

    fn endpoint(h: &Harness) -> RuntimeEndpoint {
        h.manager
            .bindings()
            .registry()
            .get_primary_runtime_service()
            .unwrap()
            .clone()
    }

    const MI: i64 = 1024 * 1024;

    #[tokio::test]
    async fn test_cpu_increase_grows_cgroup_first() {
        let h = harness(|_| ());
        seed(&h, &["c1"]).await;
        let c = container("app", "1", "128Mi");
        let pod = pod(vec![c.clone()]);
        h.cgroups.create_pod_cgroup(&pod).await;
        h.cgroups.set_config("u1", ResizeKind::CpuLimit, 50_000).await;

        let current = ContainerResources {
            memory_limit: 128 * MI,
            memory_request: 128 * MI,
            cpu_limit: 500,
            cpu_request: 1000,
        };
        let mut actions = PodActions::default();
        actions
            .containers_to_update
            .insert(ResizeKind::CpuLimit, vec![info(&c, "c1", current)]);
        let mut result = PodSyncResult::default();
        h.manager
            .do_pod_resize_action(&endpoint(&h), &pod, &actions, &mut result)
            .await;

        assert!(!result.has_failures());
        let journal = h.journal.lock().await.clone();
        assert_eq!(
            journal,
            vec![
                "SetPodCgroup u1 cpu limit 100000".to_owned(),
                "UpdateContainerResources c1 shares=1024 quota=100000 memory=134217728".to_owned(),
            ]
        );
        assert_eq!(
            result.resized_containers["app"].cpu_limit_milli(),
            Some(1000)
        );
        assert_eq!(h.recorder.reasons(), vec![events::RESIZED]);
    }

    #[tokio::test]
    async fn test_memory_decrease_shrinks_cgroup_last() {
        let h = harness(|_| ());
        seed(&h, &["c1"]).await;
        let c = container("app", "1", "64Mi");
        let pod = pod(vec![c.clone()]);
        h.cgroups.create_pod_cgroup(&pod).await;
        h.cgroups
            .set_config("u1", ResizeKind::MemoryLimit, 128 * MI)
            .await;
        h.cgroups.set_mem_usage("u1", 10 * MI).await;

        let current = ContainerResources {
            memory_limit: 128 * MI,
            memory_request: 128 * MI,
            cpu_limit: 1000,
            cpu_request: 1000,
        };
        let mut actions = PodActions::default();
        actions
            .containers_to_update
            .insert(ResizeKind::MemoryLimit, vec![info(&c, "c1", current)]);
        let mut result = PodSyncResult::default();
        h.manager
            .do_pod_resize_action(&endpoint(&h), &pod, &actions, &mut result)
            .await;

        let journal = h.journal.lock().await.clone();
        assert!(journal[0].starts_with("UpdateContainerResources c1"));
        assert_eq!(journal[1], format!("SetPodCgroup u1 memory limit {}", 64 * MI));
        let actions_done: Vec<SyncAction> = result.sync_results.iter().map(|r| r.action).collect();
        assert_eq!(
            actions_done,
            vec![SyncAction::UpdateContainerResources, SyncAction::UpdatePodCgroup]
        );
    }

    #[tokio::test]
    async fn test_memory_below_usage_is_refused() {
        let h = harness(|_| ());
        seed(&h, &["c1"]).await;
        let c = container("app", "1", "64Mi");
        let pod = pod(vec![c.clone()]);
        h.cgroups.create_pod_cgroup(&pod).await;
        h.cgroups.set_mem_usage("u1", 100 * MI).await;

        let current = ContainerResources {
            memory_limit: 128 * MI,
            ..Default::default()
        };
        let mut actions = PodActions::default();
        actions
            .containers_to_update
            .insert(ResizeKind::MemoryLimit, vec![info(&c, "c1", current)]);
        let mut result = PodSyncResult::default();
        h.manager
            .do_pod_resize_action(&endpoint(&h), &pod, &actions, &mut result)
            .await;

        assert!(result.has_failures());
        assert!(h.journal.lock().await.is_empty());
        assert!(result.resized_containers.is_empty());
        assert!(h.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_kinds_accumulate_per_container() {
        let h = harness(|_| ());
        seed(&h, &["c1"]).await;
        let c = container("app", "2", "128Mi");
        let pod = pod(vec![c.clone()]);
        h.cgroups.create_pod_cgroup(&pod).await;

        let current = ContainerResources {
            memory_limit: 128 * MI,
            memory_request: 128 * MI,
            cpu_limit: 1000,
            cpu_request: 1000,
        };
        let mut actions = PodActions::default();
        actions
            .containers_to_update
            .insert(ResizeKind::CpuLimit, vec![info(&c, "c1", current)]);
        actions
            .containers_to_update
            .insert(ResizeKind::CpuRequest, vec![info(&c, "c1", current)]);
        let mut result = PodSyncResult::default();
        h.manager
            .do_pod_resize_action(&endpoint(&h), &pod, &actions, &mut result)
            .await;

        assert!(!result.has_failures());
        let applied = h.runtime.updated_resources().await;
        assert_eq!(applied["c1"].cpu_quota, 200_000);
        assert_eq!(applied["c1"].cpu_shares, 2048);
    }

    #[tokio::test]
    async fn test_container_update_failure_aborts_resize() {
        let h = harness(|_| ());
        seed(&h, &["c1"]).await;
        h.runtime
            .inject_error("UpdateContainerResources", "cgroup busy")
            .await;
        let c = container("app", "2", "128Mi");
        let pod = pod(vec![c.clone()]);
        h.cgroups.create_pod_cgroup(&pod).await;
        h.cgroups.set_config("u1", ResizeKind::CpuLimit, 100_000).await;

        let current = ContainerResources {
            cpu_limit: 1000,
            cpu_request: 2000,
            memory_limit: 128 * MI,
            memory_request: 128 * MI,
        };
        let mut actions = PodActions::default();
        actions
            .containers_to_update
            .insert(ResizeKind::CpuLimit, vec![info(&c, "c1", current)]);
        let mut result = PodSyncResult::default();
        h.manager
            .do_pod_resize_action(&endpoint(&h), &pod, &actions, &mut result)
            .await;

        let failed: Vec<&SyncResult> = result.failures().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].action, SyncAction::UpdateContainerResources);
        assert!(result.resized_containers.is_empty());
    }
}
