//! Reading pod state back from the runtime, and turning it into the API view.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use tracing::{debug, warn};

use super::actions::find_next_init_container_to_run;
use super::from_runtime_timestamp;
use super::labels::{
    get_container_info_from_annotations, get_container_info_from_labels, POD_UID_LABEL,
};
use super::result::{PodSyncResult, SyncAction};
use super::RuntimeManager;
use crate::cm::{quota_to_milli_cpu, shares_to_milli_cpu, MIN_SHARES};
use crate::container::{
    Container, ContainerId, ContainerState, ContainerStatus, PodStatus, RestartPolicy,
    RunningContainer, RunningPod,
};
use crate::pod::{
    self, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting, Phase, Pod,
    PodCondition,
};
use crate::resources::{Quantity, ResourceRequirements, CPU, MEMORY};
use crate::runtime::types::{self, ContainerFilter, LinuxContainerResources, PodSandboxFilter, PodSandboxState};
use crate::runtime::{RegistryError, RuntimeService};

/// Pod condition set once every init container succeeded.
pub const POD_INITIALIZED: &str = "Initialized";
/// Pod condition set while every container runs.
pub const POD_READY: &str = "Ready";

/// Converts runtime resources back to requirements. Values the runtime leaves at their floor
/// are treated as unset.
pub(crate) fn resources_from_linux(r: &LinuxContainerResources) -> ResourceRequirements {
    let mut out = ResourceRequirements::default();
    if r.cpu_shares > MIN_SHARES {
        out.requests.insert(
            CPU.to_owned(),
            Quantity::from_milli_cpu(shares_to_milli_cpu(r.cpu_shares)),
        );
    }
    if r.cpu_quota > 0 {
        out.limits.insert(
            CPU.to_owned(),
            Quantity::from_milli_cpu(quota_to_milli_cpu(r.cpu_quota, r.cpu_period)),
        );
    }
    if r.memory_limit_in_bytes > 0 {
        out.limits
            .insert(MEMORY.to_owned(), Quantity::from_value(r.memory_limit_in_bytes));
    }
    out
}

/// Converts a runtime container status into the kubelet view, reading the pod identity and spec
/// hash back from labels and annotations.
pub fn to_kubelet_container_status(
    runtime_type: &str,
    status: &types::ContainerStatus,
) -> ContainerStatus {
    let labeled = get_container_info_from_labels(&status.labels);
    let annotated = get_container_info_from_annotations(&status.annotations);
    let name = if labeled.container_name.is_empty() {
        status.metadata.name.clone()
    } else {
        labeled.container_name
    };
    ContainerStatus {
        id: ContainerId::new(runtime_type, &status.id),
        name,
        state: status.state,
        created_at: from_runtime_timestamp(status.created_at).unwrap_or_else(|| Utc.timestamp_nanos(0)),
        started_at: from_runtime_timestamp(status.started_at),
        finished_at: from_runtime_timestamp(status.finished_at),
        exit_code: status.exit_code,
        image: status.image.image.clone(),
        image_id: status.image_ref.clone(),
        hash: annotated.hash,
        restart_count: annotated.restart_count,
        reason: status.reason.clone(),
        message: status.message.clone(),
        resources: status.resources.as_ref().map(resources_from_linux),
    }
}

impl RuntimeManager {
    /// Ids of the sandboxes of a pod, newest first.
    pub(crate) async fn sandbox_ids_for_pod(
        &self,
        service: &dyn RuntimeService,
        pod_uid: &str,
        state: Option<PodSandboxState>,
    ) -> anyhow::Result<Vec<String>> {
        let filter = PodSandboxFilter {
            state,
            ..Default::default()
        };
        let mut sandboxes: Vec<types::PodSandbox> = service
            .list_pod_sandbox(Some(&filter))
            .await?
            .into_iter()
            .filter(|s| s.metadata.uid == pod_uid)
            .collect();
        sandboxes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sandboxes.into_iter().map(|s| s.id).collect())
    }

    /// Reads the observed state of a pod from the runtime hosting it. A pod no runtime knows
    /// about has an empty status.
    pub async fn get_pod_status(
        &self,
        uid: &str,
        name: &str,
        namespace: &str,
        tenant: &str,
    ) -> anyhow::Result<PodStatus> {
        let mut status = PodStatus {
            id: uid.to_owned(),
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            tenant: tenant.to_owned(),
            ..Default::default()
        };
        let endpoint = match self.bindings.get_runtime_service_by_pod_id(uid).await {
            Ok(e) => e,
            Err(RegistryError::PodRuntimeNotFound(_)) => {
                debug!(pod_uid = uid, "pod not found on any runtime");
                return Ok(status);
            }
            Err(e) => return Err(e.into()),
        };
        let service = endpoint.service.as_ref();

        for (idx, id) in self
            .sandbox_ids_for_pod(service, uid, None)
            .await?
            .into_iter()
            .enumerate()
        {
            let sandbox = service.pod_sandbox_status(&id).await?;
            if idx == 0 && sandbox.state == PodSandboxState::Ready {
                status.ip = sandbox.ip.clone();
            }
            status.sandbox_statuses.push(sandbox);
        }

        let mut selector = BTreeMap::new();
        selector.insert(POD_UID_LABEL.to_owned(), uid.to_owned());
        let filter = ContainerFilter {
            label_selector: selector,
            ..Default::default()
        };
        for c in service.list_containers(Some(&filter)).await? {
            let s = service.container_status(&c.id).await?;
            status
                .container_statuses
                .push(to_kubelet_container_status(&endpoint.name, &s));
        }
        status
            .container_statuses
            .sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(status)
    }

    /// Every pod known to any runtime. Unless `all` is set only running containers and ready
    /// sandboxes are returned. A runtime that cannot be listed is skipped.
    pub async fn get_pods(&self, all: bool) -> Vec<RunningPod> {
        let mut pods: BTreeMap<String, RunningPod> = BTreeMap::new();
        for endpoint in self.bindings.registry().get_all_runtime_services() {
            let sandbox_filter = PodSandboxFilter {
                state: if all { None } else { Some(PodSandboxState::Ready) },
                ..Default::default()
            };
            let sandboxes = match endpoint.service.list_pod_sandbox(Some(&sandbox_filter)).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(runtime = %endpoint.name, error = %e, "unable to list sandboxes");
                    continue;
                }
            };
            let container_filter = ContainerFilter {
                state: if all { None } else { Some(ContainerState::Running) },
                ..Default::default()
            };
            let containers = match endpoint.service.list_containers(Some(&container_filter)).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(runtime = %endpoint.name, error = %e, "unable to list containers");
                    continue;
                }
            };

            for s in sandboxes {
                let pod = pods.entry(s.metadata.uid.clone()).or_insert_with(|| RunningPod {
                    id: s.metadata.uid.clone(),
                    name: s.metadata.name.clone(),
                    namespace: s.metadata.namespace.clone(),
                    tenant: s.metadata.tenant.clone(),
                    ..Default::default()
                });
                pod.sandboxes.push(RunningContainer {
                    id: ContainerId::new(&endpoint.name, &s.id),
                    name: s.metadata.name.clone(),
                    image: String::new(),
                    hash: 0,
                    state: match s.state {
                        PodSandboxState::Ready => ContainerState::Running,
                        PodSandboxState::NotReady => ContainerState::Exited,
                    },
                });
            }
            for c in containers {
                let labeled = get_container_info_from_labels(&c.labels);
                let annotated = get_container_info_from_annotations(&c.annotations);
                let pod = pods
                    .entry(labeled.pod_uid.clone())
                    .or_insert_with(|| RunningPod {
                        id: labeled.pod_uid.clone(),
                        name: labeled.pod_name.clone(),
                        namespace: labeled.pod_namespace.clone(),
                        tenant: labeled.pod_tenant.clone(),
                        ..Default::default()
                    });
                pod.containers.push(RunningContainer {
                    id: ContainerId::new(&endpoint.name, &c.id),
                    name: if labeled.container_name.is_empty() {
                        c.metadata.name.clone()
                    } else {
                        labeled.container_name
                    },
                    image: c.image.image.clone(),
                    hash: annotated.hash,
                    state: c.state,
                });
            }
        }
        pods.into_values().collect()
    }
}

fn terminated_state(s: &ContainerStatus) -> pod::ContainerState {
    pod::ContainerState {
        terminated: Some(ContainerStateTerminated {
            exit_code: s.exit_code,
            reason: non_empty(&s.reason),
            message: non_empty(&s.message),
            finished_at: s.finished_at,
        }),
        ..Default::default()
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_owned())
    }
}

fn api_container_status(
    container: &Container,
    previous: Option<&pod::ContainerStatus>,
    status: &PodStatus,
    result: &PodSyncResult,
    default_waiting_reason: &str,
) -> pod::ContainerStatus {
    let mut instances = status
        .container_statuses
        .iter()
        .filter(|s| s.name == container.name);
    let newest = instances.next();
    let older = instances.next();

    let failure = result
        .failures()
        .find(|r| r.action == SyncAction::StartContainer && r.target == container.name);

    let mut api = pod::ContainerStatus {
        name: container.name.clone(),
        image: container.image.clone(),
        ..Default::default()
    };
    let newest = match newest {
        Some(s) => s,
        None => {
            let (reason, message) = match failure.and_then(|f| f.error.as_ref()) {
                Some(e) => (e.reason().to_owned(), failure.map(|f| f.message.clone())),
                None => (default_waiting_reason.to_owned(), None),
            };
            api.state.waiting = Some(ContainerStateWaiting {
                reason: Some(reason),
                message: message.and_then(|m| non_empty(&m)),
            });
            return api;
        }
    };

    api.image = newest.image.clone();
    api.image_id = newest.image_id.clone();
    api.restart_count = newest.restart_count;
    api.container_id = Some(newest.id.to_string());

    match (newest.state, failure.and_then(|f| f.error.as_ref())) {
        (ContainerState::Running, _) => {
            api.state.running = Some(ContainerStateRunning {
                started_at: newest.started_at,
            });
            api.ready = true;
            if let Some(older) = older {
                if older.state == ContainerState::Exited {
                    api.last_state = terminated_state(older);
                }
            }
        }
        (ContainerState::Exited, Some(e)) => {
            api.state.waiting = Some(ContainerStateWaiting {
                reason: Some(e.reason().to_owned()),
                message: failure.and_then(|f| non_empty(&f.message)),
            });
            api.last_state = terminated_state(newest);
        }
        (ContainerState::Exited, None) => {
            api.state = terminated_state(newest);
            if let Some(older) = older {
                if older.state == ContainerState::Exited {
                    api.last_state = terminated_state(older);
                }
            }
        }
        (ContainerState::Created, _) | (ContainerState::Unknown, _) => {
            api.state.waiting = Some(ContainerStateWaiting {
                reason: Some(default_waiting_reason.to_owned()),
                message: None,
            });
        }
    }

    if newest.state == ContainerState::Running {
        let same_instance = previous
            .map(|p| p.container_id.as_deref() == api.container_id.as_deref())
            .unwrap_or(false);
        api.resources = result
            .resized_containers
            .get(&container.name)
            .cloned()
            .or_else(|| newest.resources.clone())
            .or_else(|| {
                if same_instance {
                    previous.and_then(|p| p.resources.clone())
                } else {
                    None
                }
            })
            .or_else(|| Some(container.resources.clone()));
    }
    api
}

fn pod_phase(pod: &Pod, statuses: &[pod::ContainerStatus], init_pending: bool) -> Phase {
    if init_pending {
        return Phase::Pending;
    }
    let (mut running, mut waiting, mut stopped, mut succeeded) = (0, 0, 0, 0);
    for s in statuses {
        if s.state.running.is_some() {
            running += 1;
        } else if let Some(t) = &s.state.terminated {
            stopped += 1;
            if t.exit_code == 0 {
                succeeded += 1;
            }
        } else if s.last_state.terminated.is_some() {
            stopped += 1;
        } else {
            waiting += 1;
        }
    }
    if waiting > 0 {
        Phase::Pending
    } else if running > 0 {
        Phase::Running
    } else if stopped > 0 {
        if pod.spec.restart_policy == RestartPolicy::Always {
            Phase::Running
        } else if stopped == succeeded {
            Phase::Succeeded
        } else if pod.spec.restart_policy == RestartPolicy::Never {
            Phase::Failed
        } else {
            Phase::Running
        }
    } else {
        Phase::Pending
    }
}

fn condition(type_: &str, holds: bool) -> PodCondition {
    PodCondition {
        type_: type_.to_owned(),
        status: if holds { "True" } else { "False" }.to_owned(),
        last_transition_time: Some(Utc::now()),
        ..Default::default()
    }
}

/// Builds the API status of a pod out of its observed status and the outcome of its last sync.
/// Conditions set by others, such as `PodScheduled`, are kept.
pub fn generate_api_pod_status(pod: &Pod, status: &PodStatus, result: &PodSyncResult) -> pod::PodStatus {
    let mut api = pod.status.clone();

    api.container_statuses = pod
        .spec
        .containers
        .iter()
        .map(|c| {
            api_container_status(
                c,
                pod.status.container_status(&c.name),
                status,
                result,
                "ContainerCreating",
            )
        })
        .collect();
    api.init_container_statuses = pod
        .spec
        .init_containers
        .iter()
        .map(|c| {
            let previous = pod
                .status
                .init_container_statuses
                .iter()
                .find(|s| s.name == c.name);
            api_container_status(c, previous, status, result, "PodInitializing")
        })
        .collect();

    let (init_failure, _, init_done) = find_next_init_container_to_run(pod, status);
    api.phase = if init_failure.is_some() && pod.spec.restart_policy == RestartPolicy::Never {
        Phase::Failed
    } else {
        pod_phase(pod, &api.container_statuses, !init_done)
    };
    api.pod_ip = non_empty(&status.ip);

    let ready = !api.container_statuses.is_empty()
        && api.container_statuses.iter().all(|s| s.ready);
    api.set_condition(condition(POD_INITIALIZED, init_done));
    api.set_condition(condition(POD_READY, ready));
    api
}

#[cfg(test)]
mod test {
    use super::super::test_util::harness;
    use super::*;
    use crate::kuberuntime::labels::{new_container_annotations, new_container_labels};
    use crate::kuberuntime::result::{SyncError, SyncResult};
    use crate::pod::{ObjectMeta, PodSpec};
    use crate::runtime::fake::{fake_container_status, FakeContainer, FAKE_POD_SANDBOX_IP};
    use crate::runtime::types::PodSandboxMetadata;

    fn pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: "web".to_owned(),
                uid: "u1".to_owned(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![
                    Container {
                        name: "app".to_owned(),
                        image: "busybox".to_owned(),
                        ..Default::default()
                    },
                    Container {
                        name: "sidecar".to_owned(),
                        image: "busybox".to_owned(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn sandbox(id: &str, uid: &str, state: PodSandboxState, created_at: i64) -> types::PodSandboxStatus {
        types::PodSandboxStatus {
            id: id.to_owned(),
            metadata: PodSandboxMetadata {
                name: "web".to_owned(),
                uid: uid.to_owned(),
                namespace: "default".to_owned(),
                ..Default::default()
            },
            state,
            created_at,
            ip: FAKE_POD_SANDBOX_IP.to_owned(),
            ..Default::default()
        }
    }

    fn seeded(pod: &Pod, idx: usize, id: &str, state: ContainerState, created_at: i64) -> FakeContainer {
        let c = &pod.spec.containers[idx];
        let mut status = fake_container_status(id, &c.name, 0, state, created_at);
        status.labels = new_container_labels(c, pod);
        status.annotations = new_container_annotations(c, pod, 2);
        FakeContainer {
            pod_sandbox_id: "s2".to_owned(),
            status,
        }
    }

    #[tokio::test]
    async fn test_get_pod_status() {
        let h = harness(|_| ());
        let pod = pod();
        h.runtime
            .set_fake_sandboxes(vec![
                sandbox("s1", "u1", PodSandboxState::NotReady, 1),
                sandbox("s2", "u1", PodSandboxState::Ready, 5),
                sandbox("other", "u2", PodSandboxState::Ready, 7),
            ])
            .await;
        h.runtime
            .set_fake_containers(vec![
                seeded(&pod, 0, "c1", ContainerState::Running, 10),
                seeded(&pod, 1, "c2", ContainerState::Exited, 20),
            ])
            .await;

        let status = h
            .manager
            .get_pod_status("u1", "web", "default", "system")
            .await
            .unwrap();
        assert_eq!(status.ip, FAKE_POD_SANDBOX_IP);
        let ids: Vec<&str> = status.sandbox_statuses.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s2", "s1"]);
        let names: Vec<&str> = status
            .container_statuses
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["sidecar", "app"]);
        let app = status.find_container_status_by_name("app").unwrap();
        assert_eq!(app.id, ContainerId::new("default", "c1"));
        assert_eq!(app.hash, crate::container::hash_container(&pod.spec.containers[0]));
        assert_eq!(app.restart_count, 2);
        assert_eq!(app.finished_at, None);

        let running = h.manager.get_pods(false).await;
        assert_eq!(running.len(), 2);
        let web = running.iter().find(|p| p.id == "u1").unwrap();
        assert_eq!(web.sandboxes.len(), 1);
        assert_eq!(web.containers.len(), 1);
        assert_eq!(h.manager.get_pods(true).await.iter().find(|p| p.id == "u1").unwrap().sandboxes.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_pod_has_empty_status() {
        let h = harness(|_| ());
        let status = h
            .manager
            .get_pod_status("nope", "web", "default", "system")
            .await
            .unwrap();
        assert_eq!(status.id, "nope");
        assert!(status.sandbox_statuses.is_empty());
        assert!(status.container_statuses.is_empty());
    }

    #[test]
    fn test_resources_from_linux() {
        let r = resources_from_linux(&LinuxContainerResources {
            cpu_period: 100_000,
            cpu_quota: 50_000,
            cpu_shares: 256,
            memory_limit_in_bytes: 1024,
        });
        assert_eq!(r.cpu_limit_milli(), Some(500));
        assert_eq!(r.cpu_request_milli(), Some(250));
        assert_eq!(r.memory_limit_bytes(), Some(1024));
        assert!(resources_from_linux(&LinuxContainerResources::default()).limits.is_empty());
    }

    fn kube_status(name: &str, id: &str, state: ContainerState, exit_code: i32) -> ContainerStatus {
        ContainerStatus {
            id: ContainerId::new("default", id),
            name: name.to_owned(),
            state,
            created_at: Utc.timestamp_nanos(1),
            started_at: None,
            finished_at: None,
            exit_code,
            image: "busybox".to_owned(),
            image_id: "busybox".to_owned(),
            hash: 0,
            restart_count: 1,
            reason: String::new(),
            message: String::new(),
            resources: None,
        }
    }

    #[test]
    fn test_generate_api_pod_status() {
        let mut pod = pod();
        pod.spec.restart_policy = RestartPolicy::Never;
        let status = PodStatus {
            id: "u1".to_owned(),
            ip: "10.0.0.1".to_owned(),
            container_statuses: vec![
                kube_status("app", "c1", ContainerState::Running, 0),
                kube_status("sidecar", "c2", ContainerState::Exited, 1),
            ],
            ..Default::default()
        };
        let api = generate_api_pod_status(&pod, &status, &PodSyncResult::default());
        assert_eq!(api.phase, Phase::Running);
        assert_eq!(api.pod_ip.as_deref(), Some("10.0.0.1"));
        let app = api.container_status("app").unwrap();
        assert!(app.state.running.is_some());
        assert_eq!(app.container_id.as_deref(), Some("default://c1"));
        assert_eq!(app.resources, Some(ResourceRequirements::default()));
        let sidecar = api.container_status("sidecar").unwrap();
        assert_eq!(sidecar.state.terminated.as_ref().unwrap().exit_code, 1);
        assert_eq!(api.condition(POD_READY).unwrap().status, "False");

        let status = PodStatus {
            container_statuses: vec![
                kube_status("app", "c1", ContainerState::Exited, 0),
                kube_status("sidecar", "c2", ContainerState::Exited, 1),
            ],
            ..Default::default()
        };
        let api = generate_api_pod_status(&pod, &status, &PodSyncResult::default());
        assert_eq!(api.phase, Phase::Failed);
        assert_eq!(api.pod_ip, None);
    }

    #[test]
    fn test_sync_failure_is_reported_as_waiting() {
        let pod = pod();
        let status = PodStatus {
            container_statuses: vec![kube_status("app", "c1", ContainerState::Exited, 1)],
            ..Default::default()
        };
        let mut result = PodSyncResult::default();
        let mut r = SyncResult::new(SyncAction::StartContainer, "app");
        r.fail(SyncError::CrashLoopBackOff("back-off".to_owned()), "back-off 10s");
        result.add_sync_result(r);

        let api = generate_api_pod_status(&pod, &status, &result);
        let app = api.container_status("app").unwrap();
        let waiting = app.state.waiting.as_ref().unwrap();
        assert_eq!(waiting.reason.as_deref(), Some("CrashLoopBackOff"));
        assert_eq!(waiting.message.as_deref(), Some("back-off 10s"));
        assert!(app.last_state.terminated.is_some());
        let sidecar = api.container_status("sidecar").unwrap();
        assert_eq!(
            sidecar.state.waiting.as_ref().unwrap().reason.as_deref(),
            Some("ContainerCreating")
        );
        assert_eq!(api.phase, Phase::Pending);
    }
}
