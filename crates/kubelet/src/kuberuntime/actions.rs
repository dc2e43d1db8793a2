//! Planning a pod sync: what to kill, start, resize and hot plug so that the observed pod
//! converges on its spec. Planning has no side effects and never fails.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, instrument};

use crate::container::{
    hash_container, Container, ContainerId, ContainerState, ContainerStatus, PodStatus,
    RestartPolicy,
};
use crate::pod::{self, Nic, Pod};
use crate::prober::{ProbeResult, ResultsManager};
use crate::resources::{lists_semantic_eq, ResizeKind};
use crate::runtime::types::{NamespaceMode, PodSandboxState, PodSandboxStatus};

/// A running container to stop, and why.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerToKillInfo {
    /// The spec of the container.
    pub container: Container,
    /// Container name.
    pub name: String,
    /// Reported in the `Killing` event.
    pub message: String,
}

/// Resource values of a container relevant to in-place resize. CPU values are in millicores,
/// memory values in bytes, and zero means unset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContainerResources {
    /// Memory limit.
    pub memory_limit: i64,
    /// Memory request.
    pub memory_request: i64,
    /// CPU limit.
    pub cpu_limit: i64,
    /// CPU request.
    pub cpu_request: i64,
}

impl ContainerResources {
    /// The value of one resize kind.
    pub fn value(&self, kind: ResizeKind) -> i64 {
        match kind {
            ResizeKind::MemoryLimit => self.memory_limit,
            ResizeKind::CpuLimit => self.cpu_limit,
            ResizeKind::CpuRequest => self.cpu_request,
        }
    }
}

/// A running container to resize in place.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerToUpdateInfo {
    /// Index of the container in the pod spec.
    pub index: usize,
    /// The desired spec.
    pub container: Container,
    /// The status reported through the API.
    pub api_status: pod::ContainerStatus,
    /// The status observed from the runtime.
    pub kube_status: ContainerStatus,
    /// Resources the spec asks for.
    pub desired: ContainerResources,
    /// Resources last applied, runtime reported values taking precedence.
    pub current: ContainerResources,
}

/// NICs to hot plug into, or out of, the running sandbox.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Hotplugs {
    /// NICs in the spec that the sandbox does not have.
    pub nics_to_attach: Vec<Nic>,
    /// NICs the sandbox has that the spec no longer lists.
    pub nics_to_detach: Vec<Nic>,
}

impl Hotplugs {
    /// Whether there is nothing to plug.
    pub fn is_empty(&self) -> bool {
        self.nics_to_attach.is_empty() && self.nics_to_detach.is_empty()
    }
}

/// Everything one sync has to do to a pod.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodActions {
    /// Stop every container and sandbox of the pod.
    pub kill_pod: bool,
    /// Create a new sandbox.
    pub create_sandbox: bool,
    /// The current sandbox, if any.
    pub sandbox_id: String,
    /// Attempt number of the sandbox to create.
    pub attempt: u32,
    /// The init container to run next.
    pub next_init_container_to_start: Option<Container>,
    /// Spec indexes of the regular containers to start.
    pub containers_to_start: Vec<usize>,
    /// Running containers to stop.
    pub containers_to_kill: BTreeMap<ContainerId, ContainerToKillInfo>,
    /// In-place resizes per kind. Decreases come before increases within a kind.
    pub containers_to_update: BTreeMap<ResizeKind, Vec<ContainerToUpdateInfo>>,
    /// Spec indexes of containers restarted because their resize policy demands it.
    pub containers_to_restart: Vec<usize>,
    /// Rewrite the pod cgroup envelope even with no container to update.
    pub update_pod_resources: bool,
    /// NICs to hot plug.
    pub hotplugs: Hotplugs,
}

/// Optional behaviors of the planner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlannerFeatures {
    /// Resize running containers instead of ignoring resource changes.
    pub in_place_resize: bool,
    /// Hot plug NICs into running sandboxes.
    pub nic_hotplug: bool,
}

/// Whether a new sandbox is needed, the attempt number to create it with, and the id of the
/// current sandbox.
pub fn pod_sandbox_changed(pod: &Pod, status: &PodStatus) -> (bool, u32, String) {
    let sandbox = match status.sandbox_statuses.first() {
        None => {
            debug!(pod = %pod.full_name(), "no sandbox for pod can be found, need to start a new one");
            return (true, 0, String::new());
        }
        Some(s) => s,
    };

    let ready = status
        .sandbox_statuses
        .iter()
        .filter(|s| s.state == PodSandboxState::Ready)
        .count();
    let next_attempt = sandbox.metadata.attempt + 1;
    if ready > 1 {
        debug!(pod = %pod.full_name(), ready, "multiple ready sandboxes found, reconciling");
        return (true, next_attempt, sandbox.id.clone());
    }
    if sandbox.state != PodSandboxState::Ready {
        debug!(pod = %pod.full_name(), sandbox_id = %sandbox.id, "no ready sandbox, need to start a new one");
        return (true, next_attempt, sandbox.id.clone());
    }
    if sandbox.network_mode != network_namespace_for_pod(pod) {
        debug!(pod = %pod.full_name(), sandbox_id = %sandbox.id, "sandbox network namespace changed");
        return (true, next_attempt, String::new());
    }
    if !pod.is_host_network() && sandbox.ip.is_empty() {
        debug!(pod = %pod.full_name(), sandbox_id = %sandbox.id, "sandbox has no IP address");
        return (true, next_attempt, sandbox.id.clone());
    }
    (false, sandbox.metadata.attempt, sandbox.id.clone())
}

/// The network namespace mode a pod asks for.
pub fn network_namespace_for_pod(pod: &Pod) -> NamespaceMode {
    if pod.is_host_network() {
        NamespaceMode::Node
    } else {
        NamespaceMode::Pod
    }
}

/// Whether an init container instance failed.
pub fn is_init_container_failed(status: &ContainerStatus) -> bool {
    status.reason == "OOMKilled"
        || (status.state == ContainerState::Exited && status.exit_code != 0)
        || status.state == ContainerState::Unknown
}

/// Finds where initialization stands. Returns the status of the last failed init container
/// if one failed, the init container to run next, and whether initialization is done.
pub fn find_next_init_container_to_run<'a>(
    pod: &'a Pod,
    status: &'a PodStatus,
) -> (Option<&'a ContainerStatus>, Option<&'a Container>, bool) {
    let inits = &pod.spec.init_containers;
    if inits.is_empty() {
        return (None, None, true);
    }

    for container in inits.iter().rev() {
        if let Some(s) = status.find_container_status_by_name(&container.name) {
            if is_init_container_failed(s) {
                return (Some(s), Some(container), false);
            }
        }
    }

    for (i, container) in inits.iter().enumerate().rev() {
        let s = match status.find_container_status_by_name(&container.name) {
            Some(s) => s,
            None => continue,
        };
        match s.state {
            ContainerState::Running => return (None, None, false),
            ContainerState::Exited => {
                return match inits.get(i + 1) {
                    Some(next) => (None, Some(next), false),
                    None => (None, None, true),
                };
            }
            _ => (),
        }
    }

    (None, inits.first(), false)
}

/// Whether a container that is not running should be started again.
pub fn should_container_be_restarted(
    container: &Container,
    pod: &Pod,
    status: &PodStatus,
) -> bool {
    if pod.is_terminating() {
        return false;
    }
    let s = match status.find_container_status_by_name(&container.name) {
        None => return true,
        Some(s) => s,
    };
    match s.state {
        ContainerState::Running => false,
        ContainerState::Unknown | ContainerState::Created => true,
        ContainerState::Exited => match pod.spec.restart_policy {
            RestartPolicy::Never => false,
            RestartPolicy::OnFailure => s.exit_code != 0,
            RestartPolicy::Always => true,
        },
    }
}

fn container_succeeded(container: &Container, status: &PodStatus) -> bool {
    status
        .find_container_status_by_name(&container.name)
        .map(|s| s.state == ContainerState::Exited && s.exit_code == 0)
        .unwrap_or(false)
}

/// Computes the NIC diff between the spec and the sandbox. `None` when the runtime does not
/// report NICs.
pub fn compute_nic_hotplugs(pod: &Pod, sandbox: &PodSandboxStatus) -> Option<Hotplugs> {
    let observed = sandbox.nics.as_ref()?;
    let observed_names: BTreeSet<&str> = observed.iter().map(|n| n.name.as_str()).collect();
    let valid: Vec<&Nic> = pod.spec.nics.iter().filter(|n| n.is_valid()).collect();
    let spec_names: BTreeSet<&str> = valid.iter().map(|n| n.name.as_str()).collect();

    let nics_to_attach = valid
        .iter()
        .filter(|n| !observed_names.contains(n.name.as_str()))
        .map(|n| (*n).clone())
        .collect();
    let nics_to_detach = observed
        .iter()
        .filter(|n| !spec_names.contains(n.name.as_str()))
        .map(|n| Nic {
            name: n.name.clone(),
            port_id: n.port_id.clone(),
            ..Default::default()
        })
        .collect();
    Some(Hotplugs {
        nics_to_attach,
        nics_to_detach,
    })
}

/// Plans the sync of `pod` against its observed `status`.
#[instrument(level = "debug", skip(pod, status, liveness), fields(pod = %pod.full_name()))]
pub fn compute_pod_actions(
    pod: &Pod,
    status: &PodStatus,
    liveness: &ResultsManager,
    features: PlannerFeatures,
) -> PodActions {
    let (create_sandbox, attempt, sandbox_id) = pod_sandbox_changed(pod, status);
    let mut changes = PodActions {
        kill_pod: create_sandbox,
        create_sandbox,
        sandbox_id,
        attempt,
        ..Default::default()
    };

    if create_sandbox {
        if !pod.should_restart_on_failure()
            && attempt != 0
            && !status.container_statuses.is_empty()
        {
            // Every container already ran to completion; a new sandbox would serve nothing.
            changes.create_sandbox = false;
            return changes;
        }
        if let Some(first) = pod.spec.init_containers.first() {
            changes.next_init_container_to_start = Some(first.clone());
            return changes;
        }
        for (idx, c) in pod.spec.containers.iter().enumerate() {
            if pod.spec.restart_policy == RestartPolicy::OnFailure && container_succeeded(c, status)
            {
                continue;
            }
            changes.containers_to_start.push(idx);
        }
        return changes;
    }

    let (init_last_status, next, done) = find_next_init_container_to_run(pod, status);
    if !done {
        if let Some(next) = next {
            let init_failed = init_last_status
                .map(is_init_container_failed)
                .unwrap_or(false);
            if init_failed && !pod.should_restart_on_failure() {
                changes.kill_pod = true;
            } else {
                if let Some(last) = init_last_status {
                    if last.state == ContainerState::Unknown {
                        changes.containers_to_kill.insert(
                            last.id.clone(),
                            ContainerToKillInfo {
                                container: next.clone(),
                                name: next.name.clone(),
                                message: format!(
                                    "Init container is in {:?} state, try killing it before restart",
                                    last.state.to_string()
                                ),
                            },
                        );
                    }
                }
                changes.next_init_container_to_start = Some(next.clone());
            }
        }
        return changes;
    }

    let mut keep_count: i32 = 0;
    for (idx, container) in pod.spec.containers.iter().enumerate() {
        let container_status = status.find_container_status_by_name(&container.name);

        let running = match container_status {
            Some(s) if s.state == ContainerState::Running => s,
            _ => {
                if should_container_be_restarted(container, pod, status) {
                    debug!(container = %container.name, "container is dead, but restart policy says that we should restart it");
                    changes.containers_to_start.push(idx);
                    if let Some(s) = container_status {
                        if s.state == ContainerState::Unknown {
                            changes.containers_to_kill.insert(
                                s.id.clone(),
                                ContainerToKillInfo {
                                    container: container.clone(),
                                    name: s.name.clone(),
                                    message: format!(
                                        "Container is in {:?} state, try killing it before restart",
                                        s.state.to_string()
                                    ),
                                },
                            );
                        }
                    }
                }
                continue;
            }
        };

        let mut restart = pod.should_restart_on_failure();
        let message = if running.hash != hash_container(container) {
            restart = true;
            format!("Container {} definition changed", container.name)
        } else if liveness.get(&running.id) == Some(ProbeResult::Failure) {
            format!("Container {} failed liveness probe", container.name)
        } else {
            keep_count += 1;
            if features.in_place_resize
                && compute_pod_resize_action(pod, idx, running, &mut changes)
            {
                keep_count -= 1;
            }
            continue;
        };

        let message = if restart {
            changes.containers_to_start.push(idx);
            format!("{}, will be restarted", message)
        } else {
            message
        };
        debug!(container = %container.name, container_id = %running.id, %message, "killing container");
        changes.containers_to_kill.insert(
            running.id.clone(),
            ContainerToKillInfo {
                container: container.clone(),
                name: running.name.clone(),
                message,
            },
        );
    }

    if keep_count == 0 && changes.containers_to_start.is_empty() {
        changes.kill_pod = true;
        if !changes.containers_to_restart.is_empty() {
            changes.kill_pod = false;
        }
    }

    // A pod being torn down keeps no sandbox to plug NICs into.
    if features.nic_hotplug && !(changes.kill_pod && !changes.create_sandbox) {
        if let Some(hotplugs) = status
            .latest_sandbox()
            .and_then(|s| compute_nic_hotplugs(pod, s))
        {
            changes.hotplugs = hotplugs;
        }
    }

    changes
}

fn current_resources(api: &pod::ContainerStatus, kube: &ContainerStatus) -> ContainerResources {
    let mut current = ContainerResources::default();
    if let Some(r) = &api.resources {
        current.memory_limit = r.memory_limit_bytes().unwrap_or(0);
        current.memory_request = r.memory_request_bytes().unwrap_or(0);
        current.cpu_limit = r.cpu_limit_milli().unwrap_or(0);
        current.cpu_request = r.cpu_request_milli().unwrap_or(0);
    }
    if let Some(r) = &kube.resources {
        if let Some(v) = r.memory_limit_bytes() {
            current.memory_limit = v;
        }
        if let Some(v) = r.cpu_limit_milli() {
            current.cpu_limit = v;
        }
        if let Some(v) = r.cpu_request_milli() {
            current.cpu_request = v;
        }
    }
    current
}

fn desired_resources(container: &Container) -> ContainerResources {
    let allocated_memory = container
        .resources_allocated
        .get(crate::resources::MEMORY)
        .and_then(|q| q.value().ok());
    ContainerResources {
        memory_limit: container.resources.memory_limit_bytes().unwrap_or(0),
        memory_request: allocated_memory
            .or_else(|| container.resources.memory_request_bytes())
            .unwrap_or(0),
        cpu_limit: container.resources.cpu_limit_milli().unwrap_or(0),
        cpu_request: container.resources.cpu_request_milli().unwrap_or(0),
    }
}

// Plans the in-place resize of a running container. Returns true when the resize policy
// forces a restart instead.
fn compute_pod_resize_action(
    pod: &Pod,
    idx: usize,
    kube_status: &ContainerStatus,
    changes: &mut PodActions,
) -> bool {
    let container = &pod.spec.containers[idx];
    let api_status = match pod.status.container_status(&container.name) {
        Some(s) => s,
        None => return false,
    };
    if api_status.state.running.is_none()
        || api_status.resources.is_none()
        || kube_status.state != ContainerState::Running
        || api_status.container_id.as_deref() != Some(kube_status.id.to_string().as_str())
        || !lists_semantic_eq(
            &container.resources.requests,
            &container.resources_allocated,
        )
    {
        return false;
    }

    let desired = desired_resources(container);
    let current = current_resources(api_status, kube_status);
    if desired.memory_limit == current.memory_limit
        && desired.cpu_limit == current.cpu_limit
        && desired.cpu_request == current.cpu_request
    {
        return false;
    }

    let kinds = [
        ResizeKind::MemoryLimit,
        ResizeKind::CpuLimit,
        ResizeKind::CpuRequest,
    ];
    let changed: Vec<ResizeKind> = kinds
        .iter()
        .copied()
        .filter(|k| desired.value(*k) != current.value(*k))
        .collect();

    if changed
        .iter()
        .any(|k| container.resize_requires_restart(k.resource_name()))
    {
        changes.containers_to_kill.insert(
            kube_status.id.clone(),
            ContainerToKillInfo {
                container: container.clone(),
                name: kube_status.name.clone(),
                message: format!("Container {} resize requires restart", container.name),
            },
        );
        changes.containers_to_restart.push(idx);
        changes.update_pod_resources = true;
        return true;
    }

    for kind in changed {
        let info = ContainerToUpdateInfo {
            index: idx,
            container: container.clone(),
            api_status: api_status.clone(),
            kube_status: kube_status.clone(),
            desired,
            current,
        };
        let list = changes.containers_to_update.entry(kind).or_default();
        if desired.value(kind) > current.value(kind) {
            list.push(info);
        } else {
            list.insert(0, info);
        }
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::container::{hash_container, ContainerResizePolicy, ResourceResizePolicy};
    use crate::pod::{ContainerStateRunning, ObjectMeta, PodSpec};
    use crate::resources::{Quantity, ResourceRequirements, CPU, MEMORY};
    use crate::runtime::types::{NicStatus, PodSandboxMetadata};
    use chrono::{TimeZone, Utc};

    fn container(name: &str) -> Container {
        Container {
            name: name.to_owned(),
            image: "busybox".to_owned(),
            ..Default::default()
        }
    }

    fn pod_with(containers: Vec<Container>, init_containers: Vec<Container>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: "foo".to_owned(),
                namespace: Some("new".to_owned()),
                uid: "12345678".to_owned(),
                ..Default::default()
            },
            spec: PodSpec {
                containers,
                init_containers,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn ready_sandbox() -> PodSandboxStatus {
        PodSandboxStatus {
            id: "sandbox".to_owned(),
            metadata: PodSandboxMetadata {
                name: "foo".to_owned(),
                uid: "12345678".to_owned(),
                namespace: "new".to_owned(),
                attempt: 0,
                ..Default::default()
            },
            state: PodSandboxState::Ready,
            ip: "10.0.0.1".to_owned(),
            ..Default::default()
        }
    }

    fn status_of(c: &Container, state: ContainerState, created: i64) -> ContainerStatus {
        ContainerStatus {
            id: ContainerId::new("fake", &format!("{}-{}", c.name, created)),
            name: c.name.clone(),
            state,
            created_at: Utc.timestamp_opt(created, 0).unwrap(),
            started_at: None,
            finished_at: None,
            exit_code: 0,
            image: c.image.clone(),
            image_id: String::new(),
            hash: hash_container(c),
            restart_count: 0,
            reason: String::new(),
            message: String::new(),
            resources: None,
        }
    }

    fn running_status(pod: &Pod) -> PodStatus {
        PodStatus {
            id: pod.pod_uid().to_owned(),
            sandbox_statuses: vec![ready_sandbox()],
            container_statuses: pod
                .spec
                .containers
                .iter()
                .map(|c| status_of(c, ContainerState::Running, 10))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_pod_creates_sandbox_and_starts_everything() {
        let pod = pod_with(vec![container("foo1"), container("foo2")], vec![]);
        let actions = compute_pod_actions(
            &pod,
            &PodStatus::default(),
            &ResultsManager::default(),
            PlannerFeatures::default(),
        );
        assert!(actions.create_sandbox);
        assert!(actions.kill_pod);
        assert_eq!(actions.attempt, 0);
        assert_eq!(actions.containers_to_start, vec![0, 1]);
    }

    #[test]
    fn test_steady_state_does_nothing() {
        let pod = pod_with(vec![container("foo1"), container("foo2")], vec![]);
        let actions = compute_pod_actions(
            &pod,
            &running_status(&pod),
            &ResultsManager::default(),
            PlannerFeatures::default(),
        );
        assert_eq!(
            actions,
            PodActions {
                sandbox_id: "sandbox".to_owned(),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_not_ready_sandbox_is_recreated_with_next_attempt() {
        let pod = pod_with(vec![container("foo1")], vec![]);
        let mut status = running_status(&pod);
        status.sandbox_statuses[0].state = PodSandboxState::NotReady;
        let actions = compute_pod_actions(
            &pod,
            &status,
            &ResultsManager::default(),
            PlannerFeatures::default(),
        );
        assert!(actions.create_sandbox && actions.kill_pod);
        assert_eq!(actions.attempt, 1);
        assert_eq!(actions.sandbox_id, "sandbox");
        assert_eq!(actions.containers_to_start, vec![0]);
    }

    #[test]
    fn test_network_namespace_change_drops_sandbox_id() {
        let mut pod = pod_with(vec![container("foo1")], vec![]);
        pod.spec.host_network = true;
        let (create, attempt, id) = pod_sandbox_changed(&pod, &running_status(&pod));
        assert!(create);
        assert_eq!(attempt, 1);
        assert!(id.is_empty());
    }

    #[test]
    fn test_completed_pod_with_never_policy_gets_no_new_sandbox() {
        let mut pod = pod_with(vec![container("foo1")], vec![]);
        pod.spec.restart_policy = RestartPolicy::Never;
        let mut status = running_status(&pod);
        status.sandbox_statuses[0].state = PodSandboxState::NotReady;
        status.container_statuses[0].state = ContainerState::Exited;
        let actions = compute_pod_actions(
            &pod,
            &status,
            &ResultsManager::default(),
            PlannerFeatures::default(),
        );
        assert!(actions.kill_pod);
        assert!(!actions.create_sandbox);
        assert!(actions.containers_to_start.is_empty());
    }

    #[test]
    fn test_changed_definition_kills_and_restarts() {
        let pod = pod_with(vec![container("foo1"), container("foo2")], vec![]);
        let mut status = running_status(&pod);
        status.container_statuses[1].hash = 42;
        let actions = compute_pod_actions(
            &pod,
            &status,
            &ResultsManager::default(),
            PlannerFeatures::default(),
        );
        assert_eq!(actions.containers_to_start, vec![1]);
        let killed = &actions.containers_to_kill[&status.container_statuses[1].id];
        assert_eq!(killed.message, "Container foo2 definition changed, will be restarted");
        assert!(!actions.kill_pod);
    }

    #[test]
    fn test_liveness_failure_respects_restart_policy() {
        let mut pod = pod_with(vec![container("foo1")], vec![]);
        let status = running_status(&pod);
        let liveness = ResultsManager::default();
        liveness.set(status.container_statuses[0].id.clone(), ProbeResult::Failure);

        let actions =
            compute_pod_actions(&pod, &status, &liveness, PlannerFeatures::default());
        assert_eq!(actions.containers_to_start, vec![0]);
        assert_eq!(actions.containers_to_kill.len(), 1);

        pod.spec.restart_policy = RestartPolicy::Never;
        let actions =
            compute_pod_actions(&pod, &status, &liveness, PlannerFeatures::default());
        assert!(actions.containers_to_start.is_empty());
        assert_eq!(actions.containers_to_kill.len(), 1);
        assert!(actions.kill_pod);
    }

    #[test]
    fn test_exited_containers_follow_restart_policy() {
        let mut pod = pod_with(vec![container("ok"), container("bad")], vec![]);
        let mut status = running_status(&pod);
        for s in status.container_statuses.iter_mut() {
            s.state = ContainerState::Exited;
        }
        status.container_statuses[1].exit_code = 1;

        pod.spec.restart_policy = RestartPolicy::OnFailure;
        let actions = compute_pod_actions(
            &pod,
            &status,
            &ResultsManager::default(),
            PlannerFeatures::default(),
        );
        assert_eq!(actions.containers_to_start, vec![1]);

        pod.spec.restart_policy = RestartPolicy::Never;
        let actions = compute_pod_actions(
            &pod,
            &status,
            &ResultsManager::default(),
            PlannerFeatures::default(),
        );
        assert!(actions.containers_to_start.is_empty());
        assert!(actions.kill_pod);
    }

    #[test]
    fn test_terminating_pod_is_never_restarted() {
        let mut pod = pod_with(vec![container("foo1")], vec![]);
        pod.metadata.deletion_timestamp = Some(Utc::now());
        let mut status = running_status(&pod);
        status.container_statuses[0].state = ContainerState::Exited;
        assert!(!should_container_be_restarted(
            &pod.spec.containers[0],
            &pod,
            &status
        ));
        status.container_statuses.clear();
        assert!(!should_container_be_restarted(
            &pod.spec.containers[0],
            &pod,
            &status
        ));
    }

    #[test]
    fn test_unknown_container_is_killed_before_restart() {
        let pod = pod_with(vec![container("foo1")], vec![]);
        let mut status = running_status(&pod);
        status.container_statuses[0].state = ContainerState::Unknown;
        let actions = compute_pod_actions(
            &pod,
            &status,
            &ResultsManager::default(),
            PlannerFeatures::default(),
        );
        assert_eq!(actions.containers_to_start, vec![0]);
        assert!(actions.containers_to_kill[&status.container_statuses[0].id]
            .message
            .contains("unknown"));
    }

    #[test]
    fn test_init_containers_gate_regular_containers() {
        let init = container("init1");
        let pod = pod_with(vec![container("foo1")], vec![init.clone()]);
        let mut status = running_status(&pod);
        status.container_statuses = vec![status_of(&init, ContainerState::Running, 5)];

        let actions = compute_pod_actions(
            &pod,
            &status,
            &ResultsManager::default(),
            PlannerFeatures::default(),
        );
        assert!(actions.containers_to_start.is_empty());
        assert!(actions.next_init_container_to_start.is_none());
        assert!(!actions.kill_pod);

        status.container_statuses[0].state = ContainerState::Exited;
        let actions = compute_pod_actions(
            &pod,
            &status,
            &ResultsManager::default(),
            PlannerFeatures::default(),
        );
        assert_eq!(actions.containers_to_start, vec![0]);
    }

    #[test]
    fn test_failed_init_container() {
        let init1 = container("init1");
        let init2 = container("init2");
        let mut pod = pod_with(vec![container("foo1")], vec![init1.clone(), init2.clone()]);
        let mut status = running_status(&pod);
        let mut failed = status_of(&init2, ContainerState::Exited, 6);
        failed.exit_code = 2;
        status.container_statuses = vec![failed, status_of(&init1, ContainerState::Exited, 5)];

        let actions = compute_pod_actions(
            &pod,
            &status,
            &ResultsManager::default(),
            PlannerFeatures::default(),
        );
        assert_eq!(actions.next_init_container_to_start, Some(init2));

        pod.spec.restart_policy = RestartPolicy::Never;
        let actions = compute_pod_actions(
            &pod,
            &status,
            &ResultsManager::default(),
            PlannerFeatures::default(),
        );
        assert!(actions.kill_pod);
        assert!(actions.next_init_container_to_start.is_none());
    }

    #[test]
    fn test_find_next_init_container_progression() {
        let init1 = container("init1");
        let init2 = container("init2");
        let pod = pod_with(vec![], vec![init1.clone(), init2.clone()]);
        let mut status = PodStatus::default();

        let (_, next, done) = find_next_init_container_to_run(&pod, &status);
        assert_eq!(next.map(|c| c.name.as_str()), Some("init1"));
        assert!(!done);

        status.container_statuses = vec![status_of(&init1, ContainerState::Exited, 1)];
        let (_, next, done) = find_next_init_container_to_run(&pod, &status);
        assert_eq!(next.map(|c| c.name.as_str()), Some("init2"));
        assert!(!done);

        status
            .container_statuses
            .insert(0, status_of(&init2, ContainerState::Exited, 2));
        let (_, next, done) = find_next_init_container_to_run(&pod, &status);
        assert!(next.is_none());
        assert!(done);
    }

    #[test]
    fn test_nic_hotplug_detaches_removed_nic() {
        let nic = |name: &str, port: &str| Nic {
            name: name.to_owned(),
            port_id: port.to_owned(),
            ..Default::default()
        };
        let mut pod = pod_with(vec![container("foo1")], vec![]);
        pod.spec.nics = vec![nic("eth0", "port12345")];
        let mut status = running_status(&pod);
        status.sandbox_statuses[0].nics = Some(vec![
            NicStatus {
                name: "eth0".to_owned(),
                port_id: "port12345".to_owned(),
                ready: true,
            },
            NicStatus {
                name: "eth9".to_owned(),
                port_id: "port99999".to_owned(),
                ready: true,
            },
        ]);
        let features = PlannerFeatures {
            nic_hotplug: true,
            ..Default::default()
        };
        let actions = compute_pod_actions(&pod, &status, &ResultsManager::default(), features);
        let detach: Vec<&str> = actions
            .hotplugs
            .nics_to_detach
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(detach, vec!["eth9"]);
        assert!(actions.hotplugs.nics_to_attach.is_empty());

        pod.spec.nics.push(nic("eth1", "port1"));
        pod.spec.nics.push(nic("eth2", "  "));
        let actions = compute_pod_actions(&pod, &status, &ResultsManager::default(), features);
        let attach: Vec<&str> = actions
            .hotplugs
            .nics_to_attach
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(attach, vec!["eth1"]);

        status.sandbox_statuses[0].nics = None;
        let actions = compute_pod_actions(&pod, &status, &ResultsManager::default(), features);
        assert!(actions.hotplugs.is_empty());
    }

    #[test]
    fn test_no_nic_hotplug_for_pod_being_torn_down() {
        let mut pod = pod_with(vec![container("foo1")], vec![]);
        pod.spec.restart_policy = RestartPolicy::Never;
        pod.spec.nics = vec![Nic {
            name: "eth1".to_owned(),
            port_id: "port1".to_owned(),
            ..Default::default()
        }];
        let mut status = running_status(&pod);
        status.container_statuses[0].state = ContainerState::Exited;
        status.sandbox_statuses[0].nics = Some(vec![NicStatus {
            name: "eth9".to_owned(),
            port_id: "port99999".to_owned(),
            ready: true,
        }]);
        let features = PlannerFeatures {
            nic_hotplug: true,
            ..Default::default()
        };
        let actions = compute_pod_actions(&pod, &status, &ResultsManager::default(), features);
        assert!(actions.kill_pod);
        assert!(!actions.create_sandbox);
        assert!(actions.hotplugs.is_empty());
    }

    fn resources(cpu_req: &str, cpu_lim: &str, mem_lim: &str) -> ResourceRequirements {
        let mut r = ResourceRequirements::default();
        r.requests.insert(CPU.to_owned(), Quantity::from(cpu_req));
        r.limits.insert(CPU.to_owned(), Quantity::from(cpu_lim));
        r.limits.insert(MEMORY.to_owned(), Quantity::from(mem_lim));
        r
    }

    // A pod whose containers run with `applied` and whose spec asks for `wanted`.
    fn resized_pod(specs: &[(&str, ResourceRequirements, ResourceRequirements)]) -> (Pod, PodStatus) {
        let containers: Vec<Container> = specs
            .iter()
            .map(|(name, wanted, _)| Container {
                resources: wanted.clone(),
                resources_allocated: wanted.requests.clone(),
                ..container(name)
            })
            .collect();
        let mut pod = pod_with(containers, vec![]);
        let status = running_status(&pod);
        pod.status.container_statuses = specs
            .iter()
            .zip(status.container_statuses.iter())
            .map(|((name, _, applied), s)| pod::ContainerStatus {
                name: name.to_string(),
                state: pod::ContainerState {
                    running: Some(ContainerStateRunning::default()),
                    ..Default::default()
                },
                container_id: Some(s.id.to_string()),
                resources: Some(applied.clone()),
                ..Default::default()
            })
            .collect();
        (pod, status)
    }

    #[test]
    fn test_resize_orders_decreases_before_increases() {
        let (pod, status) = resized_pod(&[
            ("grow", resources("500m", "1", "200Mi"), resources("500m", "500m", "100Mi")),
            ("shrink", resources("500m", "250m", "50Mi"), resources("500m", "500m", "100Mi")),
        ]);
        let features = PlannerFeatures {
            in_place_resize: true,
            ..Default::default()
        };
        let actions = compute_pod_actions(&pod, &status, &ResultsManager::default(), features);
        assert!(actions.containers_to_kill.is_empty());
        assert!(actions.containers_to_start.is_empty());
        assert!(!actions.kill_pod);

        for kind in [ResizeKind::MemoryLimit, ResizeKind::CpuLimit] {
            let names: Vec<&str> = actions.containers_to_update[&kind]
                .iter()
                .map(|i| i.container.name.as_str())
                .collect();
            assert_eq!(names, vec!["shrink", "grow"], "{}", kind);
        }
        assert!(!actions.containers_to_update.contains_key(&ResizeKind::CpuRequest));

        let off = compute_pod_actions(
            &pod,
            &status,
            &ResultsManager::default(),
            PlannerFeatures::default(),
        );
        assert!(off.containers_to_update.is_empty());
    }

    #[test]
    fn test_resize_requiring_restart() {
        let (mut pod, status) = resized_pod(&[(
            "app",
            resources("500m", "500m", "200Mi"),
            resources("500m", "500m", "100Mi"),
        )]);
        pod.spec.containers[0].resize_policy = vec![ContainerResizePolicy {
            resource_name: MEMORY.to_owned(),
            policy: ResourceResizePolicy::RestartContainer,
        }];
        let features = PlannerFeatures {
            in_place_resize: true,
            ..Default::default()
        };
        let actions = compute_pod_actions(&pod, &status, &ResultsManager::default(), features);
        assert_eq!(actions.containers_to_restart, vec![0]);
        assert!(actions.update_pod_resources);
        assert_eq!(
            actions.containers_to_kill[&status.container_statuses[0].id].message,
            "Container app resize requires restart"
        );
        // The only container is being restarted, which does not tear the pod down.
        assert!(!actions.kill_pod);
        assert!(actions.containers_to_update.is_empty());
    }

    #[test]
    fn test_resize_waits_for_admission_and_matching_ids() {
        let (mut pod, status) = resized_pod(&[(
            "app",
            resources("1", "1", "200Mi"),
            resources("500m", "1", "200Mi"),
        )]);
        let features = PlannerFeatures {
            in_place_resize: true,
            ..Default::default()
        };
        pod.spec.containers[0].resources_allocated =
            resources("500m", "1", "200Mi").requests;
        let actions = compute_pod_actions(&pod, &status, &ResultsManager::default(), features);
        assert!(actions.containers_to_update.is_empty());

        pod.spec.containers[0].resources_allocated =
            pod.spec.containers[0].resources.requests.clone();
        pod.status.container_statuses[0].container_id = Some("fake://other".to_owned());
        let actions = compute_pod_actions(&pod, &status, &ResultsManager::default(), features);
        assert!(actions.containers_to_update.is_empty());

        pod.status.container_statuses[0].container_id =
            Some(status.container_statuses[0].id.to_string());
        let actions = compute_pod_actions(&pod, &status, &ResultsManager::default(), features);
        assert_eq!(actions.containers_to_update[&ResizeKind::CpuRequest].len(), 1);
    }

    #[test]
    fn test_runtime_reported_resources_win() {
        let (pod, mut status) = resized_pod(&[(
            "app",
            resources("500m", "1", "200Mi"),
            resources("500m", "500m", "200Mi"),
        )]);
        status.container_statuses[0].resources = Some(resources("500m", "1", "200Mi"));
        let features = PlannerFeatures {
            in_place_resize: true,
            ..Default::default()
        };
        let actions = compute_pod_actions(&pod, &status, &ResultsManager::default(), features);
        assert!(actions.containers_to_update.is_empty());
    }
}
