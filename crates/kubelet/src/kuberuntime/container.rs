//! Starting, stopping and cleaning up containers.

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use super::actions::ContainerResources;
use super::labels::{
    get_container_info_from_annotations, get_container_info_from_labels,
    new_container_annotations, new_container_labels,
};
use super::result::{PodSyncResult, SyncAction, SyncError, SyncResult};
use super::RuntimeManager;
use crate::cm::{milli_cpu_to_quota, milli_cpu_to_shares, QUOTA_PERIOD};
use crate::container::{hash_hex, Container, ContainerId, ContainerState, PodStatus, RunningPod};
use crate::events::{self, EventType, ObjectReference};
use crate::logs::build_container_log_path;
use crate::pod::Pod;
use crate::runtime::types::{
    ContainerConfig, ContainerMetadata, ImageSpec, LinuxContainerResources, PodSandboxConfig,
};
use crate::runtime::{ImageService, RegistryError, RuntimeEndpoint};

/// The runtime resources of a container.
pub fn generate_linux_container_resources(container: &Container) -> LinuxContainerResources {
    linux_resources(&ContainerResources {
        memory_limit: container.resources.memory_limit_bytes().unwrap_or(0),
        memory_request: container.resources.memory_request_bytes().unwrap_or(0),
        cpu_limit: container.resources.cpu_limit_milli().unwrap_or(0),
        cpu_request: container.resources.cpu_request_milli().unwrap_or(0),
    })
}

// A container without a CPU request gets shares from its limit.
pub(crate) fn linux_resources(r: &ContainerResources) -> LinuxContainerResources {
    let shares_from = if r.cpu_request == 0 {
        r.cpu_limit
    } else {
        r.cpu_request
    };
    LinuxContainerResources {
        cpu_period: QUOTA_PERIOD,
        cpu_quota: milli_cpu_to_quota(r.cpu_limit, QUOTA_PERIOD),
        cpu_shares: milli_cpu_to_shares(shares_from),
        memory_limit_in_bytes: r.memory_limit,
    }
}

/// The key crash loop back-off is tracked under: one window per pod and container spec.
pub fn stable_key(pod: &Pod, container: &Container) -> String {
    format!(
        "{}_{}_{}_{}_{}",
        pod.name(),
        pod.namespace(),
        pod.pod_uid(),
        container.name,
        hash_hex(container)
    )
}

impl RuntimeManager {
    /// Builds the config a container is created with.
    pub fn generate_container_config(
        &self,
        container: &Container,
        pod: &Pod,
        restart_count: i32,
        image_ref: &str,
    ) -> Result<ContainerConfig, SyncError> {
        if container.name.is_empty() {
            return Err(SyncError::StartContainerFailed(format!(
                "container of pod {} has no name",
                pod.full_name()
            )));
        }
        let attempt = u32::try_from(restart_count).map_err(|_| {
            SyncError::StartContainerFailed(format!(
                "negative restart count {} for container {}",
                restart_count, container.name
            ))
        })?;
        Ok(ContainerConfig {
            metadata: ContainerMetadata {
                name: container.name.clone(),
                attempt,
            },
            image: ImageSpec {
                image: image_ref.to_owned(),
            },
            command: container.command.clone(),
            args: container.args.clone(),
            working_dir: container.working_dir.clone().unwrap_or_default(),
            envs: container.env.clone(),
            mounts: container.volume_mounts.clone(),
            devices: container.volume_devices.clone(),
            labels: new_container_labels(container, pod),
            annotations: new_container_annotations(container, pod, restart_count),
            log_path: build_container_log_path(&container.name, restart_count)
                .to_string_lossy()
                .into_owned(),
            stdin: container.stdin,
            tty: container.tty,
            resources: generate_linux_container_resources(container),
        })
    }

    /// Pulls the image, then creates and starts one container in the given sandbox.
    #[allow(clippy::too_many_arguments)]
    #[instrument(level = "debug", skip_all, fields(pod = %pod.full_name(), container = %container.name))]
    pub(crate) async fn start_container(
        &self,
        endpoint: &RuntimeEndpoint,
        image_service: &dyn ImageService,
        sandbox_id: &str,
        sandbox_config: &PodSandboxConfig,
        container: &Container,
        pod: &Pod,
        status: &PodStatus,
    ) -> Result<(), SyncError> {
        let object = ObjectReference::for_container(pod, &container.name);

        let image_ref = match self
            .image_manager
            .ensure_image_exists(image_service, pod, container, Some(sandbox_config))
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.recorder.event(
                    &object,
                    EventType::Warning,
                    events::FAILED,
                    &format!("Error: {}", e),
                );
                return Err(e.into());
            }
        };

        let restart_count = status
            .find_container_status_by_name(&container.name)
            .map(|s| s.restart_count + 1)
            .unwrap_or(0);

        let config = self.generate_container_config(container, pod, restart_count, &image_ref)?;
        let id = match endpoint
            .service
            .create_container(sandbox_id, &config, sandbox_config)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let message = format!("Error: {}", e);
                self.recorder
                    .event(&object, EventType::Warning, events::FAILED, &message);
                return Err(SyncError::StartContainerFailed(format!(
                    "failed to create container {}: {}",
                    container.name, e
                )));
            }
        };
        self.recorder.event(
            &object,
            EventType::Normal,
            events::CREATED,
            &format!("Created container {}", container.name),
        );

        if let Err(e) = endpoint.service.start_container(&id).await {
            self.recorder.event(
                &object,
                EventType::Warning,
                events::FAILED,
                &format!("Error: {}", e),
            );
            return Err(SyncError::StartContainerFailed(format!(
                "failed to start container {}: {}",
                container.name, e
            )));
        }
        self.recorder.event(
            &object,
            EventType::Normal,
            events::STARTED,
            &format!("Started container {}", container.name),
        );
        info!(container_id = %id, restart_count, "started container");
        Ok(())
    }

    fn grace_period(&self, pod: &Pod) -> i64 {
        pod.metadata
            .deletion_grace_period_seconds
            .or(pod.spec.termination_grace_period_seconds)
            .unwrap_or(self.default_termination_grace_period)
    }

    /// Stops one container. Without a pod spec the grace period and the event target are
    /// recovered from what the container was created with.
    pub(crate) async fn kill_container(
        &self,
        endpoint: &RuntimeEndpoint,
        pod: Option<&Pod>,
        container_id: &ContainerId,
        container_name: &str,
        message: &str,
        grace_period_override: Option<i64>,
    ) -> Result<(), SyncError> {
        let (object, grace) = match pod {
            Some(pod) => (
                ObjectReference::for_container(pod, container_name),
                self.grace_period(pod),
            ),
            None => {
                let status = endpoint
                    .service
                    .container_status(&container_id.id)
                    .await
                    .map_err(|e| {
                        SyncError::KillContainerFailed(format!(
                            "failed to read container {}: {}",
                            container_id, e
                        ))
                    })?;
                let labeled = get_container_info_from_labels(&status.labels);
                let annotated = get_container_info_from_annotations(&status.annotations);
                let object = ObjectReference {
                    name: labeled.pod_name,
                    namespace: labeled.pod_namespace,
                    tenant: labeled.pod_tenant,
                    uid: labeled.pod_uid,
                    field_path: Some(format!("spec.containers{{{}}}", container_name)),
                };
                let grace = annotated
                    .pod_termination_grace_period
                    .unwrap_or(self.default_termination_grace_period);
                (object, grace)
            }
        };
        let grace = grace_period_override.unwrap_or_else(|| grace.max(self.min_kill_grace_period));

        let message = if message.is_empty() {
            format!("Stopping container {}", container_name)
        } else {
            message.to_owned()
        };
        self.recorder
            .event(&object, EventType::Normal, events::KILLING, &message);
        debug!(container_id = %container_id, grace, "stopping container");

        endpoint
            .service
            .stop_container(&container_id.id, grace)
            .await
            .map_err(|e| {
                warn!(container_id = %container_id, error = %e, "container termination failed");
                SyncError::KillContainerFailed(format!(
                    "failed to kill container {:?}: {}",
                    container_name, e
                ))
            })?;
        info!(container_id = %container_id, container = container_name, "killed container");
        Ok(())
    }

    async fn kill_containers_with_sync_result(
        &self,
        endpoint: &RuntimeEndpoint,
        pod: Option<&Pod>,
        running: &RunningPod,
        grace_period_override: Option<i64>,
    ) -> Vec<SyncResult> {
        let kills = running.containers.iter().map(|c| async move {
            let mut result = SyncResult::new(SyncAction::KillContainer, c.name.clone());
            if let Err(e) = self
                .kill_container(endpoint, pod, &c.id, &c.name, "", grace_period_override)
                .await
            {
                let message = e.to_string();
                result.fail(e, message);
            }
            result
        });
        join_all(kills).await
    }

    pub(crate) async fn kill_pod_with_sync_result(
        &self,
        endpoint: &RuntimeEndpoint,
        pod: Option<&Pod>,
        running: &RunningPod,
        grace_period_override: Option<i64>,
    ) -> PodSyncResult {
        let mut result = PodSyncResult::default();
        for r in self
            .kill_containers_with_sync_result(endpoint, pod, running, grace_period_override)
            .await
        {
            result.add_sync_result(r);
        }

        for sandbox in &running.sandboxes {
            let mut r = SyncResult::new(SyncAction::KillPodSandbox, running.id.clone());
            if let Err(e) = endpoint.service.stop_pod_sandbox(&sandbox.id.id).await {
                let message = format!("failed to stop sandbox {:?}: {}", sandbox.id.id, e);
                r.fail(SyncError::KillPodSandboxFailed(message.clone()), message);
            }
            result.add_sync_result(r);
        }
        result
    }

    /// Stops every container and sandbox of a pod. The pod spec is optional: a pod only known
    /// from the runtime is killed with what its containers were labeled with.
    #[instrument(level = "info", skip_all, fields(pod_uid = %running.id))]
    pub async fn kill_pod(
        &self,
        pod: Option<&Pod>,
        running: &RunningPod,
        grace_period_override: Option<i64>,
    ) -> PodSyncResult {
        let endpoint = match self.bindings.get_runtime_service_by_pod_id(&running.id).await {
            Ok(e) => e,
            Err(RegistryError::PodRuntimeNotFound(_)) if running.is_empty() => {
                debug!("no runtime knows the pod, nothing to kill");
                return PodSyncResult::default();
            }
            Err(e) => {
                let mut result = PodSyncResult::default();
                result.fail(SyncError::RuntimeUnavailable(e.to_string()));
                return result;
            }
        };
        self.kill_pod_with_sync_result(&endpoint, pod, running, grace_period_override)
            .await
    }

    async fn remove_container(&self, endpoint: &RuntimeEndpoint, id: &ContainerId) {
        match endpoint.service.remove_container(&id.id).await {
            Ok(()) => self.liveness.remove(id),
            Err(e) => warn!(container_id = %id, error = %e, "failed to remove container"),
        }
    }

    /// Removes exited instances of init containers, keeping the newest one of each name so
    /// that its exit status can still be reported.
    pub(crate) async fn prune_init_containers_before_start(
        &self,
        endpoint: &RuntimeEndpoint,
        pod: &Pod,
        status: &PodStatus,
    ) {
        for init in &pod.spec.init_containers {
            let mut count = 0;
            for s in &status.container_statuses {
                if s.name != init.name
                    || !matches!(s.state, ContainerState::Exited | ContainerState::Unknown)
                {
                    continue;
                }
                count += 1;
                if count == 1 {
                    continue;
                }
                debug!(container_id = %s.id, name = %s.name, "pruning init container");
                self.remove_container(endpoint, &s.id).await;
            }
        }
    }

    /// Removes every instance of every init container.
    pub(crate) async fn purge_init_containers(
        &self,
        endpoint: &RuntimeEndpoint,
        pod: &Pod,
        status: &PodStatus,
    ) {
        for init in &pod.spec.init_containers {
            for s in status.container_statuses.iter().filter(|s| s.name == init.name) {
                debug!(container_id = %s.id, name = %s.name, "purging init container");
                self.remove_container(endpoint, &s.id).await;
            }
        }
    }

    /// Checks whether the restart of a container is held back by crash loop back-off. A
    /// container that is not held back has its window advanced.
    pub(crate) async fn do_back_off(
        &self,
        pod: &Pod,
        container: &Container,
        status: &PodStatus,
    ) -> Result<(), SyncError> {
        let last = match status
            .container_statuses
            .iter()
            .find(|s| s.name == container.name && s.state == ContainerState::Exited)
        {
            Some(s) => s,
            None => return Ok(()),
        };
        let finished_at = last.finished_at.unwrap_or(last.created_at);
        let key = stable_key(pod, container);
        if self
            .container_backoff
            .is_in_back_off_since(&key, finished_at)
            .await
        {
            self.recorder.event(
                &ObjectReference::for_container(pod, &container.name),
                EventType::Warning,
                events::BACK_OFF,
                "Back-off restarting failed container",
            );
            return Err(SyncError::CrashLoopBackOff(format!(
                "back-off {:?} restarting failed container={} pod={}",
                self.container_backoff.get(&key).await,
                container.name,
                pod.full_name()
            )));
        }
        self.container_backoff.next(&key, finished_at).await;
        Ok(())
    }
}
