//! `kuberuntime` reconciles pods against the runtime services of the node. The
//! [`RuntimeManager`] reads the observed state of a pod, plans what has to change with
//! [`compute_pod_actions`] and drives the runtime through a fixed sequence of steps.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info};

use crate::backoff::{Backoff, Clock, RealClock};
use crate::cm::{InMemoryPodContainerManager, PodContainerManager};
use crate::config::Config;
use crate::container::PodStatus;
use crate::events::{EventRecorder, LoggingRecorder};
use crate::images::ImageManager;
use crate::pod::Pod;
use crate::prober::ResultsManager;
use crate::runtime::types::{PodSandboxState, VersionResponse};
use crate::runtime::{PodRuntimeBindings, RuntimeRegistry, RuntimeStatusMap};

mod actions;
mod container;
mod hotplug;
pub mod labels;
mod resize;
mod result;
mod sandbox;
mod status;
mod sync;

pub use actions::{
    compute_nic_hotplugs, compute_pod_actions, find_next_init_container_to_run,
    is_init_container_failed, network_namespace_for_pod, pod_sandbox_changed,
    should_container_be_restarted, ContainerResources, ContainerToKillInfo,
    ContainerToUpdateInfo, Hotplugs, PlannerFeatures, PodActions,
};
pub use container::{generate_linux_container_resources, stable_key};
pub use result::{PodSyncResult, SyncAction, SyncError, SyncErrors, SyncResult};
pub use status::{generate_api_pod_status, to_kubelet_container_status};

/// The CRI API version asked for when querying runtime versions.
pub const RUNTIME_API_VERSION: &str = "0.1.0";

/// Drives pods on the runtime services of a [`RuntimeRegistry`].
pub struct RuntimeManager {
    bindings: PodRuntimeBindings,
    image_manager: ImageManager,
    container_backoff: Backoff,
    liveness: Arc<ResultsManager>,
    cgroups: Arc<dyn PodContainerManager>,
    recorder: Arc<dyn EventRecorder>,
    pod_logs_root: PathBuf,
    features: PlannerFeatures,
    default_termination_grace_period: i64,
    min_kill_grace_period: i64,
}

/// Builds a [`RuntimeManager`]. Collaborators that are not set explicitly get working defaults:
/// events go to the log, cgroups are kept in memory and time is the wall clock.
pub struct RuntimeManagerBuilder {
    registry: Arc<RuntimeRegistry>,
    config: Config,
    clock: Arc<dyn Clock>,
    recorder: Arc<dyn EventRecorder>,
    cgroups: Arc<dyn PodContainerManager>,
    liveness: Arc<ResultsManager>,
}

impl RuntimeManagerBuilder {
    /// Sets the event sink.
    pub fn recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Sets the pod cgroup manager.
    pub fn pod_container_manager(mut self, cgroups: Arc<dyn PodContainerManager>) -> Self {
        self.cgroups = cgroups;
        self
    }

    /// Sets the store liveness results are read from.
    pub fn liveness_results(mut self, liveness: Arc<ResultsManager>) -> Self {
        self.liveness = liveness;
        self
    }

    /// Sets the clock back-off windows are measured with.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the manager.
    pub fn build(self) -> RuntimeManager {
        let config = self.config;
        let image_backoff = Backoff::with_clock(
            config.backoff_base,
            config.backoff_max,
            Arc::clone(&self.clock),
        );
        RuntimeManager {
            bindings: PodRuntimeBindings::new(self.registry),
            image_manager: ImageManager::new(image_backoff, Arc::clone(&self.recorder)),
            container_backoff: Backoff::with_clock(
                config.backoff_base,
                config.backoff_max,
                self.clock,
            ),
            liveness: self.liveness,
            cgroups: self.cgroups,
            recorder: self.recorder,
            pod_logs_root: config.pod_logs_root,
            features: PlannerFeatures {
                in_place_resize: config.in_place_resize_enabled,
                nic_hotplug: config.nic_hotplug_enabled,
            },
            default_termination_grace_period: config.default_termination_grace_period,
            min_kill_grace_period: config.min_kill_grace_period,
        }
    }
}

impl RuntimeManager {
    /// Starts building a manager over the given registry.
    pub fn builder(registry: Arc<RuntimeRegistry>, config: &Config) -> RuntimeManagerBuilder {
        RuntimeManagerBuilder {
            registry,
            config: config.clone(),
            clock: Arc::new(RealClock),
            recorder: Arc::new(LoggingRecorder),
            cgroups: Arc::new(InMemoryPodContainerManager::default()),
            liveness: Arc::new(ResultsManager::default()),
        }
    }

    /// The pod to runtime bindings.
    pub fn bindings(&self) -> &PodRuntimeBindings {
        &self.bindings
    }

    /// The liveness results the planner reads.
    pub fn liveness_results(&self) -> &Arc<ResultsManager> {
        &self.liveness
    }

    /// The version of the primary runtime.
    pub async fn version(&self) -> anyhow::Result<VersionResponse> {
        let primary = self.bindings.registry().get_primary_runtime_service()?;
        primary.service.version(RUNTIME_API_VERSION).await
    }

    /// The readiness of every runtime service.
    pub async fn status(&self) -> RuntimeStatusMap {
        self.bindings.registry().get_all_runtime_status().await
    }

    /// Whether the primary runtime reports every condition as holding.
    pub async fn primary_runtime_ready(&self) -> bool {
        let primary = match self.bindings.registry().get_primary_runtime_service() {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "no primary runtime");
                return false;
            }
        };
        match primary.service.status().await {
            Ok(status) => status.is_ready(),
            Err(e) => {
                debug!(name = %primary.name, error = %e, "primary runtime status failed");
                false
            }
        }
    }

    /// Plans the sync of a pod with the features this manager was configured with.
    pub fn compute_pod_actions(&self, pod: &Pod, status: &PodStatus) -> PodActions {
        compute_pod_actions(pod, status, &self.liveness, self.features)
    }

    /// Reboots the VM of a pod.
    pub async fn reboot_vm(&self, pod_uid: &str) -> anyhow::Result<()> {
        let (endpoint, sandbox_id) = self.ready_sandbox_of(pod_uid).await?;
        info!(pod_uid, sandbox_id = %sandbox_id, "rebooting vm");
        endpoint.service.reboot_vm(&sandbox_id).await
    }

    /// Snapshots the VM of a pod.
    pub async fn create_snapshot(&self, pod_uid: &str, snapshot_id: &str) -> anyhow::Result<()> {
        let (endpoint, sandbox_id) = self.ready_sandbox_of(pod_uid).await?;
        info!(pod_uid, sandbox_id = %sandbox_id, snapshot_id, "creating vm snapshot");
        endpoint
            .service
            .create_snapshot(&sandbox_id, snapshot_id)
            .await
    }

    /// Restores the VM of a pod to a snapshot.
    pub async fn restore_to_snapshot(
        &self,
        pod_uid: &str,
        snapshot_id: &str,
    ) -> anyhow::Result<()> {
        let (endpoint, sandbox_id) = self.ready_sandbox_of(pod_uid).await?;
        info!(pod_uid, sandbox_id = %sandbox_id, snapshot_id, "restoring vm snapshot");
        endpoint
            .service
            .restore_to_snapshot(&sandbox_id, snapshot_id)
            .await
    }

    async fn ready_sandbox_of(
        &self,
        pod_uid: &str,
    ) -> anyhow::Result<(crate::runtime::RuntimeEndpoint, String)> {
        let endpoint = self.bindings.get_runtime_service_by_pod_id(pod_uid).await?;
        let ids = self
            .sandbox_ids_for_pod(endpoint.service.as_ref(), pod_uid, Some(PodSandboxState::Ready))
            .await?;
        match ids.into_iter().next() {
            Some(id) => Ok((endpoint, id)),
            None => Err(anyhow::anyhow!("pod {} has no ready sandbox", pod_uid)),
        }
    }
}

// Runtime timestamps are nanoseconds since the epoch; zero means unset.
pub(crate) fn from_runtime_timestamp(nanos: i64) -> Option<DateTime<Utc>> {
    if nanos == 0 {
        None
    } else {
        Some(Utc.timestamp_nanos(nanos))
    }
}
