//! In-memory runtime and image services that record every call. They back the tests of the
//! registry, the binding cache and the sync executor, and are usable by downstream crates.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use super::registry::{Connector, EndpointSpec};
use super::types::{
    Container, ContainerConfig, ContainerFilter, ContainerMetadata, ContainerStatus, Image,
    ImageSpec, LinuxContainerResources, NicStatus, PodSandbox, PodSandboxConfig,
    PodSandboxFilter, PodSandboxState, PodSandboxStatus, RuntimeCondition, RuntimeStatus,
    VersionResponse,
};
use super::{ImageService, RuntimeService};
use crate::container::ContainerState;
use crate::pod::Nic;

/// The IP every fake sandbox gets.
pub const FAKE_POD_SANDBOX_IP: &str = "192.168.192.168";

/// An ordered log of calls, shareable between fakes so ordering across them can be asserted.
pub type Journal = Arc<Mutex<Vec<String>>>;

/// A container held by the fake runtime.
#[derive(Clone, Debug)]
pub struct FakeContainer {
    /// Owning sandbox.
    pub pod_sandbox_id: String,
    /// Status returned by `container_status`.
    pub status: ContainerStatus,
}

#[derive(Default)]
struct FakeState {
    sandboxes: BTreeMap<String, PodSandboxStatus>,
    containers: BTreeMap<String, FakeContainer>,
    errors: HashMap<String, String>,
    updated_resources: BTreeMap<String, LinuxContainerResources>,
    not_ready: bool,
    status_error: bool,
    report_nics: bool,
    report_resources: bool,
    delay: Duration,
    clock: i64,
}

impl FakeState {
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }
}

/// A runtime service backed by in-memory maps.
pub struct FakeRuntimeService {
    runtime_name: String,
    state: Mutex<FakeState>,
    journal: Journal,
}

impl FakeRuntimeService {
    /// Creates an empty runtime with its own journal.
    pub fn new(runtime_name: &str) -> Self {
        Self::with_journal(runtime_name, Journal::default())
    }

    /// Creates an empty runtime that records into the given journal.
    pub fn with_journal(runtime_name: &str, journal: Journal) -> Self {
        FakeRuntimeService {
            runtime_name: runtime_name.to_owned(),
            state: Mutex::new(FakeState::default()),
            journal,
        }
    }

    async fn enter(&self, op: &str, detail: &str) -> anyhow::Result<MutexGuard<'_, FakeState>> {
        let delay = self.state.lock().await.delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let entry = if detail.is_empty() {
            op.to_owned()
        } else {
            format!("{} {}", op, detail)
        };
        self.journal.lock().await.push(entry);
        let state = self.state.lock().await;
        if let Some(msg) = state.errors.get(op) {
            return Err(anyhow::anyhow!("{}", msg));
        }
        Ok(state)
    }

    /// Replaces every sandbox.
    pub async fn set_fake_sandboxes(&self, sandboxes: Vec<PodSandboxStatus>) {
        let mut state = self.state.lock().await;
        state.sandboxes = sandboxes.into_iter().map(|s| (s.id.clone(), s)).collect();
    }

    /// Replaces every container.
    pub async fn set_fake_containers(&self, containers: Vec<FakeContainer>) {
        let mut state = self.state.lock().await;
        state.containers = containers
            .into_iter()
            .map(|c| (c.status.id.clone(), c))
            .collect();
    }

    /// Every sandbox.
    pub async fn sandboxes(&self) -> Vec<PodSandboxStatus> {
        self.state.lock().await.sandboxes.values().cloned().collect()
    }

    /// Every container.
    pub async fn containers(&self) -> Vec<FakeContainer> {
        self.state.lock().await.containers.values().cloned().collect()
    }

    /// Resources last written to each container.
    pub async fn updated_resources(&self) -> BTreeMap<String, LinuxContainerResources> {
        self.state.lock().await.updated_resources.clone()
    }

    /// Mutates one container in place.
    pub async fn modify_container<F: FnOnce(&mut ContainerStatus)>(&self, id: &str, f: F) {
        if let Some(c) = self.state.lock().await.containers.get_mut(id) {
            f(&mut c.status)
        }
    }

    /// Makes every call of the named operation fail.
    pub async fn inject_error(&self, op: &str, message: &str) {
        self.state
            .lock()
            .await
            .errors
            .insert(op.to_owned(), message.to_owned());
    }

    /// Clears injected errors.
    pub async fn clear_errors(&self) {
        self.state.lock().await.errors.clear();
    }

    /// Sets whether the runtime reports itself ready.
    pub async fn set_ready(&self, ready: bool) {
        self.state.lock().await.not_ready = !ready;
    }

    /// Makes the status probe itself fail.
    pub async fn set_status_error(&self, fail: bool) {
        self.state.lock().await.status_error = fail;
    }

    /// Makes new sandboxes carry NIC details.
    pub async fn set_report_nics(&self, report: bool) {
        self.state.lock().await.report_nics = report;
    }

    /// Makes container statuses carry the resources last applied.
    pub async fn set_report_resources(&self, report: bool) {
        self.state.lock().await.report_resources = report;
    }

    /// Delays every call.
    pub async fn set_delay(&self, delay: Duration) {
        self.state.lock().await.delay = delay;
    }

    /// Calls seen so far, in order.
    pub async fn calls(&self) -> Vec<String> {
        self.journal.lock().await.clone()
    }

    /// Forgets recorded calls.
    pub async fn clear_calls(&self) {
        self.journal.lock().await.clear();
    }
}

fn not_found(what: &str, id: &str) -> anyhow::Error {
    anyhow::anyhow!("{} {:?} not found", what, id)
}

#[async_trait::async_trait]
impl RuntimeService for FakeRuntimeService {
    async fn version(&self, _api_version: &str) -> anyhow::Result<VersionResponse> {
        let _state = self.enter("Version", "").await?;
        Ok(VersionResponse {
            version: "0.1.0".to_owned(),
            runtime_name: self.runtime_name.clone(),
            runtime_version: "0.1.0".to_owned(),
            runtime_api_version: "v1".to_owned(),
        })
    }

    async fn status(&self) -> anyhow::Result<RuntimeStatus> {
        let state = self.enter("Status", "").await?;
        if state.status_error {
            return Err(anyhow::anyhow!("runtime {} unreachable", self.runtime_name));
        }
        Ok(RuntimeStatus {
            conditions: vec![
                RuntimeCondition {
                    type_: "RuntimeReady".to_owned(),
                    status: !state.not_ready,
                    ..Default::default()
                },
                RuntimeCondition {
                    type_: "NetworkReady".to_owned(),
                    status: true,
                    ..Default::default()
                },
            ],
        })
    }

    async fn run_pod_sandbox(
        &self,
        config: &PodSandboxConfig,
        _runtime_handler: &str,
    ) -> anyhow::Result<String> {
        let m = &config.metadata;
        let id = format!("{}_{}_{}_{}", m.name, m.namespace, m.uid, m.attempt);
        let mut state = self.enter("RunPodSandbox", &id).await?;
        let created_at = state.tick();
        let nics = if state.report_nics {
            Some(
                config
                    .nics
                    .iter()
                    .map(|n| NicStatus {
                        name: n.name.clone(),
                        port_id: n.port_id.clone(),
                        ready: true,
                    })
                    .collect(),
            )
        } else {
            None
        };
        state.sandboxes.insert(
            id.clone(),
            PodSandboxStatus {
                id: id.clone(),
                metadata: config.metadata.clone(),
                state: PodSandboxState::Ready,
                created_at,
                ip: FAKE_POD_SANDBOX_IP.to_owned(),
                network_mode: config.network_mode,
                labels: config.labels.clone(),
                annotations: config.annotations.clone(),
                nics,
            },
        );
        Ok(id)
    }

    async fn stop_pod_sandbox(&self, pod_sandbox_id: &str) -> anyhow::Result<()> {
        let mut state = self.enter("StopPodSandbox", pod_sandbox_id).await?;
        let sandbox = state
            .sandboxes
            .get_mut(pod_sandbox_id)
            .ok_or_else(|| not_found("sandbox", pod_sandbox_id))?;
        sandbox.state = PodSandboxState::NotReady;
        Ok(())
    }

    async fn remove_pod_sandbox(&self, pod_sandbox_id: &str) -> anyhow::Result<()> {
        let mut state = self.enter("RemovePodSandbox", pod_sandbox_id).await?;
        state.sandboxes.remove(pod_sandbox_id);
        state
            .containers
            .retain(|_, c| c.pod_sandbox_id != pod_sandbox_id);
        Ok(())
    }

    async fn pod_sandbox_status(&self, pod_sandbox_id: &str) -> anyhow::Result<PodSandboxStatus> {
        let state = self.enter("PodSandboxStatus", pod_sandbox_id).await?;
        state
            .sandboxes
            .get(pod_sandbox_id)
            .cloned()
            .ok_or_else(|| not_found("sandbox", pod_sandbox_id))
    }

    async fn list_pod_sandbox(
        &self,
        filter: Option<&PodSandboxFilter>,
    ) -> anyhow::Result<Vec<PodSandbox>> {
        let state = self.enter("ListPodSandbox", "").await?;
        Ok(state
            .sandboxes
            .values()
            .map(|s| PodSandbox {
                id: s.id.clone(),
                metadata: s.metadata.clone(),
                state: s.state,
                created_at: s.created_at,
                labels: s.labels.clone(),
                annotations: s.annotations.clone(),
            })
            .filter(|s| filter.map(|f| f.matches(s)).unwrap_or(true))
            .collect())
    }

    async fn create_container(
        &self,
        pod_sandbox_id: &str,
        config: &ContainerConfig,
        _sandbox_config: &PodSandboxConfig,
    ) -> anyhow::Result<String> {
        let id = format!(
            "{}_{}_{}",
            pod_sandbox_id, config.metadata.name, config.metadata.attempt
        );
        let mut state = self.enter("CreateContainer", &id).await?;
        if !state.sandboxes.contains_key(pod_sandbox_id) {
            return Err(not_found("sandbox", pod_sandbox_id));
        }
        let created_at = state.tick();
        let resources = if state.report_resources {
            Some(config.resources)
        } else {
            None
        };
        state.containers.insert(
            id.clone(),
            FakeContainer {
                pod_sandbox_id: pod_sandbox_id.to_owned(),
                status: ContainerStatus {
                    id: id.clone(),
                    metadata: config.metadata.clone(),
                    state: ContainerState::Created,
                    created_at,
                    started_at: 0,
                    finished_at: 0,
                    exit_code: 0,
                    image: config.image.clone(),
                    image_ref: config.image.image.clone(),
                    reason: String::new(),
                    message: String::new(),
                    labels: config.labels.clone(),
                    annotations: config.annotations.clone(),
                    log_path: config.log_path.clone(),
                    resources,
                },
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> anyhow::Result<()> {
        let mut state = self.enter("StartContainer", container_id).await?;
        let now = state.tick();
        let c = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| not_found("container", container_id))?;
        c.status.state = ContainerState::Running;
        c.status.started_at = now;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, _timeout: i64) -> anyhow::Result<()> {
        let mut state = self.enter("StopContainer", container_id).await?;
        let now = state.tick();
        let c = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| not_found("container", container_id))?;
        c.status.state = ContainerState::Exited;
        c.status.finished_at = now;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> anyhow::Result<()> {
        let mut state = self.enter("RemoveContainer", container_id).await?;
        state.containers.remove(container_id);
        Ok(())
    }

    async fn list_containers(
        &self,
        filter: Option<&ContainerFilter>,
    ) -> anyhow::Result<Vec<Container>> {
        let state = self.enter("ListContainers", "").await?;
        Ok(state
            .containers
            .values()
            .map(|c| Container {
                id: c.status.id.clone(),
                pod_sandbox_id: c.pod_sandbox_id.clone(),
                metadata: c.status.metadata.clone(),
                image: c.status.image.clone(),
                image_ref: c.status.image_ref.clone(),
                state: c.status.state,
                created_at: c.status.created_at,
                labels: c.status.labels.clone(),
                annotations: c.status.annotations.clone(),
            })
            .filter(|c| filter.map(|f| f.matches(c)).unwrap_or(true))
            .collect())
    }

    async fn container_status(&self, container_id: &str) -> anyhow::Result<ContainerStatus> {
        let state = self.enter("ContainerStatus", container_id).await?;
        state
            .containers
            .get(container_id)
            .map(|c| c.status.clone())
            .ok_or_else(|| not_found("container", container_id))
    }

    async fn update_container_resources(
        &self,
        container_id: &str,
        resources: &LinuxContainerResources,
    ) -> anyhow::Result<()> {
        let detail = format!(
            "{} shares={} quota={} memory={}",
            container_id, resources.cpu_shares, resources.cpu_quota, resources.memory_limit_in_bytes
        );
        let mut state = self.enter("UpdateContainerResources", &detail).await?;
        let report = state.report_resources;
        let c = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| not_found("container", container_id))?;
        if report {
            c.status.resources = Some(*resources);
        }
        state
            .updated_resources
            .insert(container_id.to_owned(), *resources);
        Ok(())
    }

    async fn attach_network_interface(
        &self,
        pod_sandbox_id: &str,
        nic: &Nic,
    ) -> anyhow::Result<()> {
        let mut state = self
            .enter("AttachNetworkInterface", &format!("{} {}", pod_sandbox_id, nic.name))
            .await?;
        let sandbox = state
            .sandboxes
            .get_mut(pod_sandbox_id)
            .ok_or_else(|| not_found("sandbox", pod_sandbox_id))?;
        sandbox.nics.get_or_insert_with(Vec::new).push(NicStatus {
            name: nic.name.clone(),
            port_id: nic.port_id.clone(),
            ready: true,
        });
        Ok(())
    }

    async fn detach_network_interface(
        &self,
        pod_sandbox_id: &str,
        nic: &Nic,
    ) -> anyhow::Result<()> {
        let mut state = self
            .enter("DetachNetworkInterface", &format!("{} {}", pod_sandbox_id, nic.name))
            .await?;
        let sandbox = state
            .sandboxes
            .get_mut(pod_sandbox_id)
            .ok_or_else(|| not_found("sandbox", pod_sandbox_id))?;
        if let Some(nics) = sandbox.nics.as_mut() {
            nics.retain(|n| n.name != nic.name);
        }
        Ok(())
    }

    async fn list_network_interfaces(
        &self,
        pod_sandbox_id: &str,
    ) -> anyhow::Result<Vec<NicStatus>> {
        let state = self.enter("ListNetworkInterfaces", pod_sandbox_id).await?;
        let sandbox = state
            .sandboxes
            .get(pod_sandbox_id)
            .ok_or_else(|| not_found("sandbox", pod_sandbox_id))?;
        Ok(sandbox.nics.clone().unwrap_or_default())
    }

    async fn reboot_vm(&self, pod_sandbox_id: &str) -> anyhow::Result<()> {
        let state = self.enter("RebootVM", pod_sandbox_id).await?;
        if !state.sandboxes.contains_key(pod_sandbox_id) {
            return Err(not_found("sandbox", pod_sandbox_id));
        }
        Ok(())
    }

    async fn create_snapshot(&self, pod_sandbox_id: &str, snapshot_id: &str) -> anyhow::Result<()> {
        let state = self
            .enter("CreateSnapshot", &format!("{} {}", pod_sandbox_id, snapshot_id))
            .await?;
        if !state.sandboxes.contains_key(pod_sandbox_id) {
            return Err(not_found("sandbox", pod_sandbox_id));
        }
        Ok(())
    }

    async fn restore_to_snapshot(
        &self,
        pod_sandbox_id: &str,
        snapshot_id: &str,
    ) -> anyhow::Result<()> {
        let state = self
            .enter("RestoreToSnapshot", &format!("{} {}", pod_sandbox_id, snapshot_id))
            .await?;
        if !state.sandboxes.contains_key(pod_sandbox_id) {
            return Err(not_found("sandbox", pod_sandbox_id));
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeImageState {
    images: BTreeMap<String, Image>,
    pull_error: Option<String>,
}

/// An image service backed by an in-memory map.
#[derive(Default)]
pub struct FakeImageService {
    state: Mutex<FakeImageState>,
    journal: Journal,
}

impl FakeImageService {
    /// Makes the named images present.
    pub async fn set_fake_images(&self, images: &[&str]) {
        let mut state = self.state.lock().await;
        for name in images {
            state.images.insert(
                (*name).to_owned(),
                Image {
                    id: (*name).to_owned(),
                    repo_tags: vec![(*name).to_owned()],
                    ..Default::default()
                },
            );
        }
    }

    /// Makes every pull fail with the given message, or succeed again with `None`.
    pub async fn set_pull_error(&self, message: Option<&str>) {
        self.state.lock().await.pull_error = message.map(str::to_owned);
    }

    /// Calls seen so far, in order.
    pub async fn calls(&self) -> Vec<String> {
        self.journal.lock().await.clone()
    }

    async fn record(&self, op: &str, image: &str) {
        self.journal.lock().await.push(format!("{} {}", op, image));
    }
}

#[async_trait::async_trait]
impl ImageService for FakeImageService {
    async fn list_images(&self, filter: Option<&ImageSpec>) -> anyhow::Result<Vec<Image>> {
        self.record("ListImages", "").await;
        let state = self.state.lock().await;
        Ok(state
            .images
            .values()
            .filter(|i| filter.map(|f| f.image == i.id).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn image_status(&self, image: &ImageSpec) -> anyhow::Result<Option<Image>> {
        self.record("ImageStatus", &image.image).await;
        Ok(self.state.lock().await.images.get(&image.image).cloned())
    }

    async fn pull_image(
        &self,
        image: &ImageSpec,
        _sandbox_config: Option<&PodSandboxConfig>,
    ) -> anyhow::Result<String> {
        self.record("PullImage", &image.image).await;
        let mut state = self.state.lock().await;
        if let Some(msg) = state.pull_error.as_ref() {
            return Err(anyhow::anyhow!("{}", msg));
        }
        state.images.insert(
            image.image.clone(),
            Image {
                id: image.image.clone(),
                repo_tags: vec![image.image.clone()],
                ..Default::default()
            },
        );
        Ok(image.image.clone())
    }

    async fn remove_image(&self, image: &ImageSpec) -> anyhow::Result<()> {
        self.record("RemoveImage", &image.image).await;
        self.state.lock().await.images.remove(&image.image);
        Ok(())
    }
}

/// Connects every endpoint to a fresh fake service, keeping them addressable by endpoint name.
#[derive(Default)]
pub struct FakeConnector {
    runtimes: std::sync::Mutex<HashMap<String, Arc<FakeRuntimeService>>>,
    images: std::sync::Mutex<HashMap<String, Arc<FakeImageService>>>,
}

impl FakeConnector {
    /// The fake runtime created for the named endpoint.
    pub fn runtime(&self, name: &str) -> Option<Arc<FakeRuntimeService>> {
        self.runtimes.lock().ok()?.get(name).cloned()
    }

    /// The fake image service created for the named endpoint.
    pub fn image(&self, name: &str) -> Option<Arc<FakeImageService>> {
        self.images.lock().ok()?.get(name).cloned()
    }
}

impl Connector for FakeConnector {
    fn connect_runtime(&self, spec: &EndpointSpec) -> anyhow::Result<Arc<dyn RuntimeService>> {
        let fake = Arc::new(FakeRuntimeService::new(&spec.name));
        self.runtimes
            .lock()
            .map_err(|_| anyhow::anyhow!("fake connector lock poisoned"))?
            .insert(spec.name.clone(), Arc::clone(&fake));
        Ok(fake)
    }

    fn connect_image(&self, spec: &EndpointSpec) -> anyhow::Result<Arc<dyn ImageService>> {
        let fake = Arc::new(FakeImageService::default());
        self.images
            .lock()
            .map_err(|_| anyhow::anyhow!("fake connector lock poisoned"))?
            .insert(spec.name.clone(), Arc::clone(&fake));
        Ok(fake)
    }
}

/// Builds a container status the way the runtime would report it; handy for seeding fakes.
pub fn fake_container_status(
    id: &str,
    name: &str,
    attempt: u32,
    state: ContainerState,
    created_at: i64,
) -> ContainerStatus {
    ContainerStatus {
        id: id.to_owned(),
        metadata: ContainerMetadata {
            name: name.to_owned(),
            attempt,
        },
        state,
        created_at,
        started_at: 0,
        finished_at: 0,
        exit_code: 0,
        image: ImageSpec {
            image: "busybox".to_owned(),
        },
        image_ref: "busybox".to_owned(),
        reason: String::new(),
        message: String::new(),
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
        log_path: String::new(),
        resources: None,
    }
}
