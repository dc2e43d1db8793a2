//! Request and response shapes exchanged with runtime and image services.

use std::collections::BTreeMap;

use crate::container::{ContainerState, EnvVar, VolumeDevice, VolumeMount};
use crate::pod::Nic;

/// Identity of a sandbox.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodSandboxMetadata {
    /// Pod name.
    pub name: String,
    /// Pod uid.
    pub uid: String,
    /// Pod namespace.
    pub namespace: String,
    /// Pod tenant.
    pub tenant: String,
    /// How many sandboxes were created for this pod before this one.
    pub attempt: u32,
}

/// State of a sandbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodSandboxState {
    /// Ready to host containers.
    Ready,
    /// Stopped or broken.
    NotReady,
}

impl Default for PodSandboxState {
    fn default() -> Self {
        PodSandboxState::NotReady
    }
}

/// Whose namespace a sandbox uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamespaceMode {
    /// A namespace per pod.
    Pod,
    /// A namespace per container.
    Container,
    /// The node's namespace.
    Node,
}

impl Default for NamespaceMode {
    fn default() -> Self {
        NamespaceMode::Pod
    }
}

/// A sandbox as returned by a listing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodSandbox {
    /// Sandbox id.
    pub id: String,
    /// Identity.
    pub metadata: PodSandboxMetadata,
    /// State.
    pub state: PodSandboxState,
    /// Creation time in nanoseconds since the epoch.
    pub created_at: i64,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
}

/// Observed state of a NIC in a sandbox.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NicStatus {
    /// Interface name.
    pub name: String,
    /// Backing port id.
    pub port_id: String,
    /// Whether the interface is up.
    pub ready: bool,
}

/// Full status of a sandbox.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodSandboxStatus {
    /// Sandbox id.
    pub id: String,
    /// Identity.
    pub metadata: PodSandboxMetadata,
    /// State.
    pub state: PodSandboxState,
    /// Creation time in nanoseconds since the epoch.
    pub created_at: i64,
    /// Primary IP, empty if none.
    pub ip: String,
    /// Network namespace mode.
    pub network_mode: NamespaceMode,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
    /// NIC details. `None` when the runtime does not report NICs at all.
    pub nics: Option<Vec<NicStatus>>,
}

/// Everything needed to create a sandbox.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodSandboxConfig {
    /// Identity.
    pub metadata: PodSandboxMetadata,
    /// Hostname.
    pub hostname: String,
    /// Directory container logs are written to.
    pub log_directory: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
    /// Parent cgroup.
    pub cgroup_parent: String,
    /// Network namespace mode.
    pub network_mode: NamespaceMode,
    /// NICs to plug at creation.
    pub nics: Vec<Nic>,
    /// VPC the sandbox belongs to.
    pub vpc: String,
}

/// Filter for sandbox listings. Unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PodSandboxFilter {
    /// Match this id.
    pub id: Option<String>,
    /// Match this state.
    pub state: Option<PodSandboxState>,
    /// All of these labels must match.
    pub label_selector: BTreeMap<String, String>,
}

impl PodSandboxFilter {
    /// Whether the sandbox passes the filter.
    pub fn matches(&self, sandbox: &PodSandbox) -> bool {
        self.id.as_ref().map(|id| id == &sandbox.id).unwrap_or(true)
            && self.state.map(|s| s == sandbox.state).unwrap_or(true)
            && labels_match(&self.label_selector, &sandbox.labels)
    }
}

/// Identity of a container within a sandbox.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerMetadata {
    /// Container name.
    pub name: String,
    /// Restart attempt.
    pub attempt: u32,
}

/// An image reference.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageSpec {
    /// Image name or id.
    pub image: String,
}

/// A container as returned by a listing.
#[derive(Clone, Debug, PartialEq)]
pub struct Container {
    /// Container id.
    pub id: String,
    /// Owning sandbox.
    pub pod_sandbox_id: String,
    /// Identity.
    pub metadata: ContainerMetadata,
    /// Requested image.
    pub image: ImageSpec,
    /// Resolved image reference.
    pub image_ref: String,
    /// State.
    pub state: ContainerState,
    /// Creation time in nanoseconds since the epoch.
    pub created_at: i64,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
}

/// Linux resources of a container, in cgroup units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinuxContainerResources {
    /// CFS period in microseconds.
    pub cpu_period: i64,
    /// CFS quota in microseconds; zero or negative means unlimited.
    pub cpu_quota: i64,
    /// Relative CPU weight.
    pub cpu_shares: i64,
    /// Memory limit; zero means unlimited.
    pub memory_limit_in_bytes: i64,
}

/// Full status of a container.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerStatus {
    /// Container id.
    pub id: String,
    /// Identity.
    pub metadata: ContainerMetadata,
    /// State.
    pub state: ContainerState,
    /// Creation time in nanoseconds since the epoch.
    pub created_at: i64,
    /// Start time in nanoseconds, zero if never started.
    pub started_at: i64,
    /// Finish time in nanoseconds, zero if not finished.
    pub finished_at: i64,
    /// Exit code.
    pub exit_code: i32,
    /// Requested image.
    pub image: ImageSpec,
    /// Resolved image reference.
    pub image_ref: String,
    /// Short reason.
    pub reason: String,
    /// Message.
    pub message: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
    /// Log path relative to the sandbox log directory.
    pub log_path: String,
    /// Resources currently applied, when the runtime reports them.
    pub resources: Option<LinuxContainerResources>,
}

/// Everything needed to create a container.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerConfig {
    /// Identity.
    pub metadata: ContainerMetadata,
    /// Image to run.
    pub image: ImageSpec,
    /// Entrypoint.
    pub command: Vec<String>,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub working_dir: String,
    /// Environment.
    pub envs: Vec<EnvVar>,
    /// Mounts.
    pub mounts: Vec<VolumeMount>,
    /// Devices.
    pub devices: Vec<VolumeDevice>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
    /// Log path relative to the sandbox log directory.
    pub log_path: String,
    /// Keep stdin open.
    pub stdin: bool,
    /// Allocate a TTY.
    pub tty: bool,
    /// Resources.
    pub resources: LinuxContainerResources,
}

/// Filter for container listings. Unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerFilter {
    /// Match this id.
    pub id: Option<String>,
    /// Match this state.
    pub state: Option<ContainerState>,
    /// Match this sandbox.
    pub pod_sandbox_id: Option<String>,
    /// All of these labels must match.
    pub label_selector: BTreeMap<String, String>,
}

impl ContainerFilter {
    /// Whether the container passes the filter.
    pub fn matches(&self, container: &Container) -> bool {
        self.id.as_ref().map(|id| id == &container.id).unwrap_or(true)
            && self.state.map(|s| s == container.state).unwrap_or(true)
            && self
                .pod_sandbox_id
                .as_ref()
                .map(|id| id == &container.pod_sandbox_id)
                .unwrap_or(true)
            && labels_match(&self.label_selector, &container.labels)
    }
}

fn labels_match(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// A condition reported by a runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeCondition {
    /// Condition type, e.g. `RuntimeReady`.
    pub type_: String,
    /// Whether it holds.
    pub status: bool,
    /// Machine readable reason.
    pub reason: String,
    /// Message.
    pub message: String,
}

/// Overall runtime status.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeStatus {
    /// Conditions.
    pub conditions: Vec<RuntimeCondition>,
}

impl RuntimeStatus {
    /// A runtime is ready only when every condition it reports holds.
    pub fn is_ready(&self) -> bool {
        self.conditions.iter().all(|c| c.status)
    }
}

/// Runtime version information.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionResponse {
    /// Version of the kubelet runtime API.
    pub version: String,
    /// Runtime name, used as the container id type.
    pub runtime_name: String,
    /// Runtime version.
    pub runtime_version: String,
    /// Runtime API version.
    pub runtime_api_version: String,
}

/// An image known to an image service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Image {
    /// Image id.
    pub id: String,
    /// Tags.
    pub repo_tags: Vec<String>,
    /// Digests.
    pub repo_digests: Vec<String>,
    /// Size in bytes.
    pub size: u64,
}
