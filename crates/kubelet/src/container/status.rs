//! The kubelet's observed view of a pod: what the runtime reports, reconstructed into container
//! and pod statuses that the action planner can compare against the desired spec.

use chrono::{DateTime, Utc};

use crate::resources::ResourceRequirements;
use crate::runtime::types::{PodSandboxState, PodSandboxStatus};

/// A container id qualified by the runtime type that owns it, written `type://id`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId {
    /// The runtime type, e.g. `containerd` or `virtlet`.
    pub runtime_type: String,
    /// The runtime-local id.
    pub id: String,
}

impl ContainerId {
    /// Builds an id from its parts.
    pub fn new(runtime_type: &str, id: &str) -> Self {
        ContainerId {
            runtime_type: runtime_type.to_owned(),
            id: id.to_owned(),
        }
    }

    /// Parses the `type://id` form.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.split_once("://") {
            Some((runtime_type, id)) if !runtime_type.is_empty() && !id.is_empty() => {
                Ok(Self::new(runtime_type, id))
            }
            _ => Err(anyhow::anyhow!("invalid container id: {:?}", s)),
        }
    }

    /// Whether this id is unset.
    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.runtime_type, self.id)
    }
}

/// The state of a container as reported by the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContainerState {
    /// Created but never started.
    Created,
    /// Running.
    Running,
    /// Stopped, with an exit code.
    Exited,
    /// The runtime cannot tell.
    Unknown,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Unknown => "unknown",
        };
        s.fmt(f)
    }
}

/// The observed status of one container instance.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerStatus {
    /// Runtime-qualified id.
    pub id: ContainerId,
    /// Container name from the pod spec.
    pub name: String,
    /// Current state.
    pub state: ContainerState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start time, if started.
    pub started_at: Option<DateTime<Utc>>,
    /// Finish time, if exited.
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code, meaningful when exited.
    pub exit_code: i32,
    /// Image the container runs.
    pub image: String,
    /// Resolved image reference.
    pub image_id: String,
    /// Hash of the spec the container was created from.
    pub hash: u64,
    /// Restart count recorded when it was created.
    pub restart_count: i32,
    /// Short reason for the state.
    pub reason: String,
    /// Human readable message for the state.
    pub message: String,
    /// Resources reported by the runtime, when it reports them.
    pub resources: Option<ResourceRequirements>,
}

/// The observed status of a pod: its sandboxes and every container instance the runtime still
/// knows about, including exited ones.
#[derive(Clone, Debug, Default)]
pub struct PodStatus {
    /// Pod uid.
    pub id: String,
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Pod tenant.
    pub tenant: String,
    /// IP of the newest ready sandbox, empty if none.
    pub ip: String,
    /// Container statuses, newest first.
    pub container_statuses: Vec<ContainerStatus>,
    /// Sandbox statuses, newest first.
    pub sandbox_statuses: Vec<PodSandboxStatus>,
}

impl PodStatus {
    /// The newest status of the named container.
    pub fn find_container_status_by_name(&self, name: &str) -> Option<&ContainerStatus> {
        self.container_statuses.iter().find(|s| s.name == name)
    }

    /// Statuses of all running containers.
    pub fn running_container_statuses(&self) -> Vec<&ContainerStatus> {
        self.container_statuses
            .iter()
            .filter(|s| s.state == ContainerState::Running)
            .collect()
    }

    /// The newest sandbox status, if any sandbox was observed.
    pub fn latest_sandbox(&self) -> Option<&PodSandboxStatus> {
        self.sandbox_statuses.first()
    }
}

/// A container or sandbox as part of a [`RunningPod`].
#[derive(Clone, Debug, PartialEq)]
pub struct RunningContainer {
    /// Runtime-qualified id.
    pub id: ContainerId,
    /// Name.
    pub name: String,
    /// Image, empty for sandboxes.
    pub image: String,
    /// Spec hash.
    pub hash: u64,
    /// State.
    pub state: ContainerState,
}

/// A pod as the runtime sees it: the running containers and all sandboxes.
#[derive(Clone, Debug, Default)]
pub struct RunningPod {
    /// Pod uid.
    pub id: String,
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Pod tenant.
    pub tenant: String,
    /// Containers of the pod.
    pub containers: Vec<RunningContainer>,
    /// Sandboxes of the pod.
    pub sandboxes: Vec<RunningContainer>,
}

impl RunningPod {
    /// Builds the running pod out of an observed status. Only running containers are kept; all
    /// sandboxes are, since each one has to be stopped when the pod is killed.
    pub fn from_pod_status(runtime_type: &str, status: &PodStatus) -> Self {
        let containers = status
            .container_statuses
            .iter()
            .filter(|c| c.state == ContainerState::Running)
            .map(|c| RunningContainer {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image.clone(),
                hash: c.hash,
                state: c.state,
            })
            .collect();
        let sandboxes = status
            .sandbox_statuses
            .iter()
            .map(|s| RunningContainer {
                id: ContainerId::new(runtime_type, &s.id),
                name: s.metadata.name.clone(),
                image: String::new(),
                hash: 0,
                state: match s.state {
                    PodSandboxState::Ready => ContainerState::Running,
                    PodSandboxState::NotReady => ContainerState::Exited,
                },
            })
            .collect();
        RunningPod {
            id: status.id.clone(),
            name: status.name.clone(),
            namespace: status.namespace.clone(),
            tenant: status.tenant.clone(),
            containers,
            sandboxes,
        }
    }

    /// Whether nothing of this pod is known to the runtime.
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.sandboxes.is_empty()
    }
}
