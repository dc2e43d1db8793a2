//! `container` is a collection of utilities surrounding the container API: the desired container
//! spec as it appears in a pod, and the kubelet's observed view of running containers.

use serde::{Deserialize, Serialize};

use crate::resources::{ResourceList, ResourceRequirements};

mod hash;
pub mod status;

pub use hash::{hash_container, hash_hex};
pub use status::{
    ContainerId, ContainerState, ContainerStatus, PodStatus, RunningContainer, RunningPod,
};

/// Specifies when the runtime should pull a container image
#[derive(PartialEq, Debug, Clone, Copy)]
pub enum PullPolicy {
    /// Always pull the image from the upstream registry
    Always,
    /// Use the image already present on the node; pull it only if it is missing
    IfNotPresent,
    /// Never pull the image; if it is not available locally, fail
    Never,
}

impl PullPolicy {
    /// Get image pull policy of container applying defaults if None from:
    /// https://kubernetes.io/docs/concepts/configuration/overview/#container-images
    pub fn parse_effective(policy: Option<&str>, image: &str) -> anyhow::Result<Self> {
        match PullPolicy::parse(policy)? {
            Some(policy) => Ok(policy),
            None => match image_tag(image) {
                Some("latest") | None => Ok(PullPolicy::Always),
                _ => Ok(PullPolicy::IfNotPresent),
            },
        }
    }

    /// Parses a pull policy from a Kubernetes ImagePullPolicy string
    pub fn parse(name: Option<&str>) -> anyhow::Result<Option<Self>> {
        match name {
            None => Ok(None),
            Some(s) => Self::parse_str(s),
        }
    }

    fn parse_str(name: &str) -> anyhow::Result<Option<Self>> {
        match name {
            "Always" => Ok(Some(Self::Always)),
            "IfNotPresent" => Ok(Some(Self::IfNotPresent)),
            "Never" => Ok(Some(Self::Never)),
            other => Err(anyhow::anyhow!("unrecognized pull policy {}", other)),
        }
    }
}

// A digest pins the image, which behaves like a non-latest tag.
fn image_tag(image: &str) -> Option<&str> {
    if image.contains('@') {
        return Some("digest");
    }
    let last = image.rsplit('/').next().unwrap_or(image);
    last.split_once(':').map(|(_, tag)| tag)
}

/// The restart policy of every container in a pod.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    /// Restart containers whenever they exit.
    Always,
    /// Restart containers that exit with a non-zero code.
    OnFailure,
    /// Never restart containers.
    Never,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::Always
    }
}

/// What the kubelet does when a resource of a running container is resized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceResizePolicy {
    /// Update the resource in place.
    NoRestart,
    /// Kill the container and start it again with the new resources.
    RestartContainer,
}

/// The resize policy for one resource of a container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResizePolicy {
    /// `cpu` or `memory`.
    pub resource_name: String,
    /// The policy applied when that resource changes.
    pub policy: ResourceResizePolicy,
}

/// An environment variable set in a container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value.
    #[serde(default)]
    pub value: String,
}

/// A volume mounted into a container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Name of the pod volume.
    pub name: String,
    /// Path inside the container.
    pub mount_path: String,
    /// Mount read only.
    #[serde(default)]
    pub read_only: bool,
}

/// A raw block device mapped into a container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDevice {
    /// Name of the pod volume.
    pub name: String,
    /// Path of the device inside the container.
    pub device_path: String,
}

/// A liveness probe. The prober that runs it lives outside this crate; only its results are read
/// during sync.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    /// Command executed inside the container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exec: Vec<String>,
    /// Seconds after start before the first probe.
    #[serde(default)]
    pub initial_delay_seconds: i32,
    /// Seconds between probes.
    #[serde(default)]
    pub period_seconds: i32,
    /// Consecutive failures before the container is considered dead.
    #[serde(default)]
    pub failure_threshold: i32,
}

/// A container as declared in a pod spec.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Name of the container, unique within the pod.
    pub name: String,
    /// Image reference.
    #[serde(default)]
    pub image: String,
    /// `Always`, `IfNotPresent` or `Never`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    /// Entrypoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Arguments to the entrypoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Desired resources.
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Resources admitted for this container. A resize is acted on only once the requests match.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub resources_allocated: ResourceList,
    /// Per-resource resize policies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resize_policy: Vec<ContainerResizePolicy>,
    /// Liveness probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,
    /// Volume mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    /// Block devices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_devices: Vec<VolumeDevice>,
    /// Allocate a TTY.
    #[serde(default)]
    pub tty: bool,
    /// Keep stdin open.
    #[serde(default)]
    pub stdin: bool,
    /// Path of the termination message file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_message_path: Option<String>,
}

impl Container {
    /// Get effective pull policy of container.
    pub fn effective_pull_policy(&self) -> anyhow::Result<PullPolicy> {
        PullPolicy::parse_effective(self.image_pull_policy.as_deref(), &self.image)
    }

    /// Whether changing the named resource requires the container to be restarted.
    pub fn resize_requires_restart(&self, resource_name: &str) -> bool {
        self.resize_policy.iter().any(|p| {
            p.resource_name == resource_name && p.policy == ResourceResizePolicy::RestartContainer
        })
    }
}
