//! `runtime` holds the runtime and image service capabilities the kubelet drives, and the
//! registry that maps workload types to configured endpoints.

use std::str::FromStr;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::pod::Nic;

mod binding;
pub mod fake;
mod registry;
mod timeout;
pub mod types;

pub use binding::PodRuntimeBindings;
pub use registry::{
    parse_endpoints, Connector, EndpointSpec, ImageEndpoint, RuntimeEndpoint, RuntimeRegistry,
    RuntimeStatusMap, DEFAULT_SERVICE_NAME,
};
pub use timeout::{TimeoutImageService, TimeoutRuntimeService};

use types::{
    Container, ContainerConfig, ContainerFilter, ContainerStatus, Image, ImageSpec,
    LinuxContainerResources, NicStatus, PodSandbox, PodSandboxConfig, PodSandboxFilter,
    PodSandboxStatus, RuntimeStatus, VersionResponse,
};

/// The kind of workload a runtime serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadType {
    /// Containers.
    Container,
    /// Virtual machines.
    Vm,
}

impl FromStr for WorkloadType {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(WorkloadType::Container),
            "vm" => Ok(WorkloadType::Vm),
            other => Err(RegistryError::Format(format!(
                "unknown workload type {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadType::Container => "container".fmt(f),
            WorkloadType::Vm => "vm".fmt(f),
        }
    }
}

/// Describes the ways registry lookups and configuration can fail.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The endpoint configuration string is empty.
    #[error("runtime endpoint configuration is empty")]
    Empty,
    /// The endpoint configuration string is malformed.
    #[error("invalid runtime endpoint configuration: {0}")]
    Format(String),
    /// No service matches the lookup.
    #[error("{0} not found")]
    NotFound(String),
    /// No container runtime was configured, so there is no primary runtime.
    #[error("primary runtime service not defined")]
    PrimaryNotDefined,
    /// No ready runtime knows a sandbox of the pod.
    #[error("runtime service not found for pod {0}")]
    PodRuntimeNotFound(String),
    /// Connecting to an endpoint failed.
    #[error("unable to connect to endpoint {endpoint}: {source}")]
    Connect {
        /// The endpoint URL.
        endpoint: String,
        /// The connection failure.
        source: anyhow::Error,
    },
}

impl RegistryError {
    /// The category of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Empty | RegistryError::Format(_) => ErrorKind::Format,
            RegistryError::NotFound(_) | RegistryError::PodRuntimeNotFound(_) => {
                ErrorKind::NotFound
            }
            RegistryError::PrimaryNotDefined => ErrorKind::NotDefined,
            RegistryError::Connect { .. } => ErrorKind::Transient,
        }
    }
}

/// The operations the kubelet needs from a runtime endpoint, for containers and VMs alike.
#[async_trait::async_trait]
pub trait RuntimeService: Send + Sync {
    /// Runtime name and versions.
    async fn version(&self, api_version: &str) -> anyhow::Result<VersionResponse>;
    /// Runtime conditions.
    async fn status(&self) -> anyhow::Result<RuntimeStatus>;

    /// Creates and starts a sandbox, returning its id.
    async fn run_pod_sandbox(
        &self,
        config: &PodSandboxConfig,
        runtime_handler: &str,
    ) -> anyhow::Result<String>;
    /// Stops a sandbox and every container in it.
    async fn stop_pod_sandbox(&self, pod_sandbox_id: &str) -> anyhow::Result<()>;
    /// Removes a stopped sandbox.
    async fn remove_pod_sandbox(&self, pod_sandbox_id: &str) -> anyhow::Result<()>;
    /// Status of one sandbox.
    async fn pod_sandbox_status(&self, pod_sandbox_id: &str) -> anyhow::Result<PodSandboxStatus>;
    /// Lists sandboxes.
    async fn list_pod_sandbox(
        &self,
        filter: Option<&PodSandboxFilter>,
    ) -> anyhow::Result<Vec<PodSandbox>>;

    /// Creates a container in a sandbox, returning its id.
    async fn create_container(
        &self,
        pod_sandbox_id: &str,
        config: &ContainerConfig,
        sandbox_config: &PodSandboxConfig,
    ) -> anyhow::Result<String>;
    /// Starts a created container.
    async fn start_container(&self, container_id: &str) -> anyhow::Result<()>;
    /// Stops a container, waiting up to `timeout` seconds before killing it.
    async fn stop_container(&self, container_id: &str, timeout: i64) -> anyhow::Result<()>;
    /// Removes a container.
    async fn remove_container(&self, container_id: &str) -> anyhow::Result<()>;
    /// Lists containers.
    async fn list_containers(
        &self,
        filter: Option<&ContainerFilter>,
    ) -> anyhow::Result<Vec<Container>>;
    /// Status of one container.
    async fn container_status(&self, container_id: &str) -> anyhow::Result<ContainerStatus>;
    /// Applies new resources to a running container.
    async fn update_container_resources(
        &self,
        container_id: &str,
        resources: &LinuxContainerResources,
    ) -> anyhow::Result<()>;

    /// Hot plugs a NIC into a sandbox.
    async fn attach_network_interface(&self, pod_sandbox_id: &str, nic: &Nic)
        -> anyhow::Result<()>;
    /// Hot unplugs a NIC from a sandbox.
    async fn detach_network_interface(&self, pod_sandbox_id: &str, nic: &Nic)
        -> anyhow::Result<()>;
    /// NICs currently plugged into a sandbox.
    async fn list_network_interfaces(&self, pod_sandbox_id: &str)
        -> anyhow::Result<Vec<NicStatus>>;

    /// Reboots the VM backing a sandbox.
    async fn reboot_vm(&self, pod_sandbox_id: &str) -> anyhow::Result<()>;
    /// Snapshots the VM backing a sandbox.
    async fn create_snapshot(&self, pod_sandbox_id: &str, snapshot_id: &str)
        -> anyhow::Result<()>;
    /// Restores the VM backing a sandbox to a snapshot.
    async fn restore_to_snapshot(&self, pod_sandbox_id: &str, snapshot_id: &str)
        -> anyhow::Result<()>;
}

/// The operations the kubelet needs from an image endpoint.
#[async_trait::async_trait]
pub trait ImageService: Send + Sync {
    /// Lists images, optionally only those matching a spec.
    async fn list_images(&self, filter: Option<&ImageSpec>) -> anyhow::Result<Vec<Image>>;
    /// Status of an image; `None` if it is not present.
    async fn image_status(&self, image: &ImageSpec) -> anyhow::Result<Option<Image>>;
    /// Pulls an image, returning its reference.
    async fn pull_image(
        &self,
        image: &ImageSpec,
        sandbox_config: Option<&PodSandboxConfig>,
    ) -> anyhow::Result<String>;
    /// Removes an image.
    async fn remove_image(&self, image: &ImageSpec) -> anyhow::Result<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_workload_type_parse() {
        assert_eq!(
            "container".parse::<WorkloadType>().unwrap(),
            WorkloadType::Container
        );
        assert_eq!("vm".parse::<WorkloadType>().unwrap(), WorkloadType::Vm);
        let err = "wasm".parse::<WorkloadType>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(RegistryError::Empty.kind(), ErrorKind::Format);
        assert_eq!(RegistryError::PrimaryNotDefined.kind(), ErrorKind::NotDefined);
        assert_eq!(
            RegistryError::PodRuntimeNotFound("u".to_owned()).kind(),
            ErrorKind::NotFound
        );
    }
}
