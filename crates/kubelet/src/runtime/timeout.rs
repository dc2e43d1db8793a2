use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::types::{
    Container, ContainerConfig, ContainerFilter, ContainerStatus, Image, ImageSpec,
    LinuxContainerResources, NicStatus, PodSandbox, PodSandboxConfig, PodSandboxFilter,
    PodSandboxStatus, RuntimeStatus, VersionResponse,
};
use super::{ImageService, RuntimeService};
use crate::pod::Nic;

async fn bounded<T, F>(timeout: Duration, op: &str, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "{} timed out after {}s",
            op,
            timeout.as_secs_f64()
        )),
    }
}

/// Bounds every call of the wrapped runtime service by a fixed timeout. A timed out call is
/// cancelled and the next sync tick reconciles from whatever state it left.
pub struct TimeoutRuntimeService {
    inner: Arc<dyn RuntimeService>,
    timeout: Duration,
}

impl TimeoutRuntimeService {
    /// Wraps a service.
    pub fn new(inner: Arc<dyn RuntimeService>, timeout: Duration) -> Self {
        TimeoutRuntimeService { inner, timeout }
    }
}

#[async_trait::async_trait]
impl RuntimeService for TimeoutRuntimeService {
    async fn version(&self, api_version: &str) -> anyhow::Result<VersionResponse> {
        bounded(self.timeout, "Version", self.inner.version(api_version)).await
    }

    async fn status(&self) -> anyhow::Result<RuntimeStatus> {
        bounded(self.timeout, "Status", self.inner.status()).await
    }

    async fn run_pod_sandbox(
        &self,
        config: &PodSandboxConfig,
        runtime_handler: &str,
    ) -> anyhow::Result<String> {
        bounded(
            self.timeout,
            "RunPodSandbox",
            self.inner.run_pod_sandbox(config, runtime_handler),
        )
        .await
    }

    async fn stop_pod_sandbox(&self, pod_sandbox_id: &str) -> anyhow::Result<()> {
        bounded(
            self.timeout,
            "StopPodSandbox",
            self.inner.stop_pod_sandbox(pod_sandbox_id),
        )
        .await
    }

    async fn remove_pod_sandbox(&self, pod_sandbox_id: &str) -> anyhow::Result<()> {
        bounded(
            self.timeout,
            "RemovePodSandbox",
            self.inner.remove_pod_sandbox(pod_sandbox_id),
        )
        .await
    }

    async fn pod_sandbox_status(&self, pod_sandbox_id: &str) -> anyhow::Result<PodSandboxStatus> {
        bounded(
            self.timeout,
            "PodSandboxStatus",
            self.inner.pod_sandbox_status(pod_sandbox_id),
        )
        .await
    }

    async fn list_pod_sandbox(
        &self,
        filter: Option<&PodSandboxFilter>,
    ) -> anyhow::Result<Vec<PodSandbox>> {
        bounded(
            self.timeout,
            "ListPodSandbox",
            self.inner.list_pod_sandbox(filter),
        )
        .await
    }

    async fn create_container(
        &self,
        pod_sandbox_id: &str,
        config: &ContainerConfig,
        sandbox_config: &PodSandboxConfig,
    ) -> anyhow::Result<String> {
        bounded(
            self.timeout,
            "CreateContainer",
            self.inner
                .create_container(pod_sandbox_id, config, sandbox_config),
        )
        .await
    }

    async fn start_container(&self, container_id: &str) -> anyhow::Result<()> {
        bounded(
            self.timeout,
            "StartContainer",
            self.inner.start_container(container_id),
        )
        .await
    }

    async fn stop_container(&self, container_id: &str, timeout: i64) -> anyhow::Result<()> {
        // The runtime may legitimately take the whole grace period.
        let bound = self.timeout + Duration::from_secs(timeout.max(0) as u64);
        bounded(
            bound,
            "StopContainer",
            self.inner.stop_container(container_id, timeout),
        )
        .await
    }

    async fn remove_container(&self, container_id: &str) -> anyhow::Result<()> {
        bounded(
            self.timeout,
            "RemoveContainer",
            self.inner.remove_container(container_id),
        )
        .await
    }

    async fn list_containers(
        &self,
        filter: Option<&ContainerFilter>,
    ) -> anyhow::Result<Vec<Container>> {
        bounded(
            self.timeout,
            "ListContainers",
            self.inner.list_containers(filter),
        )
        .await
    }

    async fn container_status(&self, container_id: &str) -> anyhow::Result<ContainerStatus> {
        bounded(
            self.timeout,
            "ContainerStatus",
            self.inner.container_status(container_id),
        )
        .await
    }

    async fn update_container_resources(
        &self,
        container_id: &str,
        resources: &LinuxContainerResources,
    ) -> anyhow::Result<()> {
        bounded(
            self.timeout,
            "UpdateContainerResources",
            self.inner.update_container_resources(container_id, resources),
        )
        .await
    }

    async fn attach_network_interface(
        &self,
        pod_sandbox_id: &str,
        nic: &Nic,
    ) -> anyhow::Result<()> {
        bounded(
            self.timeout,
            "AttachNetworkInterface",
            self.inner.attach_network_interface(pod_sandbox_id, nic),
        )
        .await
    }

    async fn detach_network_interface(
        &self,
        pod_sandbox_id: &str,
        nic: &Nic,
    ) -> anyhow::Result<()> {
        bounded(
            self.timeout,
            "DetachNetworkInterface",
            self.inner.detach_network_interface(pod_sandbox_id, nic),
        )
        .await
    }

    async fn list_network_interfaces(
        &self,
        pod_sandbox_id: &str,
    ) -> anyhow::Result<Vec<NicStatus>> {
        bounded(
            self.timeout,
            "ListNetworkInterfaces",
            self.inner.list_network_interfaces(pod_sandbox_id),
        )
        .await
    }

    async fn reboot_vm(&self, pod_sandbox_id: &str) -> anyhow::Result<()> {
        bounded(self.timeout, "RebootVM", self.inner.reboot_vm(pod_sandbox_id)).await
    }

    async fn create_snapshot(&self, pod_sandbox_id: &str, snapshot_id: &str) -> anyhow::Result<()> {
        bounded(
            self.timeout,
            "CreateSnapshot",
            self.inner.create_snapshot(pod_sandbox_id, snapshot_id),
        )
        .await
    }

    async fn restore_to_snapshot(
        &self,
        pod_sandbox_id: &str,
        snapshot_id: &str,
    ) -> anyhow::Result<()> {
        bounded(
            self.timeout,
            "RestoreToSnapshot",
            self.inner.restore_to_snapshot(pod_sandbox_id, snapshot_id),
        )
        .await
    }
}

/// Bounds every call of the wrapped image service by a fixed timeout. Pulls are not bounded
/// since large images legitimately take longer than any per-call deadline.
pub struct TimeoutImageService {
    inner: Arc<dyn ImageService>,
    timeout: Duration,
}

impl TimeoutImageService {
    /// Wraps a service.
    pub fn new(inner: Arc<dyn ImageService>, timeout: Duration) -> Self {
        TimeoutImageService { inner, timeout }
    }
}

#[async_trait::async_trait]
impl ImageService for TimeoutImageService {
    async fn list_images(&self, filter: Option<&ImageSpec>) -> anyhow::Result<Vec<Image>> {
        bounded(self.timeout, "ListImages", self.inner.list_images(filter)).await
    }

    async fn image_status(&self, image: &ImageSpec) -> anyhow::Result<Option<Image>> {
        bounded(self.timeout, "ImageStatus", self.inner.image_status(image)).await
    }

    async fn pull_image(
        &self,
        image: &ImageSpec,
        sandbox_config: Option<&PodSandboxConfig>,
    ) -> anyhow::Result<String> {
        self.inner.pull_image(image, sandbox_config).await
    }

    async fn remove_image(&self, image: &ImageSpec) -> anyhow::Result<()> {
        bounded(self.timeout, "RemoveImage", self.inner.remove_image(image)).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runtime::fake::FakeRuntimeService;

    #[tokio::test]
    async fn test_slow_calls_time_out() {
        let fake = Arc::new(FakeRuntimeService::new("fake"));
        fake.set_delay(Duration::from_millis(200)).await;
        let wrapped = TimeoutRuntimeService::new(fake, Duration::from_millis(20));
        let err = wrapped.status().await.unwrap_err();
        assert!(err.to_string().contains("Status timed out"));
    }

    #[tokio::test]
    async fn test_fast_calls_pass_through() {
        let fake = Arc::new(FakeRuntimeService::new("fake"));
        let wrapped = TimeoutRuntimeService::new(fake, Duration::from_secs(1));
        assert_eq!(wrapped.version("v1").await.unwrap().runtime_name, "fake");
    }
}
