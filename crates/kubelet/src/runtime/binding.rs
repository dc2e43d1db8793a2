use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::registry::{ImageEndpoint, RuntimeEndpoint, RuntimeRegistry};
use super::{RegistryError, WorkloadType};
use crate::pod::Pod;

/// Remembers which runtime service hosts each pod, so that a pod keeps talking to the runtime
/// that created its sandbox even if the defaults change.
pub struct PodRuntimeBindings {
    registry: Arc<RuntimeRegistry>,
    bindings: RwLock<HashMap<String, RuntimeEndpoint>>,
}

impl PodRuntimeBindings {
    /// Creates an empty cache over a registry.
    pub fn new(registry: Arc<RuntimeRegistry>) -> Self {
        PodRuntimeBindings {
            registry,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// The registry the bindings point into.
    pub fn registry(&self) -> &RuntimeRegistry {
        &self.registry
    }

    /// The runtime hosting the pod with the given uid. On a cache miss every ready runtime is
    /// asked for its sandboxes and the first one that has a sandbox of the pod is bound.
    pub async fn get_runtime_service_by_pod_id(
        &self,
        pod_uid: &str,
    ) -> Result<RuntimeEndpoint, RegistryError> {
        if let Some(endpoint) = self.bindings.read().await.get(pod_uid) {
            return Ok(endpoint.clone());
        }

        for endpoint in self.registry.get_all_runtime_services() {
            match endpoint.service.status().await {
                Ok(status) if status.is_ready() => (),
                Ok(_) => {
                    debug!(name = %endpoint.name, "skipping runtime that is not ready");
                    continue;
                }
                Err(e) => {
                    warn!(name = %endpoint.name, error = %e, "unable to probe runtime");
                    continue;
                }
            }
            let sandboxes = match endpoint.service.list_pod_sandbox(None).await {
                Ok(sandboxes) => sandboxes,
                Err(e) => {
                    warn!(name = %endpoint.name, error = %e, "unable to list sandboxes");
                    continue;
                }
            };
            if sandboxes.iter().any(|s| s.metadata.uid == pod_uid) {
                debug!(pod_uid, name = %endpoint.name, "bound pod to runtime");
                self.bindings
                    .write()
                    .await
                    .insert(pod_uid.to_owned(), endpoint.clone());
                return Ok(endpoint.clone());
            }
        }
        Err(RegistryError::PodRuntimeNotFound(pod_uid.to_owned()))
    }

    /// The runtime a pod should run on: its bound runtime if it has one, otherwise the default
    /// runtime for its workload type.
    pub async fn get_runtime_service_for_pod(
        &self,
        pod: &Pod,
    ) -> Result<RuntimeEndpoint, RegistryError> {
        if let Some(endpoint) = self.bindings.read().await.get(pod.pod_uid()) {
            return Ok(endpoint.clone());
        }
        if let Some(name) = runtime_service_name(pod) {
            return self.registry.get_runtime_service_by_name(name).cloned();
        }
        self.registry
            .get_runtime_service_by_workload_type(workload_type(pod))
            .cloned()
    }

    /// The image service a pod pulls from: the default one for its workload type.
    pub fn get_image_service_for_pod(&self, pod: &Pod) -> Result<ImageEndpoint, RegistryError> {
        self.registry
            .get_image_service_by_workload_type(workload_type(pod))
            .cloned()
    }

    /// Binds a pod to a runtime.
    pub async fn set(&self, pod_uid: &str, endpoint: RuntimeEndpoint) {
        self.bindings
            .write()
            .await
            .insert(pod_uid.to_owned(), endpoint);
    }

    /// Forgets the binding of a pod.
    pub async fn remove(&self, pod_uid: &str) {
        self.bindings.write().await.remove(pod_uid);
    }

    /// Number of bound pods.
    pub async fn len(&self) -> usize {
        self.bindings.read().await.len()
    }

    /// Whether no pod is bound.
    pub async fn is_empty(&self) -> bool {
        self.bindings.read().await.is_empty()
    }
}

fn workload_type(pod: &Pod) -> WorkloadType {
    if pod.is_vm() {
        WorkloadType::Vm
    } else {
        WorkloadType::Container
    }
}

// Pods carry no runtime service name yet, so the workload default always applies.
fn runtime_service_name(_pod: &Pod) -> Option<&str> {
    None
}
