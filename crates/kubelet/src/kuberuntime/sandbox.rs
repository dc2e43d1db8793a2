//! Sandbox creation.

use tracing::{debug, info};

use super::actions::network_namespace_for_pod;
use super::labels::{new_pod_annotations, new_pod_labels};
use super::result::SyncError;
use super::RuntimeManager;
use crate::logs::build_pod_logs_directory;
use crate::pod::Pod;
use crate::runtime::types::{PodSandboxConfig, PodSandboxMetadata};
use crate::runtime::RuntimeEndpoint;

impl RuntimeManager {
    /// Builds the config a sandbox of `pod` is created with.
    pub fn generate_pod_sandbox_config(
        &self,
        pod: &Pod,
        attempt: u32,
    ) -> Result<PodSandboxConfig, SyncError> {
        if pod.pod_uid().is_empty() || pod.name().is_empty() {
            return Err(SyncError::ConfigPodSandboxFailed(format!(
                "pod {:?} has no name or uid",
                pod.full_name()
            )));
        }
        let log_directory = build_pod_logs_directory(
            &self.pod_logs_root,
            pod.tenant(),
            pod.namespace(),
            pod.name(),
            pod.pod_uid(),
        );
        let hostname = match pod.spec.hostname.as_deref() {
            Some(h) if !h.is_empty() => h.to_owned(),
            _ => pod.name().to_owned(),
        };
        Ok(PodSandboxConfig {
            metadata: PodSandboxMetadata {
                name: pod.name().to_owned(),
                uid: pod.pod_uid().to_owned(),
                namespace: pod.namespace().to_owned(),
                tenant: pod.tenant().to_owned(),
                attempt,
            },
            hostname,
            log_directory: log_directory.to_string_lossy().into_owned(),
            labels: new_pod_labels(pod),
            annotations: new_pod_annotations(pod),
            cgroup_parent: String::new(),
            network_mode: network_namespace_for_pod(pod),
            nics: pod.spec.nics.iter().filter(|n| n.is_valid()).cloned().collect(),
            vpc: pod.spec.vpc.clone().unwrap_or_default(),
        })
    }

    /// Creates a sandbox of `pod` on `endpoint`, making its log directory first. Returns the
    /// sandbox id.
    pub(crate) async fn create_pod_sandbox(
        &self,
        endpoint: &RuntimeEndpoint,
        pod: &Pod,
        attempt: u32,
    ) -> Result<String, SyncError> {
        let config = self.generate_pod_sandbox_config(pod, attempt)?;
        debug!(pod = %pod.full_name(), log_directory = %config.log_directory, "creating pod log directory");
        tokio::fs::create_dir_all(&config.log_directory)
            .await
            .map_err(|e| {
                SyncError::CreateSandboxFailed(format!(
                    "failed to create log directory {:?} for pod {}: {}",
                    config.log_directory,
                    pod.full_name(),
                    e
                ))
            })?;
        let id = endpoint
            .service
            .run_pod_sandbox(&config, "")
            .await
            .map_err(|e| {
                SyncError::CreateSandboxFailed(format!(
                    "failed to create sandbox for pod {}: {}",
                    pod.full_name(),
                    e
                ))
            })?;
        info!(pod = %pod.full_name(), sandbox_id = %id, runtime = %endpoint.name, attempt, "created pod sandbox");
        Ok(id)
    }
}
