use thiserror::Error;

use super::Pod;
use crate::container::Container;

/// Annotation holding the root volume size of the VM.
pub const ANNOTATION_ROOT_VOLUME_SIZE: &str = "VirtletRootVolumeSize";
/// Annotation selecting the runtime that serves the pod.
pub const ANNOTATION_TARGET_RUNTIME: &str = "kubernetes.io/target-runtime";
/// Annotation holding the SSH public key.
pub const ANNOTATION_SSH_KEYS: &str = "VirtletSSHKeys";
/// Annotation holding decoded cloud-init user data.
pub const ANNOTATION_CLOUD_INIT_USER_DATA: &str = "VirtletCloudInitUserData";
/// Annotation holding the cloud-init user data script.
pub const ANNOTATION_CLOUD_INIT_USER_DATA_SCRIPT: &str = "VirtletCloudInitUserDataScript";
/// Annotation holding the vCPU count.
pub const ANNOTATION_VCPU_COUNT: &str = "VirtletVCPUCount";
/// Annotation holding the VPC id.
pub const ANNOTATION_VPC: &str = "VPC";
/// Annotation holding the JSON encoded NIC list.
pub const ANNOTATION_NICS: &str = "NICs";

/// Root volume size used for every converted VM.
pub const DEFAULT_ROOT_VOLUME_SIZE: &str = "4Gi";
/// Target runtime tag of VM pods.
pub const VM_TARGET_RUNTIME: &str = "virtlet.cloud";

/// Describes the ways converting a VM pod can fail.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// The pod has no virtual machine block.
    #[error("invalid vm workload pod {0}: no virtual machine in pod spec")]
    InvalidVmWorkloadPod(String),
    /// The user data is not valid base64.
    #[error("invalid cloud-init user data in pod {pod}: {source}")]
    InvalidUserData {
        /// Pod full name.
        pod: String,
        /// Decode failure.
        source: base64::DecodeError,
    },
    /// The NIC list could not be encoded.
    #[error("unable to encode NICs of pod {pod}: {source}")]
    EncodeNics {
        /// Pod full name.
        pod: String,
        /// Encode failure.
        source: serde_json::Error,
    },
}

/// Turns a pod that declares a virtual machine into a container shaped pod. The VM details travel
/// as annotations and a single synthetic container mirrors the VM; the status is carried over
/// unchanged.
pub fn convert_vm_pod_to_container_pod(pod: &Pod) -> Result<Pod, ConvertError> {
    let vm = pod
        .spec
        .virtual_machine
        .as_ref()
        .ok_or_else(|| ConvertError::InvalidVmWorkloadPod(pod.full_name()))?;

    let mut converted = pod.clone();
    let annotations = &mut converted.metadata.annotations;
    annotations.insert(
        ANNOTATION_ROOT_VOLUME_SIZE.to_owned(),
        DEFAULT_ROOT_VOLUME_SIZE.to_owned(),
    );
    annotations.insert(
        ANNOTATION_TARGET_RUNTIME.to_owned(),
        VM_TARGET_RUNTIME.to_owned(),
    );
    if let Some(key) = vm.public_key.as_ref().filter(|k| !k.is_empty()) {
        annotations.insert(ANNOTATION_SSH_KEYS.to_owned(), key.clone());
    }
    if let Some(data) = vm.user_data.as_ref().filter(|d| !d.is_empty()) {
        let decoded = base64::decode(data).map_err(|source| ConvertError::InvalidUserData {
            pod: pod.full_name(),
            source,
        })?;
        annotations.insert(
            ANNOTATION_CLOUD_INIT_USER_DATA.to_owned(),
            String::from_utf8_lossy(&decoded).into_owned(),
        );
    }
    if let Some(script) = vm
        .cloud_init_user_data_script
        .as_ref()
        .filter(|s| !s.is_empty())
    {
        annotations.insert(
            ANNOTATION_CLOUD_INIT_USER_DATA_SCRIPT.to_owned(),
            script.clone(),
        );
    }
    if let Some(cpu) = vm.resources.cpu_limit_milli() {
        // Whole vCPUs, rounded up.
        let vcpus = (cpu + 999) / 1000;
        annotations.insert(ANNOTATION_VCPU_COUNT.to_owned(), vcpus.to_string());
    }
    if let Some(vpc) = pod.spec.vpc.as_ref().filter(|v| !v.is_empty()) {
        annotations.insert(ANNOTATION_VPC.to_owned(), vpc.clone());
    }
    if !pod.spec.nics.is_empty() {
        let nics =
            serde_json::to_string(&pod.spec.nics).map_err(|source| ConvertError::EncodeNics {
                pod: pod.full_name(),
                source,
            })?;
        annotations.insert(ANNOTATION_NICS.to_owned(), nics);
    }

    converted.spec.containers = vec![Container {
        name: vm.name.clone(),
        image: vm.image.clone(),
        image_pull_policy: vm.image_pull_policy.clone(),
        resources: vm.resources.clone(),
        resources_allocated: vm.resources_allocated.clone(),
        resize_policy: vm.resize_policy.clone(),
        volume_mounts: vm.volume_mounts.clone(),
        volume_devices: vm.volume_devices.clone(),
        tty: true,
        stdin: true,
        ..Default::default()
    }];
    converted.spec.init_containers.clear();
    converted.spec.virtual_machine = None;
    Ok(converted)
}
