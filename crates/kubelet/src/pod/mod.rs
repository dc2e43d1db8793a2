//! `pod` is a collection of utilities surrounding the Arktos pod API.
mod convert;
mod status;
mod workers;

pub use convert::{
    convert_vm_pod_to_container_pod, ConvertError, ANNOTATION_CLOUD_INIT_USER_DATA,
    ANNOTATION_CLOUD_INIT_USER_DATA_SCRIPT, ANNOTATION_NICS, ANNOTATION_ROOT_VOLUME_SIZE,
    ANNOTATION_SSH_KEYS, ANNOTATION_TARGET_RUNTIME, ANNOTATION_VCPU_COUNT, ANNOTATION_VPC,
    DEFAULT_ROOT_VOLUME_SIZE, VM_TARGET_RUNTIME,
};
pub use status::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
    ContainerStatus, Phase, PodCondition, PodStatus,
};
pub use workers::{PodSyncer, PodUpdate, PodWorkers, UpdateType};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::container::{Container, ContainerResizePolicy, RestartPolicy, VolumeDevice, VolumeMount};
use crate::resources::{ResourceList, ResourceRequirements};

const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_TENANT: &str = "system";

/// Identity and bookkeeping metadata of a pod.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Pod name.
    #[serde(default)]
    pub name: String,
    /// Owning tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    /// Namespace within the tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Stable unique id.
    #[serde(default)]
    pub uid: String,
    /// Labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set once the pod has been asked to terminate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Grace period requested with the deletion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_grace_period_seconds: Option<i64>,
}

/// A network interface requested for the pod.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nic {
    /// Interface name inside the pod, e.g. `eth0`.
    #[serde(default)]
    pub name: String,
    /// Subnet the port lives in.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subnet_name: String,
    /// Id of the network port backing the interface.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port_id: String,
    /// Fixed IP, if requested.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
    /// Id of the network the interface attaches to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
}

impl Nic {
    /// A NIC is acted on only when it names both the interface and a non-blank port.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.port_id.trim().is_empty()
    }
}

/// A compute flavor a virtual machine may be built with.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flavor {
    /// Flavor id in the compute service.
    pub flavor_id: String,
}

/// A virtual machine workload declared in place of containers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    /// VM name.
    pub name: String,
    /// Image, also used as the image reference when built on a remote cloud.
    #[serde(default)]
    pub image: String,
    /// Image pull policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    /// Desired resources.
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Admitted resources.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources_allocated: ResourceList,
    /// Per-resource resize policies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resize_policy: Vec<ContainerResizePolicy>,
    /// Volume mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    /// Block devices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_devices: Vec<VolumeDevice>,
    /// Key pair name in the remote cloud.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pair_name: Option<String>,
    /// SSH public key injected into the guest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Base64 encoded cloud-init user data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    /// Cloud-init user data script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init_user_data_script: Option<String>,
    /// Candidate flavors, first one wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flavors: Vec<Flavor>,
    /// Security group names, first one is used.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<String>,
}

/// The desired state of a pod.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Regular containers, in start order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<Container>,
    /// Init containers, run one after another before the regular ones.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    /// A virtual machine, set instead of containers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine: Option<VirtualMachine>,
    /// Restart policy for every container.
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Use the node's network namespace.
    #[serde(default)]
    pub host_network: bool,
    /// Requested network interfaces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nics: Vec<Nic>,
    /// VPC the pod belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<String>,
    /// Grace period for container termination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
    /// Node the pod is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Hostname inside the sandbox; defaults to the pod name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// An Arktos pod.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    /// Metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired state.
    #[serde(default)]
    pub spec: PodSpec,
    /// Last reported status.
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    /// Get the name of the pod
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Get the pod's namespace
    ///
    /// Returns "default" if no namespace was explictily set
    pub fn namespace(&self) -> &str {
        self.metadata
            .namespace
            .as_deref()
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Get the pod's tenant
    ///
    /// Returns "system" if no tenant was explictily set
    pub fn tenant(&self) -> &str {
        self.metadata.tenant.as_deref().unwrap_or(DEFAULT_TENANT)
    }

    /// Get the pod's uid
    pub fn pod_uid(&self) -> &str {
        &self.metadata.uid
    }

    /// Get the pod's labels
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata.labels
    }

    /// Get the pod's annotations
    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.metadata.annotations
    }

    /// Whether the pod has been asked to terminate.
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the pod declares a virtual machine instead of containers, or has been converted
    /// from one.
    pub fn is_vm(&self) -> bool {
        self.spec.virtual_machine.is_some()
            || self
                .annotations()
                .get(ANNOTATION_TARGET_RUNTIME)
                .map(|r| r == VM_TARGET_RUNTIME)
                .unwrap_or(false)
    }

    /// Whether the pod uses the node's network namespace.
    pub fn is_host_network(&self) -> bool {
        self.spec.host_network
    }

    /// Whether containers that fail are restarted.
    pub fn should_restart_on_failure(&self) -> bool {
        self.spec.restart_policy != RestartPolicy::Never
    }

    /// The `name_namespace_tenant` form used in logs and events.
    pub fn full_name(&self) -> String {
        build_pod_full_name(self.name(), self.namespace(), self.tenant())
    }

    /// Get a specific init container or regular container by name.
    pub fn find_container(&self, name: &str) -> Option<&Container> {
        self.spec
            .containers
            .iter()
            .chain(self.spec.init_containers.iter())
            .find(|c| c.name == name)
    }
}

/// Builds the `name_namespace_tenant` form of a pod name.
pub fn build_pod_full_name(name: &str, namespace: &str, tenant: &str) -> String {
    format!("{}_{}_{}", name, namespace, tenant)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: "web".to_owned(),
                uid: "1234".to_owned(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(pod.namespace(), "default");
        assert_eq!(pod.tenant(), "system");
        assert_eq!(pod.full_name(), "web_default_system");
        assert!(pod.should_restart_on_failure());
        assert!(!pod.is_terminating());
        assert!(!pod.is_vm());
    }

    #[test]
    fn test_nic_validity() {
        let nic = |name: &str, port: &str| Nic {
            name: name.to_owned(),
            port_id: port.to_owned(),
            ..Default::default()
        };
        assert!(nic("eth0", "port1").is_valid());
        assert!(!nic("", "port1").is_valid());
        assert!(!nic("eth0", "   ").is_valid());
        assert!(!nic("eth0", "").is_valid());
    }

    #[test]
    fn test_pod_deserializes_from_yaml_like_json() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "vm", "tenant": "t1", "namespace": "ns", "uid": "u"},
            "spec": {
                "restartPolicy": "OnFailure",
                "virtualMachine": {"name": "vm", "image": "cirros", "flavors": [{"flavorId": "42"}]},
                "nics": [{"name": "eth0", "portId": "p1", "uuid": "net1"}]
            }
        }))
        .unwrap();
        assert!(pod.is_vm());
        assert_eq!(pod.tenant(), "t1");
        assert_eq!(pod.spec.restart_policy, RestartPolicy::OnFailure);
        assert_eq!(pod.spec.nics[0].uuid, "net1");
    }
}
