//! Labels and annotations stamped on sandboxes and containers, so that the observed pod status
//! can be rebuilt from what the runtime reports.

use std::collections::BTreeMap;

use tracing::warn;

use crate::container::{hash_hex, Container};
use crate::pod::Pod;

/// Pod name label.
pub const POD_NAME_LABEL: &str = "io.kubernetes.pod.name";
/// Pod namespace label.
pub const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";
/// Pod tenant label.
pub const POD_TENANT_LABEL: &str = "io.kubernetes.pod.tenant";
/// Pod uid label.
pub const POD_UID_LABEL: &str = "io.kubernetes.pod.uid";
/// Container name label.
pub const CONTAINER_NAME_LABEL: &str = "io.kubernetes.container.name";

/// Container spec hash annotation, in hex.
pub const CONTAINER_HASH_ANNOTATION: &str = "io.kubernetes.container.hash";
/// Restart count annotation.
pub const CONTAINER_RESTART_COUNT_ANNOTATION: &str = "io.kubernetes.container.restartCount";
/// Termination message path annotation.
pub const CONTAINER_TERMINATION_MESSAGE_PATH_ANNOTATION: &str =
    "io.kubernetes.container.terminationMessagePath";
/// Pod termination grace period annotation.
pub const POD_TERMINATION_GRACE_PERIOD_ANNOTATION: &str = "io.kubernetes.pod.terminationGracePeriod";

/// Pod identity recovered from container labels.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabeledContainerInfo {
    /// Pod name.
    pub pod_name: String,
    /// Pod namespace.
    pub pod_namespace: String,
    /// Pod tenant.
    pub pod_tenant: String,
    /// Pod uid.
    pub pod_uid: String,
    /// Container name.
    pub container_name: String,
}

/// Container details recovered from container annotations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AnnotatedContainerInfo {
    /// Spec hash.
    pub hash: u64,
    /// Restart count.
    pub restart_count: i32,
    /// Pod termination grace period, when the pod declared one.
    pub pod_termination_grace_period: Option<i64>,
    /// Termination message path.
    pub termination_message_path: String,
}

/// Labels of a pod sandbox: the pod labels plus the pod identity.
pub fn new_pod_labels(pod: &Pod) -> BTreeMap<String, String> {
    let mut labels = pod.labels().clone();
    labels.insert(POD_NAME_LABEL.to_owned(), pod.name().to_owned());
    labels.insert(POD_NAMESPACE_LABEL.to_owned(), pod.namespace().to_owned());
    labels.insert(POD_TENANT_LABEL.to_owned(), pod.tenant().to_owned());
    labels.insert(POD_UID_LABEL.to_owned(), pod.pod_uid().to_owned());
    labels
}

/// Annotations of a pod sandbox.
pub fn new_pod_annotations(pod: &Pod) -> BTreeMap<String, String> {
    pod.annotations().clone()
}

/// Labels of a container.
pub fn new_container_labels(container: &Container, pod: &Pod) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(POD_NAME_LABEL.to_owned(), pod.name().to_owned());
    labels.insert(POD_NAMESPACE_LABEL.to_owned(), pod.namespace().to_owned());
    labels.insert(POD_TENANT_LABEL.to_owned(), pod.tenant().to_owned());
    labels.insert(POD_UID_LABEL.to_owned(), pod.pod_uid().to_owned());
    labels.insert(CONTAINER_NAME_LABEL.to_owned(), container.name.clone());
    labels
}

/// Annotations of a container.
pub fn new_container_annotations(
    container: &Container,
    pod: &Pod,
    restart_count: i32,
) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(CONTAINER_HASH_ANNOTATION.to_owned(), hash_hex(container));
    annotations.insert(
        CONTAINER_RESTART_COUNT_ANNOTATION.to_owned(),
        restart_count.to_string(),
    );
    if let Some(path) = &container.termination_message_path {
        annotations.insert(
            CONTAINER_TERMINATION_MESSAGE_PATH_ANNOTATION.to_owned(),
            path.clone(),
        );
    }
    if let Some(grace) = pod.spec.termination_grace_period_seconds {
        annotations.insert(
            POD_TERMINATION_GRACE_PERIOD_ANNOTATION.to_owned(),
            grace.to_string(),
        );
    }
    annotations
}

/// Reads the pod identity and container name out of container labels. Missing labels are empty.
pub fn get_container_info_from_labels(labels: &BTreeMap<String, String>) -> LabeledContainerInfo {
    let get = |key: &str| labels.get(key).cloned().unwrap_or_default();
    LabeledContainerInfo {
        pod_name: get(POD_NAME_LABEL),
        pod_namespace: get(POD_NAMESPACE_LABEL),
        pod_tenant: get(POD_TENANT_LABEL),
        pod_uid: get(POD_UID_LABEL),
        container_name: get(CONTAINER_NAME_LABEL),
    }
}

/// Reads the container details out of container annotations. Values that fail to parse are
/// logged and left at their defaults.
pub fn get_container_info_from_annotations(
    annotations: &BTreeMap<String, String>,
) -> AnnotatedContainerInfo {
    let mut info = AnnotatedContainerInfo::default();
    if let Some(hash) = annotations.get(CONTAINER_HASH_ANNOTATION) {
        match u64::from_str_radix(hash, 16) {
            Ok(h) => info.hash = h,
            Err(e) => warn!(value = %hash, error = %e, "unable to parse container hash"),
        }
    }
    if let Some(count) = annotations.get(CONTAINER_RESTART_COUNT_ANNOTATION) {
        match count.parse() {
            Ok(c) => info.restart_count = c,
            Err(e) => warn!(value = %count, error = %e, "unable to parse restart count"),
        }
    }
    if let Some(grace) = annotations.get(POD_TERMINATION_GRACE_PERIOD_ANNOTATION) {
        match grace.parse() {
            Ok(g) => info.pod_termination_grace_period = Some(g),
            Err(e) => warn!(value = %grace, error = %e, "unable to parse grace period"),
        }
    }
    if let Some(path) = annotations.get(CONTAINER_TERMINATION_MESSAGE_PATH_ANNOTATION) {
        info.termination_message_path = path.clone();
    }
    info
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::container::hash_container;
    use crate::pod::{ObjectMeta, PodSpec};

    #[test]
    fn test_container_labels_and_annotations_round_trip() {
        let container = Container {
            name: "app".to_owned(),
            image: "nginx".to_owned(),
            termination_message_path: Some("/dev/termination-log".to_owned()),
            ..Default::default()
        };
        let pod = Pod {
            metadata: ObjectMeta {
                name: "web".to_owned(),
                namespace: Some("prod".to_owned()),
                uid: "u1".to_owned(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![container.clone()],
                termination_grace_period_seconds: Some(45),
                ..Default::default()
            },
            ..Default::default()
        };

        let info = get_container_info_from_labels(&new_container_labels(&container, &pod));
        assert_eq!(
            info,
            LabeledContainerInfo {
                pod_name: "web".to_owned(),
                pod_namespace: "prod".to_owned(),
                pod_tenant: "system".to_owned(),
                pod_uid: "u1".to_owned(),
                container_name: "app".to_owned(),
            }
        );

        let info =
            get_container_info_from_annotations(&new_container_annotations(&container, &pod, 3));
        assert_eq!(info.hash, hash_container(&container));
        assert_eq!(info.restart_count, 3);
        assert_eq!(info.pod_termination_grace_period, Some(45));
        assert_eq!(info.termination_message_path, "/dev/termination-log");
    }

    #[test]
    fn test_bad_annotations_fall_back_to_defaults() {
        let mut annotations = BTreeMap::new();
        annotations.insert(CONTAINER_HASH_ANNOTATION.to_owned(), "zz".to_owned());
        annotations.insert(
            CONTAINER_RESTART_COUNT_ANNOTATION.to_owned(),
            "many".to_owned(),
        );
        let info = get_container_info_from_annotations(&annotations);
        assert_eq!(info, AnnotatedContainerInfo::default());
    }
}
