//! User-visible events emitted while syncing and scheduling pods.

use tracing::{info, warn};

use crate::pod::Pod;

/// A container is being killed.
pub const KILLING: &str = "Killing";
/// A container was created.
pub const CREATED: &str = "Created";
/// A container was started.
pub const STARTED: &str = "Started";
/// A container failed to be created or started.
pub const FAILED: &str = "Failed";
/// A container or image pull is backing off.
pub const BACK_OFF: &str = "BackOff";
/// An image is being pulled.
pub const PULLING: &str = "Pulling";
/// An image was pulled.
pub const PULLED: &str = "Pulled";
/// A pull was refused by the pull policy.
pub const ERR_IMAGE_NEVER_PULL: &str = "ErrImageNeverPull";
/// The sandbox changed and will be recreated.
pub const SANDBOX_CHANGED: &str = "SandboxChanged";
/// Creating the sandbox failed.
pub const FAILED_CREATE_POD_SANDBOX: &str = "FailedCreatePodSandBox";
/// A pod sync failed.
pub const FAILED_SYNC: &str = "FailedSync";
/// A pod was resized in place.
pub const RESIZED: &str = "Resized";
/// A NIC failed to hot plug.
pub const FAILED_HOTPLUG: &str = "FailedHotplug";
/// The scheduler could not place a pod.
pub const FAILED_SCHEDULING: &str = "FailedScheduling";
/// The scheduler placed a pod.
pub const SCHEDULED: &str = "Scheduled";

/// Severity of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Informational.
    Normal,
    /// Something went wrong.
    Warning,
}

/// Names the object an event is about: a pod, or one container of a pod.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectReference {
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Pod tenant.
    pub tenant: String,
    /// Pod uid.
    pub uid: String,
    /// `spec.containers{name}` when the event is about a container.
    pub field_path: Option<String>,
}

impl ObjectReference {
    /// A reference to a pod.
    pub fn for_pod(pod: &Pod) -> Self {
        ObjectReference {
            name: pod.name().to_owned(),
            namespace: pod.namespace().to_owned(),
            tenant: pod.tenant().to_owned(),
            uid: pod.pod_uid().to_owned(),
            field_path: None,
        }
    }

    /// A reference to one container of a pod.
    pub fn for_container(pod: &Pod, container_name: &str) -> Self {
        let is_init = pod
            .spec
            .init_containers
            .iter()
            .any(|c| c.name == container_name);
        let field = if is_init {
            "spec.initContainers"
        } else {
            "spec.containers"
        };
        ObjectReference {
            field_path: Some(format!("{}{{{}}}", field, container_name)),
            ..Self::for_pod(pod)
        }
    }
}

/// A recorded event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// The object concerned.
    pub object: ObjectReference,
    /// Severity.
    pub event_type: EventType,
    /// Machine readable reason, one of the constants of this module.
    pub reason: String,
    /// Human readable message.
    pub message: String,
}

/// Sink for user-visible events.
pub trait EventRecorder: Send + Sync {
    /// Records an event.
    fn event(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str);
}

/// Writes events to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingRecorder;

impl EventRecorder for LoggingRecorder {
    fn event(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        let field_path = object.field_path.as_deref().unwrap_or("");
        match event_type {
            EventType::Normal => info!(
                pod = %object.name,
                namespace = %object.namespace,
                tenant = %object.tenant,
                field_path,
                reason,
                "{}",
                message
            ),
            EventType::Warning => warn!(
                pod = %object.name,
                namespace = %object.namespace,
                tenant = %object.tenant,
                field_path,
                reason,
                "{}",
                message
            ),
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct FakeRecorder {
    events: std::sync::Mutex<Vec<Event>>,
}

impl FakeRecorder {
    /// Every event recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The reasons of every event recorded so far.
    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

impl EventRecorder for FakeRecorder {
    fn event(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Event {
                object: object.clone(),
                event_type,
                reason: reason.to_owned(),
                message: message.to_owned(),
            });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::container::Container;
    use crate::pod::{ObjectMeta, PodSpec};

    #[test]
    fn test_container_reference() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: "web".to_owned(),
                uid: "u1".to_owned(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: "app".to_owned(),
                    ..Default::default()
                }],
                init_containers: vec![Container {
                    name: "setup".to_owned(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        let r = ObjectReference::for_container(&pod, "app");
        assert_eq!(r.field_path.as_deref(), Some("spec.containers{app}"));
        assert_eq!(r.tenant, "system");
        let r = ObjectReference::for_container(&pod, "setup");
        assert_eq!(r.field_path.as_deref(), Some("spec.initContainers{setup}"));

        let recorder = FakeRecorder::default();
        recorder.event(&r, EventType::Normal, STARTED, "Started container setup");
        assert_eq!(recorder.reasons(), vec![STARTED.to_owned()]);
    }
}
