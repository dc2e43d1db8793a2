//! NIC hot plug into running sandboxes.

use tracing::{info, warn};

use super::actions::Hotplugs;
use super::result::{PodSyncResult, SyncAction, SyncError, SyncResult};
use super::RuntimeManager;
use crate::events::{self, EventType, ObjectReference};
use crate::pod::{Nic, Pod};
use crate::runtime::RuntimeEndpoint;

impl RuntimeManager {
    /// Attaches, then detaches, the planned NICs. Failures are recorded and do not stop the
    /// remaining NICs.
    pub(crate) async fn apply_hotplugs(
        &self,
        endpoint: &RuntimeEndpoint,
        pod: &Pod,
        sandbox_id: &str,
        hotplugs: &Hotplugs,
    ) -> PodSyncResult {
        let mut result = PodSyncResult::default();
        for nic in &hotplugs.nics_to_attach {
            let outcome = endpoint
                .service
                .attach_network_interface(sandbox_id, nic)
                .await;
            result.add_sync_result(self.hotplug_result(pod, nic, SyncAction::AttachNic, outcome));
        }
        for nic in &hotplugs.nics_to_detach {
            let outcome = endpoint
                .service
                .detach_network_interface(sandbox_id, nic)
                .await;
            result.add_sync_result(self.hotplug_result(pod, nic, SyncAction::DetachNic, outcome));
        }
        result
    }

    fn hotplug_result(
        &self,
        pod: &Pod,
        nic: &Nic,
        action: SyncAction,
        outcome: anyhow::Result<()>,
    ) -> SyncResult {
        let mut r = SyncResult::new(action, nic.name.clone());
        match outcome {
            Ok(()) => info!(pod = %pod.full_name(), nic = %nic.name, %action, "hot plugged nic"),
            Err(e) => {
                let message = format!("{} of nic {:?} failed: {}", action, nic.name, e);
                warn!(pod = %pod.full_name(), nic = %nic.name, error = %e, "nic hot plug failed");
                self.recorder.event(
                    &ObjectReference::for_pod(pod),
                    EventType::Warning,
                    events::FAILED_HOTPLUG,
                    &message,
                );
                r.fail(SyncError::HotplugFailed(message.clone()), message);
            }
        }
        r
    }
}

#[cfg(test)]
mod test {
    use super::super::test_util::harness;
    use super::*;
    use crate::pod::ObjectMeta;
    use crate::runtime::types::{NicStatus, PodSandboxStatus};

    fn nic(name: &str) -> Nic {
        Nic {
            name: name.to_owned(),
            port_id: format!("port-{}", name),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_other_nics() {
        let h = harness(|_| ());
        h.runtime
            .set_fake_sandboxes(vec![PodSandboxStatus {
                id: "s1".to_owned(),
                nics: Some(vec![NicStatus {
                    name: "eth9".to_owned(),
                    port_id: "port-eth9".to_owned(),
                    ready: true,
                }]),
                ..Default::default()
            }])
            .await;
        h.runtime
            .inject_error("AttachNetworkInterface", "port in use")
            .await;
        let pod = Pod {
            metadata: ObjectMeta {
                name: "web".to_owned(),
                uid: "u1".to_owned(),
                ..Default::default()
            },
            ..Default::default()
        };
        let endpoint = h
            .manager
            .bindings()
            .registry()
            .get_primary_runtime_service()
            .unwrap()
            .clone();
        let hotplugs = Hotplugs {
            nics_to_attach: vec![nic("eth1"), nic("eth2")],
            nics_to_detach: vec![nic("eth9")],
        };
        let result = h
            .manager
            .apply_hotplugs(&endpoint, &pod, "s1", &hotplugs)
            .await;

        let outcomes: Vec<(SyncAction, bool)> = result
            .sync_results
            .iter()
            .map(|r| (r.action, r.error.is_some()))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                (SyncAction::AttachNic, true),
                (SyncAction::AttachNic, true),
                (SyncAction::DetachNic, false),
            ]
        );
        assert_eq!(
            h.recorder.reasons(),
            vec![events::FAILED_HOTPLUG, events::FAILED_HOTPLUG]
        );
        let nics = h.runtime.sandboxes().await[0].nics.clone().unwrap();
        assert!(nics.is_empty());
    }
}
