//! The sync driver: one pass of reconciling a pod against the runtime.

use tracing::{debug, error, info, instrument};

use super::result::{PodSyncResult, SyncAction, SyncError, SyncResult};
use super::RuntimeManager;
use crate::container::{Container, PodStatus, RunningPod};
use crate::events::{self, EventType, ObjectReference};
use crate::pod::Pod;
use crate::runtime::types::PodSandboxConfig;
use crate::runtime::{ImageService, RuntimeEndpoint};

impl RuntimeManager {
    /// Syncs a pod to its desired state:
    ///
    /// 1. Compute sandbox and container changes.
    /// 2. Kill the pod sandbox if necessary, otherwise kill the containers that should go.
    /// 3. Create the sandbox if necessary.
    /// 4. Start the next init container.
    /// 5. Start the containers that should run.
    /// 6. Resize running containers in place.
    /// 7. Restart containers whose resize required it.
    /// 8. Hot plug NICs.
    #[instrument(level = "info", skip_all, fields(pod = %pod.full_name()))]
    pub async fn sync_pod(&self, pod: &Pod, status: &PodStatus) -> PodSyncResult {
        let mut result = PodSyncResult::default();

        let endpoint = match self.bindings.get_runtime_service_for_pod(pod).await {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, "no runtime service for pod");
                result.fail(SyncError::RuntimeUnavailable(e.to_string()));
                return result;
            }
        };
        let image_endpoint = match self.bindings.get_image_service_for_pod(pod) {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, "no image service for pod");
                result.fail(SyncError::RuntimeUnavailable(e.to_string()));
                return result;
            }
        };

        let actions = self.compute_pod_actions(pod, status);
        debug!(
            kill_pod = actions.kill_pod,
            create_sandbox = actions.create_sandbox,
            attempt = actions.attempt,
            start = actions.containers_to_start.len(),
            kill = actions.containers_to_kill.len(),
            resize = actions.containers_to_update.len(),
            "computed pod actions"
        );
        if actions.create_sandbox {
            if actions.sandbox_id.is_empty() {
                info!("new pod, creating a sandbox for it");
            } else {
                info!(sandbox_id = %actions.sandbox_id, "pod sandbox changed, it will be killed and re-created");
                self.recorder.event(
                    &ObjectReference::for_pod(pod),
                    EventType::Normal,
                    events::SANDBOX_CHANGED,
                    "Pod sandbox changed, it will be killed and re-created.",
                );
            }
        }

        if actions.kill_pod {
            if actions.create_sandbox {
                info!("stopping pod sandbox, will start a new one");
            } else {
                info!("killing unwanted pod");
            }
            let running = RunningPod::from_pod_status(&endpoint.name, status);
            let kill = self
                .kill_pod_with_sync_result(&endpoint, Some(pod), &running, None)
                .await;
            let failed = kill.has_failures();
            result.add_pod_sync_result(kill);
            if failed {
                error!("killing pod failed, aborting sync");
                result.fail(SyncError::KillPodFailed(format!(
                    "failed to kill pod {}",
                    pod.full_name()
                )));
                return result;
            }
            if actions.create_sandbox {
                self.purge_init_containers(&endpoint, pod, status).await;
            }
        } else {
            for (id, kill) in &actions.containers_to_kill {
                let mut r = SyncResult::new(SyncAction::KillContainer, kill.name.clone());
                let outcome = self
                    .kill_container(&endpoint, Some(pod), id, &kill.name, &kill.message, None)
                    .await;
                if let Err(e) = outcome {
                    error!(container = %kill.name, container_id = %id, error = %e, "killing container failed");
                    r.fail(e.clone(), e.to_string());
                    result.add_sync_result(r);
                    return result;
                }
                result.add_sync_result(r);
            }
        }

        self.prune_init_containers_before_start(&endpoint, pod, status)
            .await;

        let mut sandbox_id = actions.sandbox_id.clone();
        if actions.create_sandbox {
            let mut r = SyncResult::new(SyncAction::CreatePodSandbox, pod.full_name());
            match self.create_pod_sandbox(&endpoint, pod, actions.attempt).await {
                Ok(id) => sandbox_id = id,
                Err(e) => {
                    self.recorder.event(
                        &ObjectReference::for_pod(pod),
                        EventType::Warning,
                        events::FAILED_CREATE_POD_SANDBOX,
                        &e.to_string(),
                    );
                    r.fail(e.clone(), e.to_string());
                    result.add_sync_result(r);
                    return result;
                }
            }
            result.add_sync_result(r);
            self.bindings.set(pod.pod_uid(), endpoint.clone()).await;

            // The new sandbox must answer a status read before containers go into it. Its IP
            // reaches the pod through the next get_pod_status.
            match endpoint.service.pod_sandbox_status(&sandbox_id).await {
                Ok(s) if !pod.is_host_network() => {
                    debug!(sandbox_id = %sandbox_id, ip = %s.ip, "sandbox created")
                }
                Ok(_) => (),
                Err(e) => {
                    let err = SyncError::CreateSandboxFailed(format!(
                        "failed to get status of sandbox {:?}: {}",
                        sandbox_id, e
                    ));
                    self.recorder.event(
                        &ObjectReference::for_pod(pod),
                        EventType::Warning,
                        events::FAILED_CREATE_POD_SANDBOX,
                        &err.to_string(),
                    );
                    result.fail(err);
                    return result;
                }
            }
        }

        let mut r = SyncResult::new(SyncAction::ConfigPodSandbox, sandbox_id.clone());
        let sandbox_config = match self.generate_pod_sandbox_config(pod, actions.attempt) {
            Ok(c) => c,
            Err(e) => {
                r.fail(e.clone(), e.to_string());
                result.add_sync_result(r);
                return result;
            }
        };
        result.add_sync_result(r);

        let image_service = image_endpoint.service.as_ref();
        if let Some(init) = &actions.next_init_container_to_start {
            let started = self
                .start_with_back_off(
                    &endpoint,
                    image_service,
                    &sandbox_id,
                    &sandbox_config,
                    init,
                    pod,
                    status,
                    &mut result,
                )
                .await;
            if !started {
                return result;
            }
            info!(container = %init.name, "started init container");
        }

        for idx in &actions.containers_to_start {
            if let Some(container) = pod.spec.containers.get(*idx) {
                self.start_with_back_off(
                    &endpoint,
                    image_service,
                    &sandbox_id,
                    &sandbox_config,
                    container,
                    pod,
                    status,
                    &mut result,
                )
                .await;
            }
        }

        if !actions.containers_to_update.is_empty() || actions.update_pod_resources {
            self.do_pod_resize_action(&endpoint, pod, &actions, &mut result)
                .await;
        }

        for idx in &actions.containers_to_restart {
            if let Some(container) = pod.spec.containers.get(*idx) {
                self.start_with_back_off(
                    &endpoint,
                    image_service,
                    &sandbox_id,
                    &sandbox_config,
                    container,
                    pod,
                    status,
                    &mut result,
                )
                .await;
            }
        }

        if !actions.hotplugs.is_empty() && !sandbox_id.is_empty() {
            let hotplug = self
                .apply_hotplugs(&endpoint, pod, &sandbox_id, &actions.hotplugs)
                .await;
            result.add_pod_sync_result(hotplug);
        }

        result
    }

    // Records a StartContainer result; returns whether the container was started.
    #[allow(clippy::too_many_arguments)]
    async fn start_with_back_off(
        &self,
        endpoint: &RuntimeEndpoint,
        image_service: &dyn ImageService,
        sandbox_id: &str,
        sandbox_config: &PodSandboxConfig,
        container: &Container,
        pod: &Pod,
        status: &PodStatus,
        result: &mut PodSyncResult,
    ) -> bool {
        let mut r = SyncResult::new(SyncAction::StartContainer, container.name.clone());
        if let Err(e) = self.do_back_off(pod, container, status).await {
            info!(container = %container.name, "backing off restarting failed container");
            r.fail(e.clone(), e.to_string());
            result.add_sync_result(r);
            return false;
        }
        let outcome = self
            .start_container(
                endpoint,
                image_service,
                sandbox_id,
                sandbox_config,
                container,
                pod,
                status,
            )
            .await;
        let started = match outcome {
            Ok(()) => true,
            Err(e) => {
                match e {
                    SyncError::ImagePullBackOff(_) => {
                        info!(container = %container.name, error = %e, "container start backing off image pull")
                    }
                    _ => error!(container = %container.name, error = %e, "container start failed"),
                }
                r.fail(e.clone(), e.to_string());
                false
            }
        };
        result.add_sync_result(r);
        started
    }
}

#[cfg(test)]
mod test {
    use super::super::test_util::{harness, harness_with_clock, Harness};
    use super::*;
    use crate::container::ContainerState;
    use crate::pod::{ObjectMeta, PodSpec, VirtualMachine};
    use crate::runtime::types::PodSandboxState;
    use crate::runtime::RuntimeService;
    use chrono::{TimeZone, Utc};

    fn pod(inits: &[&str], containers: &[&str]) -> Pod {
        let spec = |n: &&str| Container {
            name: (*n).to_owned(),
            image: "busybox".to_owned(),
            ..Default::default()
        };
        Pod {
            metadata: ObjectMeta {
                name: "web".to_owned(),
                uid: "u1".to_owned(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: containers.iter().map(spec).collect(),
                init_containers: inits.iter().map(spec).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn status(h: &Harness, pod: &Pod) -> PodStatus {
        h.manager
            .get_pod_status(pod.pod_uid(), pod.name(), pod.namespace(), pod.tenant())
            .await
            .unwrap()
    }

    async fn sync(h: &Harness, pod: &Pod) -> PodSyncResult {
        let s = status(h, pod).await;
        h.manager.sync_pod(pod, &s).await
    }

    #[tokio::test]
    async fn test_new_pod_round_trips_to_no_op() {
        let h = harness(|_| ());
        let pod = pod(&[], &["app", "sidecar"]);
        let result = sync(&h, &pod).await;
        assert!(result.error().is_ok(), "{:?}", result.error());
        assert_eq!(h.manager.bindings().len().await, 1);

        let s = status(&h, &pod).await;
        assert_eq!(s.ip, crate::runtime::fake::FAKE_POD_SANDBOX_IP);
        assert_eq!(s.sandbox_statuses.len(), 1);
        assert_eq!(s.running_container_statuses().len(), 2);

        let actions = h.manager.compute_pod_actions(&pod, &s);
        assert!(!actions.kill_pod);
        assert!(!actions.create_sandbox);
        assert!(actions.containers_to_start.is_empty());
        assert!(actions.containers_to_kill.is_empty());

        h.runtime.clear_calls().await;
        let result = h.manager.sync_pod(&pod, &s).await;
        assert!(!result.has_failures());
        let calls = h.runtime.calls().await;
        assert!(!calls.iter().any(|c| c.starts_with("CreateContainer")
            || c.starts_with("StopContainer")
            || c.starts_with("RunPodSandbox")));
    }

    #[tokio::test]
    async fn test_kill_pod_stops_containers_and_sandbox() {
        let h = harness(|_| ());
        let pod = pod(&[], &["app"]);
        sync(&h, &pod).await;
        let s = status(&h, &pod).await;
        let running = RunningPod::from_pod_status("default", &s);

        let result = h.manager.kill_pod(Some(&pod), &running, None).await;
        assert!(!result.has_failures());
        let calls = h.runtime.calls().await;
        assert!(calls.contains(&"StopContainer web_default_u1_0_app_0".to_owned()));
        assert!(calls.contains(&"StopPodSandbox web_default_u1_0".to_owned()));
        assert_eq!(h.runtime.sandboxes().await[0].state, PodSandboxState::NotReady);
        assert!(h.recorder.reasons().contains(&events::KILLING.to_owned()));

        h.runtime.inject_error("StopPodSandbox", "busy").await;
        let result = h.manager.kill_pod(None, &running, Some(0)).await;
        let failed: Vec<SyncAction> = result.failures().map(|r| r.action).collect();
        assert_eq!(failed, vec![SyncAction::KillPodSandbox]);
    }

    #[tokio::test]
    async fn test_init_containers_gate_regular_containers() {
        let h = harness(|_| ());
        let pod = pod(&["init"], &["app"]);
        let result = sync(&h, &pod).await;
        assert!(!result.has_failures());
        let created: Vec<String> = h
            .runtime
            .calls()
            .await
            .into_iter()
            .filter(|c| c.starts_with("CreateContainer"))
            .collect();
        assert_eq!(created, vec!["CreateContainer web_default_u1_0_init_0"]);

        // Running init container blocks everything.
        h.runtime.clear_calls().await;
        sync(&h, &pod).await;
        assert!(!h
            .runtime
            .calls()
            .await
            .iter()
            .any(|c| c.starts_with("CreateContainer")));

        h.runtime
            .modify_container("web_default_u1_0_init_0", |s| {
                s.state = ContainerState::Exited;
                s.exit_code = 0;
                s.finished_at = 100;
            })
            .await;
        h.runtime.clear_calls().await;
        sync(&h, &pod).await;
        let created: Vec<String> = h
            .runtime
            .calls()
            .await
            .into_iter()
            .filter(|c| c.starts_with("CreateContainer"))
            .collect();
        assert_eq!(created, vec!["CreateContainer web_default_u1_0_app_0"]);
    }

    #[tokio::test]
    async fn test_lost_sandbox_is_recreated() {
        let h = harness(|_| ());
        let pod = pod(&[], &["app"]);
        sync(&h, &pod).await;
        h.runtime.stop_pod_sandbox("web_default_u1_0").await.unwrap();
        h.runtime.clear_calls().await;

        let result = sync(&h, &pod).await;
        assert!(!result.has_failures(), "{:?}", result.error());
        let calls = h.runtime.calls().await;
        let position = |call: &str| calls.iter().position(|c| c == call).unwrap();
        assert!(
            position("StopContainer web_default_u1_0_app_0")
                < position("RunPodSandbox web_default_u1_1")
        );
        assert!(
            position("RunPodSandbox web_default_u1_1")
                < position("CreateContainer web_default_u1_1_app_1")
        );
        assert!(h
            .recorder
            .reasons()
            .contains(&events::SANDBOX_CHANGED.to_owned()));

        let s = status(&h, &pod).await;
        assert_eq!(s.sandbox_statuses[0].id, "web_default_u1_1");
        assert_eq!(s.find_container_status_by_name("app").unwrap().restart_count, 1);
    }

    #[tokio::test]
    async fn test_lost_sandbox_restarts_init_containers() {
        let h = harness(|_| ());
        let pod = pod(&["init"], &["app"]);
        sync(&h, &pod).await;
        h.runtime
            .modify_container("web_default_u1_0_init_0", |s| {
                s.state = ContainerState::Exited;
                s.exit_code = 0;
                s.finished_at = 100;
            })
            .await;
        sync(&h, &pod).await;
        h.runtime.stop_pod_sandbox("web_default_u1_0").await.unwrap();
        h.runtime.clear_calls().await;

        let result = sync(&h, &pod).await;
        assert!(!result.has_failures(), "{:?}", result.error());
        let calls = h.runtime.calls().await;
        let position = |call: &str| {
            calls
                .iter()
                .position(|c| c == call)
                .unwrap_or_else(|| panic!("{} not in {:?}", call, calls))
        };
        let order = [
            "StopContainer web_default_u1_0_app_0",
            "StopPodSandbox web_default_u1_0",
            "RemoveContainer web_default_u1_0_init_0",
            "RunPodSandbox web_default_u1_1",
            "CreateContainer web_default_u1_1_init_1",
        ];
        for pair in order.windows(2) {
            assert!(position(pair[0]) < position(pair[1]), "{:?}", calls);
        }
        assert!(!calls
            .iter()
            .any(|c| c.starts_with("CreateContainer") && c.ends_with("_app_1")));
    }

    #[tokio::test]
    async fn test_image_pull_failure_blocks_container() {
        let h = harness(|_| ());
        h.images.set_pull_error(Some("registry down")).await;
        let pod = pod(&[], &["app"]);
        let result = sync(&h, &pod).await;
        let failed: Vec<SyncAction> = result.failures().map(|r| r.action).collect();
        assert_eq!(failed, vec![SyncAction::StartContainer]);
        assert!(h
            .images
            .calls()
            .await
            .contains(&"PullImage busybox".to_owned()));
        assert!(!h
            .runtime
            .calls()
            .await
            .iter()
            .any(|c| c.starts_with("CreateContainer")));
    }

    #[tokio::test]
    async fn test_sandbox_creation_failure_aborts_sync() {
        let h = harness(|_| ());
        h.runtime.inject_error("RunPodSandbox", "no capacity").await;
        let pod = pod(&[], &["app"]);
        let result = sync(&h, &pod).await;
        let failed: Vec<SyncAction> = result.failures().map(|r| r.action).collect();
        assert_eq!(failed, vec![SyncAction::CreatePodSandbox]);
        assert!(!h
            .runtime
            .calls()
            .await
            .iter()
            .any(|c| c.starts_with("CreateContainer")));
        assert_eq!(
            h.recorder.reasons(),
            vec![events::FAILED_CREATE_POD_SANDBOX]
        );
        assert!(h.manager.bindings().is_empty().await);
    }

    #[tokio::test]
    async fn test_unreadable_new_sandbox_aborts_sync() {
        let h = harness(|_| ());
        h.runtime.inject_error("PodSandboxStatus", "socket closed").await;
        let pod = pod(&[], &["app"]);
        let result = sync(&h, &pod).await;
        assert!(result.has_failures());
        assert!(h
            .runtime
            .calls()
            .await
            .contains(&"PodSandboxStatus web_default_u1_0".to_owned()));
        assert!(!h
            .runtime
            .calls()
            .await
            .iter()
            .any(|c| c.starts_with("CreateContainer")));
        assert_eq!(
            h.recorder.reasons(),
            vec![events::FAILED_CREATE_POD_SANDBOX]
        );
    }

    #[tokio::test]
    async fn test_crashing_container_backs_off() {
        let h = harness_with_clock(|_| (), Utc.timestamp_nanos(1_000_000));
        let pod = pod(&[], &["app"]);
        sync(&h, &pod).await;

        h.runtime
            .modify_container("web_default_u1_0_app_0", |s| {
                s.state = ContainerState::Exited;
                s.exit_code = 1;
                s.finished_at = 50;
            })
            .await;
        let result = sync(&h, &pod).await;
        assert!(!result.has_failures());

        h.runtime
            .modify_container("web_default_u1_0_app_1", |s| {
                s.state = ContainerState::Exited;
                s.exit_code = 1;
                s.finished_at = 60;
            })
            .await;
        let result = sync(&h, &pod).await;
        let failure = result.failures().next().unwrap();
        assert_eq!(failure.action, SyncAction::StartContainer);
        assert!(matches!(
            failure.error,
            Some(SyncError::CrashLoopBackOff(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_vm_runtime_fails_sync() {
        let h = harness(|_| ());
        let mut pod = pod(&[], &[]);
        pod.spec.virtual_machine = Some(VirtualMachine {
            name: "vm".to_owned(),
            image: "cirros".to_owned(),
            ..Default::default()
        });
        let result = h.manager.sync_pod(&pod, &PodStatus::default()).await;
        assert!(matches!(
            result.sync_error,
            Some(SyncError::RuntimeUnavailable(_))
        ));
        assert!(h.runtime.calls().await.is_empty());
    }
}
