use std::collections::HashMap;
use std::sync::Arc;

use compute_client::client::{Network, SecurityGroup, ServerRequest, ServerStatus};
use compute_client::Client;
use kubelet::events::{self, EventRecorder, EventType, ObjectReference};
use kubelet::Pod;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::algorithm::{ScheduleAlgorithm, ScheduleResult};
use crate::condition::{self, PodStatusUpdater};
use crate::config::SchedulerConfig;
use crate::queue::SchedulingQueue;
use crate::ScheduleError;

/// A pod on its way to a host.
#[derive(Clone, Debug)]
pub struct ScheduledPod {
    /// The pod.
    pub pod: Pod,
    /// Where it goes.
    pub result: ScheduleResult,
    /// The server created for it, once there is one.
    pub server_id: Option<String>,
    /// Failed attempts before this one.
    pub retries: u32,
}

/// Builds the server to create for a VM pod: its VM name, image and first flavor, attached to
/// the network of the first NIC and guarded by the first security group.
pub fn server_request(pod: &Pod) -> Result<ServerRequest, ScheduleError> {
    let vm = pod
        .spec
        .virtual_machine
        .as_ref()
        .ok_or_else(|| ScheduleError::NotVmPod(pod.full_name()))?;
    Ok(ServerRequest {
        name: vm.name.clone(),
        image_ref: vm.image.clone(),
        flavor_ref: vm
            .flavors
            .first()
            .map(|f| f.flavor_id.clone())
            .unwrap_or_default(),
        networks: pod
            .spec
            .nics
            .first()
            .map(|n| Network {
                uuid: n.uuid.clone(),
            })
            .into_iter()
            .collect(),
        security_groups: vm
            .security_groups
            .first()
            .map(|name| SecurityGroup { name: name.clone() })
            .into_iter()
            .collect(),
    })
}

/// Schedules pods off a [`SchedulingQueue`] onto cloud hosts.
///
/// Scheduling a pod picks its host and hands it to a task that creates the server and polls it.
/// A failed attempt puts the pod back on the queue; the attempt after the last allowed one marks
/// the pod failed instead.
pub struct Scheduler {
    config: SchedulerConfig,
    queue: Arc<SchedulingQueue>,
    algorithm: Arc<dyn ScheduleAlgorithm>,
    client: Arc<Client>,
    status: Arc<dyn PodStatusUpdater>,
    recorder: Arc<dyn EventRecorder>,
    // Failed attempts by pod uid.
    retries: Mutex<HashMap<String, u32>>,
    scheduled_tx: mpsc::Sender<ScheduledPod>,
    scheduled_rx: Mutex<mpsc::Receiver<ScheduledPod>>,
}

impl Scheduler {
    /// Create a scheduler pulling from the given queue.
    pub fn new(
        config: SchedulerConfig,
        queue: Arc<SchedulingQueue>,
        algorithm: Arc<dyn ScheduleAlgorithm>,
        client: Arc<Client>,
        status: Arc<dyn PodStatusUpdater>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Arc<Self> {
        let (scheduled_tx, scheduled_rx) = mpsc::channel(config.queue_capacity.max(1));
        Arc::new(Scheduler {
            config,
            queue,
            algorithm,
            client,
            status,
            recorder,
            retries: Mutex::new(HashMap::new()),
            scheduled_tx,
            scheduled_rx: Mutex::new(scheduled_rx),
        })
    }

    /// The queue pods are scheduled from.
    pub fn queue(&self) -> &Arc<SchedulingQueue> {
        &self.queue
    }

    /// Failed attempts recorded for a pod.
    pub async fn retries(&self, uid: &str) -> u32 {
        self.retries.lock().await.get(uid).copied().unwrap_or(0)
    }

    /// Schedules pods until the queue is closed. Spawned server tasks keep running.
    pub async fn run(self: Arc<Self>) {
        info!("starting scheduler");
        while let Some(pod) = self.queue.pop().await {
            self.schedule_one(pod).await;
        }
        info!("scheduling queue closed, scheduler exiting");
    }

    /// Schedules one pod. Returns the task that drives the pod's server, if one was started.
    #[instrument(level = "info", skip_all, fields(pod = %pod.full_name()))]
    pub async fn schedule_one(self: &Arc<Self>, pod: Pod) -> Option<JoinHandle<()>> {
        if pod.is_terminating() {
            let err = ScheduleError::PodBeingDeleted(pod.full_name());
            self.recorder.event(
                &ObjectReference::for_pod(&pod),
                EventType::Warning,
                events::FAILED_SCHEDULING,
                &err.to_string(),
            );
            return None;
        }

        let retries = self.retries(pod.pod_uid()).await;
        if retries >= self.config.reschedule_limit {
            let err = ScheduleError::RetryLimitReached {
                pod: pod.full_name(),
                attempts: retries,
            };
            error!(error = %err, "giving up on pod");
            self.recorder.event(
                &ObjectReference::for_pod(&pod),
                EventType::Warning,
                events::FAILED_SCHEDULING,
                &err.to_string(),
            );
            self.write_status(&pod, condition::failed(&pod.status, err.to_string()))
                .await;
            self.retries.lock().await.remove(pod.pod_uid());
            return None;
        }

        let result = match self.algorithm.global_schedule(&pod).await {
            Ok(r) => r,
            Err(e) => {
                self.reschedule(pod, &e).await;
                return None;
            }
        };
        debug!(
            host = %result.suggested_host,
            evaluated = result.evaluated_nodes,
            feasible = result.feasible_nodes,
            "pod scheduled"
        );

        let scheduled = ScheduledPod {
            pod,
            result,
            server_id: None,
            retries,
        };
        if self.scheduled_tx.send(scheduled).await.is_err() {
            // The receiver lives as long as the scheduler.
            error!("scheduled pod queue is closed");
            return None;
        }
        let scheduler = Arc::clone(self);
        Some(tokio::spawn(async move {
            let next = scheduler.scheduled_rx.lock().await.recv().await;
            if let Some(scheduled) = next {
                scheduler.run_scheduled(scheduled).await;
            }
        }))
    }

    async fn run_scheduled(&self, mut scheduled: ScheduledPod) {
        let host = scheduled.result.suggested_host.clone();
        match self.create_and_wait(&mut scheduled).await {
            Ok(()) => {
                info!(pod = %scheduled.pod.full_name(), %host, "server is active");
                self.retries.lock().await.remove(scheduled.pod.pod_uid());
                self.recorder.event(
                    &ObjectReference::for_pod(&scheduled.pod),
                    EventType::Normal,
                    events::SCHEDULED,
                    &format!(
                        "Successfully assigned {} to {}",
                        scheduled.pod.full_name(),
                        host
                    ),
                );
                let status = condition::running(&scheduled.pod.status, &host);
                self.write_status(&scheduled.pod, status).await;
            }
            Err(e) => {
                if let Some(id) = scheduled.server_id.as_deref() {
                    if let Err(delete) = self.client.delete_server(&host, id).await {
                        warn!(server = %id, %host, error = %delete, "unable to delete failed server");
                    }
                }
                self.reschedule(scheduled.pod, &e).await;
            }
        }
    }

    async fn create_and_wait(&self, scheduled: &mut ScheduledPod) -> Result<(), ScheduleError> {
        let host = scheduled.result.suggested_host.clone();
        let request = server_request(&scheduled.pod)?;
        let id = self.client.create_server(&host, &request).await?;
        debug!(server = %id, %host, "server created");
        scheduled.server_id = Some(id.clone());
        self.wait_for_active(&host, &id).await
    }

    async fn wait_for_active(&self, host: &str, id: &str) -> Result<(), ScheduleError> {
        for _ in 0..self.config.max_build_polls {
            tokio::time::sleep(self.config.poll_interval).await;
            match self.client.server_status(host, id).await {
                Ok(ServerStatus::Active) => return Ok(()),
                Ok(ServerStatus::Error) => return Err(ScheduleError::InstanceError(id.to_owned())),
                Ok(status) => debug!(server = %id, ?status, "server not active yet"),
                Err(e) => warn!(server = %id, error = %e, "unable to read server status"),
            }
        }
        Err(ScheduleError::BuildTimeout {
            server: id.to_owned(),
            polls: self.config.max_build_polls,
        })
    }

    // Counts the failed attempt and puts the pod back on the queue.
    async fn reschedule(&self, pod: Pod, err: &ScheduleError) {
        let attempts = {
            let mut retries = self.retries.lock().await;
            let count = retries.entry(pod.pod_uid().to_owned()).or_insert(0);
            *count += 1;
            *count
        };
        match err {
            ScheduleError::Compute(e) if e.kind() == kubelet::error::ErrorKind::CapacityExceeded => {
                warn!(pod = %pod.full_name(), attempts, kind = %err.kind(), error = %err, "rescheduling pod")
            }
            _ => error!(pod = %pod.full_name(), attempts, kind = %err.kind(), error = %err, "rescheduling pod"),
        }
        self.recorder.event(
            &ObjectReference::for_pod(&pod),
            EventType::Warning,
            events::FAILED_SCHEDULING,
            &err.to_string(),
        );
        let mut pod = pod;
        pod.status = condition::schedule_failed(&pod.status, err.to_string());
        self.write_status(&pod, pod.status.clone()).await;
        self.queue.add(pod).await;
    }

    async fn write_status(&self, pod: &Pod, status: kubelet::pod::PodStatus) {
        if let Err(e) = self.status.update_status(pod, status).await {
            error!(pod = %pod.full_name(), error = %e, "unable to update pod status");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::algorithm::RoundRobin;
    use crate::condition::{InMemoryStatusStore, POD_SCHEDULED, SCHEDULE_FAILED};
    use compute_client::client::ClientConfig;
    use compute_client::secrets::Credentials;
    use kubelet::events::FakeRecorder;
    use kubelet::pod::{Flavor, Nic, ObjectMeta, Phase, PodSpec, VirtualMachine};
    use std::time::Duration;

    struct Fixture {
        server: mockito::ServerGuard,
        scheduler: Arc<Scheduler>,
        statuses: Arc<InMemoryStatusStore>,
        recorder: Arc<FakeRecorder>,
        _tokens: (mockito::Mock, mockito::Mock),
    }

    async fn fixture() -> Fixture {
        let mut server = mockito::Server::new_async().await;
        let acquire = server
            .mock("POST", "/identity/v3/auth/tokens")
            .with_status(201)
            .with_header("X-Subject-Token", "tok")
            .create_async()
            .await;
        let probe = server
            .mock("HEAD", "/identity/v3/auth/tokens")
            .with_status(200)
            .create_async()
            .await;
        let config = SchedulerConfig {
            poll_interval: Duration::from_millis(5),
            max_build_polls: 3,
            ..SchedulerConfig::with_hosts(vec![server.host_with_port()])
        };
        let client = Client::new(ClientConfig::default(), Credentials::new("ops", "s3cret")).unwrap();
        let statuses = Arc::new(InMemoryStatusStore::default());
        let recorder = Arc::new(FakeRecorder::default());
        let scheduler = Scheduler::new(
            config.clone(),
            Arc::new(SchedulingQueue::default()),
            Arc::new(RoundRobin::new(config.hosts.clone())),
            Arc::new(client),
            statuses.clone(),
            recorder.clone(),
        );
        Fixture {
            server,
            scheduler,
            statuses,
            recorder,
            _tokens: (acquire, probe),
        }
    }

    fn vm_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: "vm-pod".to_owned(),
                uid: "u1".to_owned(),
                ..Default::default()
            },
            spec: PodSpec {
                virtual_machine: Some(VirtualMachine {
                    name: "vm-1".to_owned(),
                    image: "img-1".to_owned(),
                    flavors: vec![Flavor {
                        flavor_id: "42".to_owned(),
                    }],
                    security_groups: vec!["default".to_owned(), "extra".to_owned()],
                    ..Default::default()
                }),
                nics: vec![Nic {
                    name: "eth0".to_owned(),
                    uuid: "net-1".to_owned(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    // Pops the next pod and waits for its server task.
    async fn attempt(f: &Fixture) {
        let pod = f.scheduler.queue().pop().await.unwrap();
        if let Some(task) = f.scheduler.schedule_one(pod).await {
            task.await.unwrap();
        }
    }

    #[test]
    fn test_server_request() {
        let request = server_request(&vm_pod()).unwrap();
        assert_eq!(request.name, "vm-1");
        assert_eq!(request.image_ref, "img-1");
        assert_eq!(request.flavor_ref, "42");
        assert_eq!(request.networks, vec![Network { uuid: "net-1".to_owned() }]);
        assert_eq!(
            request.security_groups,
            vec![SecurityGroup {
                name: "default".to_owned()
            }]
        );
        assert!(matches!(
            server_request(&Pod::default()),
            Err(ScheduleError::NotVmPod(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_active_server_marks_pod_running() {
        let mut f = fixture().await;
        let _create = f
            .server
            .mock("POST", "/compute/v2.1/servers")
            .with_status(202)
            .with_body(r#"{"server": {"id": "srv-1"}}"#)
            .create_async()
            .await;
        let _status = f
            .server
            .mock("GET", "/compute/v2.1/servers/srv-1")
            .with_status(200)
            .with_body(r#"{"server": {"id": "srv-1", "status": "ACTIVE"}}"#)
            .create_async()
            .await;

        f.scheduler.queue().add(vm_pod()).await;
        attempt(&f).await;

        let status = f.statuses.get("u1").await.unwrap();
        assert_eq!(status.phase, Phase::Running);
        assert_eq!(status.condition(POD_SCHEDULED).unwrap().status, "True");
        assert_eq!(f.scheduler.retries("u1").await, 0);
        assert!(f.scheduler.queue().is_empty().await);
        assert_eq!(f.recorder.reasons(), vec![events::SCHEDULED]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_capacity_exceeded_reschedules_until_limit() {
        let mut f = fixture().await;
        let create = f
            .server
            .mock("POST", "/compute/v2.1/servers")
            .with_status(403)
            .expect(3)
            .create_async()
            .await;

        f.scheduler.queue().add(vm_pod()).await;
        for expected in 1..=3 {
            attempt(&f).await;
            assert_eq!(f.scheduler.retries("u1").await, expected);
            let status = f.statuses.get("u1").await.unwrap();
            assert_eq!(status.phase, Phase::Pending);
            assert_eq!(
                status.condition(POD_SCHEDULED).unwrap().reason.as_deref(),
                Some(SCHEDULE_FAILED)
            );
        }

        // The pod is back on the queue once more, and now fails.
        attempt(&f).await;
        assert_eq!(f.statuses.get("u1").await.unwrap().phase, Phase::Failed);
        assert!(f.scheduler.queue().is_empty().await);
        create.assert_async().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_error_server_is_deleted_and_rescheduled() {
        let mut f = fixture().await;
        let _create = f
            .server
            .mock("POST", "/compute/v2.1/servers")
            .with_status(202)
            .with_body(r#"{"server": {"id": "srv-1"}}"#)
            .create_async()
            .await;
        let _status = f
            .server
            .mock("GET", "/compute/v2.1/servers/srv-1")
            .with_status(200)
            .with_body(r#"{"server": {"id": "srv-1", "status": "ERROR"}}"#)
            .create_async()
            .await;
        let delete = f
            .server
            .mock("DELETE", "/compute/v2.1/servers/srv-1")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        f.scheduler.queue().add(vm_pod()).await;
        attempt(&f).await;

        delete.assert_async().await;
        assert_eq!(f.scheduler.retries("u1").await, 1);
        assert_eq!(f.scheduler.queue().len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_build_timeout_deletes_server() {
        let mut f = fixture().await;
        let _create = f
            .server
            .mock("POST", "/compute/v2.1/servers")
            .with_status(202)
            .with_body(r#"{"server": {"id": "srv-1"}}"#)
            .create_async()
            .await;
        let polls = f
            .server
            .mock("GET", "/compute/v2.1/servers/srv-1")
            .with_status(200)
            .with_body(r#"{"server": {"id": "srv-1", "status": "BUILD"}}"#)
            .expect(3)
            .create_async()
            .await;
        let delete = f
            .server
            .mock("DELETE", "/compute/v2.1/servers/srv-1")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        f.scheduler.queue().add(vm_pod()).await;
        attempt(&f).await;

        polls.assert_async().await;
        delete.assert_async().await;
        assert_eq!(f.scheduler.retries("u1").await, 1);
        let events = f.recorder.events();
        assert!(events[0].message.contains("still building after 3 polls"));
    }

    #[tokio::test]
    async fn test_deleting_pod_is_skipped() {
        let f = fixture().await;
        let mut pod = vm_pod();
        pod.metadata.deletion_timestamp = Some(chrono::Utc::now());
        assert!(f.scheduler.schedule_one(pod).await.is_none());
        assert_eq!(f.recorder.reasons(), vec![events::FAILED_SCHEDULING]);
        assert!(f.statuses.get("u1").await.is_none());
        assert_eq!(f.scheduler.retries("u1").await, 0);
    }
}
