//! The kubelet loop. Pod updates are handed to one worker per pod, each worker syncs its pod
//! through the [`RuntimeManager`], and a periodic housekeeping tick resyncs every known pod
//! and reaps pods the runtimes still run but nobody asked for.
use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};
use crate::config::Config;
use crate::container::{PodStatus, RunningPod};
use crate::kuberuntime::{generate_api_pod_status, RuntimeManager};
use crate::pod::{convert_vm_pod_to_container_pod, Pod, PodSyncer, PodUpdate, PodWorkers, UpdateType};

use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal::ctrl_c;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Interval;
use tracing::{debug, info, warn};

/// A Kubelet driving pods on the runtimes of a [`RuntimeManager`].
///
/// Every pod the Kubelet knows about has a worker that runs at most one sync at a time. The
/// Kubelet keeps the latest desired spec of each pod together with the API status generated
/// by its last sync.
pub struct Kubelet {
    config: Config,
    handler: Arc<PodSyncHandler>,
    workers: Mutex<PodWorkers<PodSyncHandler>>,
}

impl Kubelet {
    /// Create a new Kubelet syncing pods through the given runtime manager.
    pub fn new(config: Config, manager: Arc<RuntimeManager>) -> Self {
        let handler = Arc::new(PodSyncHandler {
            manager,
            pods: RwLock::new(HashMap::new()),
        });
        Self {
            config,
            workers: Mutex::new(PodWorkers::new(Arc::clone(&handler))),
            handler,
        }
    }

    /// The runtime manager pods are synced through.
    pub fn runtime_manager(&self) -> &Arc<RuntimeManager> {
        &self.handler.manager
    }

    /// Hands a pod update to the pod's worker. A pod without status keeps the status generated
    /// by its previous sync.
    pub async fn update_pod(&self, mut pod: Pod, update_type: UpdateType) {
        if update_type != UpdateType::Kill {
            let mut pods = self.handler.pods.write().await;
            if let Some(known) = pods.get(pod.pod_uid()) {
                if pod.status == Default::default() {
                    pod.status = known.status.clone();
                }
            }
            pods.insert(pod.pod_uid().to_owned(), pod.clone());
        }
        debug!(pod = %pod.full_name(), ?update_type, "dispatching pod update");
        self.workers
            .lock()
            .await
            .update_pod(PodUpdate { pod, update_type });
    }

    /// The pod with the given uid, as last synced.
    pub async fn pod(&self, uid: &str) -> Option<Pod> {
        self.handler.pods.read().await.get(uid).cloned()
    }

    /// Every pod the Kubelet knows about.
    pub async fn pods(&self) -> Vec<Pod> {
        self.handler.pods.read().await.values().cloned().collect()
    }

    /// Begin syncing pods.
    ///
    /// Runs housekeeping every sync period until interrupted. While the primary runtime is not
    /// ready housekeeping backs off instead.
    pub async fn start(&self) -> anyhow::Result<()> {
        info!(node = %self.config.node_name, "starting kubelet");
        let mut interval = tokio::time::interval(self.config.sync_frequency);
        let mut backoff = ExponentialBackoffStrategy::default();
        let shutdown = ctrl_c();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                res = &mut shutdown => {
                    res?;
                    warn!("Caught keyboard interrupt.");
                    break;
                }
                _ = self.housekeeping(&mut interval, &mut backoff) => (),
            }
        }
        Ok(())
    }

    async fn housekeeping(
        &self,
        interval: &mut Interval,
        backoff: &mut ExponentialBackoffStrategy,
    ) {
        interval.tick().await;
        if !self.handler.manager.primary_runtime_ready().await {
            warn!("primary runtime is not ready, skipping pod sync");
            backoff.wait().await;
            return;
        }
        backoff.reset();

        for pod in self.pods().await {
            self.update_pod(pod, UpdateType::Sync).await;
        }
        self.cleanup_orphaned_pods().await;
    }

    /// Kills pods the runtimes run that the Kubelet does not know about.
    pub async fn cleanup_orphaned_pods(&self) {
        let known: Vec<String> = self.handler.pods.read().await.keys().cloned().collect();
        for running in self.handler.manager.get_pods(false).await {
            if known.contains(&running.id) {
                continue;
            }
            info!(pod_uid = %running.id, pod = %running.name, "killing orphaned pod");
            let result = self.handler.manager.kill_pod(None, &running, None).await;
            match result.error() {
                Ok(()) => self.handler.manager.bindings().remove(&running.id).await,
                Err(e) => warn!(pod_uid = %running.id, error = %e, "failed to kill orphaned pod"),
            }
        }
    }
}

struct PodSyncHandler {
    manager: Arc<RuntimeManager>,
    pods: RwLock<HashMap<String, Pod>>,
}

impl PodSyncHandler {
    async fn observed_status(&self, pod: &Pod) -> anyhow::Result<PodStatus> {
        self.manager
            .get_pod_status(pod.pod_uid(), pod.name(), pod.namespace(), pod.tenant())
            .await
            .with_context(|| format!("unable to read status of pod {}", pod.full_name()))
    }

    async fn kill(&self, pod: Pod) -> anyhow::Result<()> {
        let uid = pod.pod_uid().to_owned();
        let status = self.observed_status(&pod).await?;
        let runtime_name = self
            .manager
            .bindings()
            .get_runtime_service_by_pod_id(&uid)
            .await
            .map(|e| e.name)
            .unwrap_or_default();
        let running = RunningPod::from_pod_status(&runtime_name, &status);
        let result = self.manager.kill_pod(Some(&pod), &running, None).await;
        result
            .error()
            .with_context(|| format!("unable to kill pod {}", pod.full_name()))?;
        self.manager.bindings().remove(&uid).await;
        self.pods.write().await.remove(&uid);
        Ok(())
    }
}

#[async_trait::async_trait]
impl PodSyncer for PodSyncHandler {
    async fn sync_pod(&self, update: PodUpdate) -> anyhow::Result<()> {
        let PodUpdate { pod, update_type } = update;
        if update_type == UpdateType::Kill {
            return self.kill(pod).await;
        }

        let mut desired = if pod.spec.virtual_machine.is_some() {
            convert_vm_pod_to_container_pod(&pod)?
        } else {
            pod
        };
        // The stored status is newer than the one the update was queued with.
        if let Some(known) = self.pods.read().await.get(desired.pod_uid()) {
            desired.status = known.status.clone();
        }

        let status = self.observed_status(&desired).await?;
        let result = self.manager.sync_pod(&desired, &status).await;

        let observed = self.observed_status(&desired).await?;
        let api_status = generate_api_pod_status(&desired, &observed, &result);
        if let Some(known) = self.pods.write().await.get_mut(desired.pod_uid()) {
            known.status = api_status;
        }
        result.error()?;
        Ok(())
    }
}
