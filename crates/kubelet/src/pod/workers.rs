use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::Pod;

/// What happened to a pod.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateType {
    /// The pod was seen for the first time.
    Create,
    /// The pod spec changed.
    Update,
    /// Periodic resync.
    Sync,
    /// The pod must be torn down.
    Kill,
}

/// A pod together with the reason it is being synced.
#[derive(Clone, Debug)]
pub struct PodUpdate {
    /// The desired pod.
    pub pod: Pod,
    /// Why it is synced.
    pub update_type: UpdateType,
}

/// Runs one sync tick for a pod.
#[async_trait::async_trait]
pub trait PodSyncer: Send + Sync + 'static {
    /// Reconciles the runtime with the desired pod.
    async fn sync_pod(&self, update: PodUpdate) -> anyhow::Result<()>;
}

/// A per-pod dispatcher that takes incoming pod updates and hands them to a single task per pod
/// uid, so at most one sync tick per pod runs at any time.
///
/// Each task only handles the latest update. If an update arrives while a sync is still running
/// and another one after it, only the second is handled, which is ok given that each update
/// carries the whole pod.
pub struct PodWorkers<S> {
    syncer: Arc<S>,
    handlers: HashMap<String, watch::Sender<PodUpdate>>,
}

impl<S: PodSyncer> PodWorkers<S> {
    /// Creates a dispatcher syncing through the given syncer.
    pub fn new(syncer: Arc<S>) -> Self {
        PodWorkers {
            syncer,
            handlers: HashMap::new(),
        }
    }

    fn run_pod(&self, initial: PodUpdate) -> watch::Sender<PodUpdate> {
        let (sender, mut receiver) = watch::channel(initial);
        let syncer = Arc::clone(&self.syncer);
        tokio::spawn(async move {
            loop {
                let update = receiver.borrow_and_update().clone();
                let pod_name = update.pod.full_name();
                let kill = update.update_type == UpdateType::Kill;
                match syncer.sync_pod(update).await {
                    Ok(()) => debug!(pod = %pod_name, "pod sync finished"),
                    Err(e) => error!(pod = %pod_name, error = %e, "pod sync failed"),
                }
                if kill {
                    info!(pod = %pod_name, "pod worker exiting after kill");
                    break;
                }
                // The sender is dropped when the pod is forgotten.
                if receiver.changed().await.is_err() {
                    break;
                }
            }
        });
        sender
    }

    /// Hands the update to the pod's worker, starting one if needed. A kill update is the last
    /// one a worker handles; the pod is forgotten afterwards.
    pub fn update_pod(&mut self, update: PodUpdate) {
        let uid = update.pod.pod_uid().to_owned();
        let kill = update.update_type == UpdateType::Kill;
        let unsent = match self.handlers.get(&uid) {
            Some(sender) => match sender.send(update) {
                Ok(_) => {
                    debug!(pod_uid = %uid, "sent update to pod worker");
                    None
                }
                Err(e) => {
                    // The worker already exited; start a fresh one with this update.
                    error!(pod_uid = %uid, "pod worker gone, restarting it");
                    Some(e.0)
                }
            },
            None => Some(update),
        };
        if let Some(update) = unsent {
            let sender = self.run_pod(update);
            self.handlers.insert(uid.clone(), sender);
        }
        if kill {
            self.handlers.remove(&uid);
        }
    }

    /// Stops the worker of a pod once it finishes its current update.
    pub fn forget_pod(&mut self, uid: &str) {
        self.handlers.remove(uid);
    }

    /// Number of pods with a live worker.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no pod has a live worker.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
