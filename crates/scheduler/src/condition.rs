//! Writing the scheduling outcome back onto pods.

use std::collections::HashMap;

use chrono::Utc;
use kubelet::pod::{Phase, PodCondition, PodStatus};
use kubelet::Pod;
use tokio::sync::RwLock;
use tracing::info;

/// Condition type telling whether a pod has been scheduled.
pub const POD_SCHEDULED: &str = "PodScheduled";
/// Reason set on the scheduled condition when an attempt failed.
pub const SCHEDULE_FAILED: &str = "ScheduleFailed";

/// Persists the status the scheduler computed for a pod.
#[async_trait::async_trait]
pub trait PodStatusUpdater: Send + Sync {
    /// Stores the new status of the pod.
    async fn update_status(&self, pod: &Pod, status: PodStatus) -> anyhow::Result<()>;
}

/// Keeps the latest status per pod uid in memory.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    statuses: RwLock<HashMap<String, PodStatus>>,
}

impl InMemoryStatusStore {
    /// The latest status of a pod.
    pub async fn get(&self, uid: &str) -> Option<PodStatus> {
        self.statuses.read().await.get(uid).cloned()
    }
}

#[async_trait::async_trait]
impl PodStatusUpdater for InMemoryStatusStore {
    async fn update_status(&self, pod: &Pod, status: PodStatus) -> anyhow::Result<()> {
        info!(
            pod = %pod.full_name(),
            phase = ?status.phase,
            reason = ?status.reason,
            "pod status updated"
        );
        self.statuses
            .write()
            .await
            .insert(pod.pod_uid().to_owned(), status);
        Ok(())
    }
}

fn scheduled_condition(status: &str, reason: Option<&str>, message: Option<String>) -> PodCondition {
    PodCondition {
        type_: POD_SCHEDULED.to_owned(),
        status: status.to_owned(),
        reason: reason.map(str::to_owned),
        message,
        last_transition_time: Some(Utc::now()),
    }
}

/// The status of a pod whose server is active on the host.
pub fn running(status: &PodStatus, host: &str) -> PodStatus {
    let mut status = status.clone();
    status.phase = Phase::Running;
    status.reason = None;
    status.message = None;
    status.set_condition(scheduled_condition(
        "True",
        None,
        Some(format!("running on {}", host)),
    ));
    status
}

/// The status of a pod that will be scheduled again after a failed attempt.
pub fn schedule_failed(status: &PodStatus, message: String) -> PodStatus {
    let mut status = status.clone();
    status.phase = Phase::Pending;
    status.set_condition(scheduled_condition("False", Some(SCHEDULE_FAILED), Some(message)));
    status
}

/// The status of a pod that used up its attempts.
pub fn failed(status: &PodStatus, message: String) -> PodStatus {
    let mut status = status.clone();
    status.phase = Phase::Failed;
    status.reason = Some(SCHEDULE_FAILED.to_owned());
    status.message = Some(message.clone());
    status.set_condition(scheduled_condition("False", Some(SCHEDULE_FAILED), Some(message)));
    status
}
