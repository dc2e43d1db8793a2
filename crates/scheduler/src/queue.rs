//! The FIFO of pods waiting to be scheduled.

use std::collections::VecDeque;

use kubelet::Pod;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// Pods waiting to be scheduled, in arrival order. Popping waits for a pod until the queue is
/// closed.
#[derive(Debug, Default)]
pub struct SchedulingQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct QueueState {
    pods: VecDeque<Pod>,
    closed: bool,
}

impl SchedulingQueue {
    /// Appends a pod.
    pub async fn add(&self, pod: Pod) {
        debug!(pod = %pod.full_name(), "adding pod to scheduling queue");
        self.state.lock().await.pods.push_back(pod);
        self.notify.notify_one();
    }

    /// Takes the oldest pod, waiting for one if the queue is empty. `None` once the queue is
    /// closed and drained.
    pub async fn pop(&self) -> Option<Pod> {
        loop {
            // Registered before the check so a close in between is not missed.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(pod) = state.pods.pop_front() {
                    return Some(pod);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stops the queue. Pods already queued are still handed out.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Number of queued pods.
    pub async fn len(&self) -> usize {
        self.state.lock().await.pods.len()
    }

    /// Whether no pod is queued.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
