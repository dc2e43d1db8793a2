use compute_client::ComputeError;
use kubelet::error::ErrorKind;
use thiserror::Error;

/// Describes the ways scheduling a pod can fail.
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// The algorithm found no host for the pod.
    #[error("no host available for pod {0}")]
    NoHostAvailable(String),
    /// The pod is being deleted.
    #[error("skip schedule deleting pod {0}")]
    PodBeingDeleted(String),
    /// The pod was rescheduled too often.
    #[error("pod {pod} failed to schedule {attempts} times")]
    RetryLimitReached {
        /// Pod full name.
        pod: String,
        /// Attempts made.
        attempts: u32,
    },
    /// The pod declares no virtual machine.
    #[error("pod {0} declares no virtual machine")]
    NotVmPod(String),
    /// The server stayed in BUILD for every poll.
    #[error("server {server} still building after {polls} polls")]
    BuildTimeout {
        /// Server id.
        server: String,
        /// Polls made.
        polls: u32,
    },
    /// The server went into ERROR.
    #[error("server {0} is in error state")]
    InstanceError(String),
    /// A call to the cloud failed.
    #[error(transparent)]
    Compute(#[from] ComputeError),
}

impl ScheduleError {
    /// The category of the failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScheduleError::NoHostAvailable(_) => ErrorKind::NotFound,
            ScheduleError::PodBeingDeleted(_) | ScheduleError::NotVmPod(_) => ErrorKind::Fatal,
            ScheduleError::RetryLimitReached { .. } => ErrorKind::Fatal,
            ScheduleError::BuildTimeout { .. } => ErrorKind::Timeout,
            ScheduleError::InstanceError(_) => ErrorKind::Transient,
            ScheduleError::Compute(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_compute_errors_keep_their_kind() {
        let e = ScheduleError::from(ComputeError::CapacityExceeded);
        assert_eq!(e.kind(), ErrorKind::CapacityExceeded);
        assert_eq!(e.to_string(), "instance capacity has reached its limit");
        let e = ScheduleError::BuildTimeout {
            server: "srv-1".to_owned(),
            polls: 60,
        };
        assert_eq!(e.kind(), ErrorKind::Timeout);
    }
}
