//! Errors related to interacting with a compute-API compatible cloud

use kubelet::error::ErrorKind;
use thiserror::Error;

/// Describes the ways a call to the cloud can fail.
#[derive(Error, Debug)]
pub enum ComputeError {
    /// The cloud refused to create a server (HTTP 403).
    #[error("instance capacity has reached its limit")]
    CapacityExceeded,
    /// The cloud answered with a status the operation does not expect.
    #[error("{operation} returned unexpected status {status}: {body}")]
    UnexpectedStatus {
        /// The operation that was attempted.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },
    /// The identity service issued no token.
    #[error("token response carries no X-Subject-Token header")]
    MissingSubjectToken,
    /// The request did not finish within the client's timeout.
    #[error("{operation} timed out")]
    Timeout {
        /// The operation that was attempted.
        operation: &'static str,
    },
    /// The request could not be sent or its response not read.
    #[error("{operation} failed: {source}")]
    Transport {
        /// The operation that was attempted.
        operation: &'static str,
        /// The underlying HTTP error.
        source: reqwest::Error,
    },
    /// The response body is not what the operation expects.
    #[error("unable to decode {operation} response: {source}")]
    Decode {
        /// The operation that was attempted.
        operation: &'static str,
        /// The underlying decode error.
        source: serde_json::Error,
    },
}

impl ComputeError {
    /// The category callers use to decide between retrying and giving up.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ComputeError::CapacityExceeded => ErrorKind::CapacityExceeded,
            ComputeError::Timeout { .. } => ErrorKind::Timeout,
            ComputeError::Transport { .. } | ComputeError::UnexpectedStatus { .. } => {
                ErrorKind::Transient
            }
            ComputeError::Decode { .. } => ErrorKind::Format,
            ComputeError::MissingSubjectToken => ErrorKind::Fatal,
        }
    }

    pub(crate) fn transport(operation: &'static str) -> impl FnOnce(reqwest::Error) -> Self {
        move |source| {
            if source.is_timeout() {
                ComputeError::Timeout { operation }
            } else {
                ComputeError::Transport { operation, source }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            ComputeError::CapacityExceeded.kind(),
            ErrorKind::CapacityExceeded
        );
        assert_eq!(
            ComputeError::Timeout { operation: "create server" }.kind(),
            ErrorKind::Timeout
        );
        let unexpected = ComputeError::UnexpectedStatus {
            operation: "delete server",
            status: 500,
            body: "boom".to_owned(),
        };
        assert_eq!(unexpected.kind(), ErrorKind::Transient);
        assert_eq!(
            unexpected.to_string(),
            "delete server returned unexpected status 500: boom"
        );
    }
}
