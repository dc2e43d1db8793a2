//! Error categories shared by every component boundary in the kubelet.

/// The category of a failure, used by callers to decide whether to retry, surface or abort.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A lookup found nothing, including binding cache misses after an exhaustive search.
    NotFound,
    /// A required entry (such as the primary runtime) was never configured.
    NotDefined,
    /// Configuration could not be parsed.
    Format,
    /// A probe or call failed in a way that the next sync tick may resolve.
    Transient,
    /// The remote cloud refused to create another instance.
    CapacityExceeded,
    /// An image pull is being held back.
    ImagePullBackOff,
    /// An operation did not finish within its bound.
    Timeout,
    /// The sync tick cannot make progress.
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "NotFound",
            Self::NotDefined => "NotDefined",
            Self::Format => "FormatError",
            Self::Transient => "Transient",
            Self::CapacityExceeded => "CapacityExceeded",
            Self::ImagePullBackOff => "ImagePullBackOff",
            Self::Timeout => "Timeout",
            Self::Fatal => "Fatal",
        };
        s.fmt(f)
    }
}
