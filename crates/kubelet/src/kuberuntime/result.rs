//! Per-step outcomes of a pod sync.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::images::ImageError;
use crate::resources::ResourceRequirements;

/// The step a [`SyncResult`] reports on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncAction {
    /// Starting a container.
    StartContainer,
    /// Killing a container.
    KillContainer,
    /// Creating the pod sandbox.
    CreatePodSandbox,
    /// Generating the sandbox config.
    ConfigPodSandbox,
    /// Stopping the pod sandboxes.
    KillPodSandbox,
    /// Resizing a container in place.
    UpdateContainerResources,
    /// Writing the pod cgroup envelope.
    UpdatePodCgroup,
    /// Hot plugging a NIC.
    AttachNic,
    /// Hot unplugging a NIC.
    DetachNic,
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncAction::StartContainer => "StartContainer",
            SyncAction::KillContainer => "KillContainer",
            SyncAction::CreatePodSandbox => "CreatePodSandbox",
            SyncAction::ConfigPodSandbox => "ConfigPodSandbox",
            SyncAction::KillPodSandbox => "KillPodSandbox",
            SyncAction::UpdateContainerResources => "UpdateContainerResources",
            SyncAction::UpdatePodCgroup => "UpdatePodCgroup",
            SyncAction::AttachNic => "AttachNic",
            SyncAction::DetachNic => "DetachNic",
        };
        s.fmt(f)
    }
}

/// Describes the ways a sync step can fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No runtime service can serve the pod.
    #[error("runtime service unavailable: {0}")]
    RuntimeUnavailable(String),
    /// Tearing the pod down failed.
    #[error("KillPodError: {0}")]
    KillPodFailed(String),
    /// The sandbox could not be created or inspected.
    #[error("CreatePodSandboxError: {0}")]
    CreateSandboxFailed(String),
    /// The sandbox config could not be generated.
    #[error("ConfigPodSandboxError: {0}")]
    ConfigPodSandboxFailed(String),
    /// A container could not be created or started.
    #[error("RunContainerError: {0}")]
    StartContainerFailed(String),
    /// A container could not be stopped.
    #[error("KillContainerError: {0}")]
    KillContainerFailed(String),
    /// An in-place resize step failed.
    #[error("UpdateContainerError: {0}")]
    UpdateContainerFailed(String),
    /// The image pull is held back.
    #[error("ImagePullBackOff: {0}")]
    ImagePullBackOff(String),
    /// The image pull failed.
    #[error("ErrImagePull: {0}")]
    ImagePullFailed(String),
    /// The image is missing and may not be pulled.
    #[error("ErrImageNeverPull: {0}")]
    ImageNeverPull(String),
    /// The container keeps failing and its restart is held back.
    #[error("CrashLoopBackOff: {0}")]
    CrashLoopBackOff(String),
    /// A sandbox could not be stopped.
    #[error("KillPodSandboxError: {0}")]
    KillPodSandboxFailed(String),
    /// A NIC could not be attached or detached.
    #[error("HotplugError: {0}")]
    HotplugFailed(String),
}

impl SyncError {
    /// The category of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::RuntimeUnavailable(_) => ErrorKind::NotFound,
            SyncError::ImagePullBackOff(_) => ErrorKind::ImagePullBackOff,
            SyncError::CrashLoopBackOff(_)
            | SyncError::ImagePullFailed(_)
            | SyncError::HotplugFailed(_)
            | SyncError::KillContainerFailed(_)
            | SyncError::KillPodSandboxFailed(_)
            | SyncError::UpdateContainerFailed(_) => ErrorKind::Transient,
            SyncError::KillPodFailed(_)
            | SyncError::CreateSandboxFailed(_)
            | SyncError::ConfigPodSandboxFailed(_)
            | SyncError::StartContainerFailed(_)
            | SyncError::ImageNeverPull(_) => ErrorKind::Fatal,
        }
    }

    /// The short reason shown as a container waiting reason.
    pub fn reason(&self) -> &'static str {
        match self {
            SyncError::RuntimeUnavailable(_) => "RuntimeUnavailable",
            SyncError::KillPodFailed(_) => "KillPodError",
            SyncError::CreateSandboxFailed(_) => "CreatePodSandboxError",
            SyncError::ConfigPodSandboxFailed(_) => "ConfigPodSandboxError",
            SyncError::StartContainerFailed(_) => "RunContainerError",
            SyncError::KillContainerFailed(_) => "KillContainerError",
            SyncError::UpdateContainerFailed(_) => "UpdateContainerError",
            SyncError::ImagePullBackOff(_) => "ImagePullBackOff",
            SyncError::ImagePullFailed(_) => "ErrImagePull",
            SyncError::ImageNeverPull(_) => "ErrImageNeverPull",
            SyncError::CrashLoopBackOff(_) => "CrashLoopBackOff",
            SyncError::KillPodSandboxFailed(_) => "KillPodSandboxError",
            SyncError::HotplugFailed(_) => "HotplugError",
        }
    }
}

impl From<ImageError> for SyncError {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::BackOff(_) => SyncError::ImagePullBackOff(e.to_string()),
            ImageError::NeverPull(_) => SyncError::ImageNeverPull(e.to_string()),
            ImageError::PullFailed { .. } | ImageError::Inspect { .. } => {
                SyncError::ImagePullFailed(e.to_string())
            }
        }
    }
}

/// The outcome of one step against one target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncResult {
    /// The step.
    pub action: SyncAction,
    /// What the step acted on: a container name, a sandbox id or a NIC name.
    pub target: String,
    /// Set when the step failed.
    pub error: Option<SyncError>,
    /// Extra detail on a failure.
    pub message: String,
}

impl SyncResult {
    /// A successful result.
    pub fn new(action: SyncAction, target: impl Into<String>) -> Self {
        SyncResult {
            action,
            target: target.into(),
            error: None,
            message: String::new(),
        }
    }

    /// Marks the result as failed.
    pub fn fail(&mut self, error: SyncError, message: impl Into<String>) {
        self.error = Some(error);
        self.message = message.into();
    }
}

/// Every step outcome of one sync, plus the resources written by in-place resizes.
#[derive(Clone, Debug, Default)]
pub struct PodSyncResult {
    /// Per-step outcomes, in execution order.
    pub sync_results: Vec<SyncResult>,
    /// A failure not tied to a single step.
    pub sync_error: Option<SyncError>,
    /// Resources written to each resized container, by container name.
    pub resized_containers: BTreeMap<String, ResourceRequirements>,
}

/// Every failure of a sync, joined into one error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", .0.join("; "))]
pub struct SyncErrors(pub Vec<String>);

impl PodSyncResult {
    /// Appends a step outcome.
    pub fn add_sync_result(&mut self, result: SyncResult) {
        self.sync_results.push(result);
    }

    /// Folds another result into this one.
    pub fn add_pod_sync_result(&mut self, other: PodSyncResult) {
        self.sync_results.extend(other.sync_results);
        self.resized_containers.extend(other.resized_containers);
        if other.sync_error.is_some() {
            self.sync_error = other.sync_error;
        }
    }

    /// Records a failure not tied to a single step.
    pub fn fail(&mut self, error: SyncError) {
        self.sync_error = Some(error);
    }

    /// Whether any step, or the sync as a whole, failed.
    pub fn has_failures(&self) -> bool {
        self.sync_error.is_some() || self.sync_results.iter().any(|r| r.error.is_some())
    }

    /// The failed step outcomes.
    pub fn failures(&self) -> impl Iterator<Item = &SyncResult> {
        self.sync_results.iter().filter(|r| r.error.is_some())
    }

    /// Every failure, joined. `Ok` when nothing failed.
    pub fn error(&self) -> Result<(), SyncErrors> {
        let mut messages: Vec<String> = self
            .failures()
            .filter_map(|r| {
                r.error.as_ref().map(|e| {
                    format!(
                        "failed to {:?} for {:?} with {}: {:?}",
                        r.action.to_string(),
                        r.target,
                        e.reason(),
                        r.message
                    )
                })
            })
            .collect();
        if let Some(e) = &self.sync_error {
            messages.push(e.to_string());
        }
        if messages.is_empty() {
            Ok(())
        } else {
            Err(SyncErrors(messages))
        }
    }
}
