//! Makes sure the image of a container is present before it is created, honoring the pull
//! policy and backing off images that keep failing to pull.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::container::{Container, PullPolicy};
use crate::error::ErrorKind;
use crate::events::{self, EventRecorder, EventType, ObjectReference};
use crate::pod::Pod;
use crate::runtime::types::{ImageSpec, PodSandboxConfig};
use crate::runtime::ImageService;

/// Describes the ways making an image present can fail.
#[derive(Error, Debug)]
pub enum ImageError {
    /// The image failed recently and is held back.
    #[error("Back-off pulling image {0:?}")]
    BackOff(String),
    /// The pull itself failed.
    #[error("failed to pull image {image:?}: {message}")]
    PullFailed {
        /// Image reference.
        image: String,
        /// Pull failure.
        message: String,
    },
    /// The image is missing and the pull policy forbids pulling it.
    #[error("container image {0:?} is not present with pull policy of Never")]
    NeverPull(String),
    /// The pull policy or image status could not be read.
    #[error("failed to inspect image {image:?}: {message}")]
    Inspect {
        /// Image reference.
        image: String,
        /// Failure.
        message: String,
    },
}

impl ImageError {
    /// The category of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImageError::BackOff(_) => ErrorKind::ImagePullBackOff,
            ImageError::PullFailed { .. } | ImageError::Inspect { .. } => ErrorKind::Transient,
            ImageError::NeverPull(_) => ErrorKind::Fatal,
        }
    }
}

/// Pulls images on demand, one back-off window per pod and image.
pub struct ImageManager {
    backoff: Backoff,
    recorder: Arc<dyn EventRecorder>,
}

impl ImageManager {
    /// Creates a manager.
    pub fn new(backoff: Backoff, recorder: Arc<dyn EventRecorder>) -> Self {
        ImageManager { backoff, recorder }
    }

    /// Returns the reference of the container image, pulling it first if the pull policy asks
    /// for it.
    pub async fn ensure_image_exists(
        &self,
        image_service: &dyn ImageService,
        pod: &Pod,
        container: &Container,
        sandbox_config: Option<&PodSandboxConfig>,
    ) -> Result<String, ImageError> {
        let object = ObjectReference::for_container(pod, &container.name);
        let image = container.image.clone();
        let spec = ImageSpec {
            image: image.clone(),
        };
        let policy = container
            .effective_pull_policy()
            .map_err(|e| ImageError::Inspect {
                image: image.clone(),
                message: e.to_string(),
            })?;
        let present = image_service
            .image_status(&spec)
            .await
            .map_err(|e| ImageError::Inspect {
                image: image.clone(),
                message: e.to_string(),
            })?;

        let should_pull = match (policy, &present) {
            (PullPolicy::Always, _) => true,
            (PullPolicy::IfNotPresent, None) => true,
            _ => false,
        };
        if !should_pull {
            if let Some(found) = present {
                debug!(image = %image, "image already present");
                return Ok(if found.id.is_empty() { image } else { found.id });
            }
            let err = ImageError::NeverPull(image);
            self.recorder.event(
                &object,
                EventType::Warning,
                events::ERR_IMAGE_NEVER_PULL,
                &err.to_string(),
            );
            return Err(err);
        }

        let key = format!("{}_{}", pod.pod_uid(), image);
        if self.backoff.is_in_back_off_since_update(&key, Utc::now()).await {
            let err = ImageError::BackOff(image);
            info!(pod = %pod.full_name(), error = %err, "image pull is backing off");
            self.recorder
                .event(&object, EventType::Normal, events::BACK_OFF, &err.to_string());
            return Err(err);
        }

        self.recorder.event(
            &object,
            EventType::Normal,
            events::PULLING,
            &format!("Pulling image {:?}", image),
        );
        match image_service.pull_image(&spec, sandbox_config).await {
            Ok(image_ref) => {
                self.recorder.event(
                    &object,
                    EventType::Normal,
                    events::PULLED,
                    &format!("Successfully pulled image {:?}", image),
                );
                self.backoff.gc().await;
                Ok(image_ref)
            }
            Err(e) => {
                warn!(pod = %pod.full_name(), image = %image, error = %e, "image pull failed");
                self.recorder.event(
                    &object,
                    EventType::Warning,
                    events::FAILED,
                    &format!("Failed to pull image {:?}: {}", image, e),
                );
                self.backoff.next(&key, Utc::now()).await;
                Err(ImageError::PullFailed {
                    image,
                    message: e.to_string(),
                })
            }
        }
    }
}
