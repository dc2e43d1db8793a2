//! Layout of the pod log directories under the log root.
//!
//! A pod logs into `<root>/<tenant>_<namespace>_<name>_<uid>` and each container into
//! `<containerName>/<restartCount>.log` below it. Older nodes used a bare `<uid>` directory,
//! which is still recognized when parsing.

use std::path::{Path, PathBuf};

const LOG_PATH_DELIMITER: char = '_';

/// Identity recovered from a pod log directory name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodLogDirectory {
    /// The `<tenant>_<namespace>_<name>_<uid>` layout.
    Current {
        /// Pod tenant.
        tenant: String,
        /// Pod namespace.
        namespace: String,
        /// Pod name.
        name: String,
        /// Pod uid.
        uid: String,
    },
    /// The bare `<uid>` layout.
    Legacy {
        /// Pod uid.
        uid: String,
    },
}

impl PodLogDirectory {
    /// The pod uid, present in both layouts.
    pub fn uid(&self) -> &str {
        match self {
            PodLogDirectory::Current { uid, .. } | PodLogDirectory::Legacy { uid } => uid,
        }
    }
}

/// The log directory of a pod.
pub fn build_pod_logs_directory(
    root: &Path,
    tenant: &str,
    namespace: &str,
    name: &str,
    uid: &str,
) -> PathBuf {
    root.join(
        [tenant, namespace, name, uid].join(&LOG_PATH_DELIMITER.to_string()),
    )
}

/// The log path of a container instance, relative to its pod log directory.
pub fn build_container_log_path(container_name: &str, restart_count: i32) -> PathBuf {
    Path::new(container_name).join(format!("{}.log", restart_count))
}

/// Recovers the pod identity from the final component of a pod log directory.
pub fn parse_pod_log_directory(dir: &Path) -> anyhow::Result<PodLogDirectory> {
    let base = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("invalid pod log directory {:?}", dir))?;
    let parts: Vec<&str> = base.split(LOG_PATH_DELIMITER).collect();
    match parts.as_slice() {
        [uid] if !uid.is_empty() => Ok(PodLogDirectory::Legacy {
            uid: (*uid).to_owned(),
        }),
        [tenant, namespace, name, uid] => Ok(PodLogDirectory::Current {
            tenant: (*tenant).to_owned(),
            namespace: (*namespace).to_owned(),
            name: (*name).to_owned(),
            uid: (*uid).to_owned(),
        }),
        _ => Err(anyhow::anyhow!(
            "pod log directory {:?} is neither <uid> nor <tenant>_<namespace>_<name>_<uid>",
            base
        )),
    }
}
