//! Pods read from manifest files.
//!
//! A manifest directory holds one pod per file, as JSON (`.json`) or YAML (`.yaml`, `.yml`).
//! Other files are ignored. Pods are returned in file name order.

use std::path::{Path, PathBuf};

use anyhow::Context;
use kubelet::Pod;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

fn format_of(path: &Path) -> Option<Format> {
    match path.extension()?.to_str()? {
        "json" => Some(Format::Json),
        "yaml" | "yml" => Some(Format::Yaml),
        _ => None,
    }
}

/// Parses one manifest. A pod without uid gets its full name as uid.
pub fn parse_pod(raw: &[u8], path: &Path) -> anyhow::Result<Pod> {
    let format = format_of(path)
        .with_context(|| format!("{} is neither JSON nor YAML", path.display()))?;
    let mut pod: Pod = match format {
        Format::Json => serde_json::from_slice(raw)
            .with_context(|| format!("invalid JSON pod manifest {}", path.display()))?,
        Format::Yaml => serde_yaml::from_slice(raw)
            .with_context(|| format!("invalid YAML pod manifest {}", path.display()))?,
    };
    if pod.metadata.name.is_empty() {
        anyhow::bail!("pod manifest {} has no name", path.display());
    }
    if pod.metadata.uid.is_empty() {
        pod.metadata.uid = pod.full_name();
    }
    Ok(pod)
}

/// Reads every pod manifest in a directory.
pub async fn load_pods(dir: impl AsRef<Path>) -> anyhow::Result<Vec<Pod>> {
    let dir = dir.as_ref();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("unable to read manifest directory {}", dir.display()))?;
    let mut paths: Vec<PathBuf> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if format_of(&path).is_some() && entry.file_type().await?.is_file() {
            paths.push(path);
        } else {
            debug!(path = %path.display(), "skipping non manifest file");
        }
    }
    paths.sort();

    let mut pods = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("unable to read {}", path.display()))?;
        let pod = parse_pod(&raw, &path)?;
        debug!(pod = %pod.full_name(), path = %path.display(), "loaded pod manifest");
        pods.push(pod);
    }
    info!(count = pods.len(), dir = %dir.display(), "loaded pod manifests");
    Ok(pods)
}
