//! A crate for building a multi-runtime Arktos
//! [kubelet](https://kubernetes.io/docs/reference/command-line-tools-reference/kubelet/).
//!
//! The crate provides the [`RuntimeRegistry`](runtime::RuntimeRegistry) that maps workload
//! types to runtime and image services, the [`RuntimeManager`](kuberuntime::RuntimeManager)
//! that plans and executes pod syncs against those services, and the [`Kubelet`] that funnels
//! pod updates through per-pod workers.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use kubelet::config::Config;
//! use kubelet::kuberuntime::RuntimeManager;
//! use kubelet::runtime::{fake::FakeConnector, RuntimeRegistry};
//! use kubelet::Kubelet;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default_config()?;
//!     let registry = RuntimeRegistry::new(
//!         &config.runtime_endpoints,
//!         &config.image_endpoints,
//!         &FakeConnector::default(),
//!         config.runtime_request_timeout,
//!     )?;
//!     let manager = RuntimeManager::builder(Arc::new(registry), &config).build();
//!     let kubelet = Kubelet::new(config, Arc::new(manager));
//!     kubelet.start().await
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(feature = "docs", feature(doc_cfg))]

pub mod backoff;
pub mod cm;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod images;
mod kubelet;
pub mod kuberuntime;
pub mod logs;
pub mod pod;
pub mod prober;
pub mod resources;
pub mod revision;
pub mod runtime;

pub use self::kubelet::Kubelet;

#[doc(inline)]
pub use pod::Pod;
