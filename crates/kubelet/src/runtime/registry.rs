use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::timeout::{TimeoutImageService, TimeoutRuntimeService};
use super::{ImageService, RegistryError, RuntimeService, WorkloadType};

/// The name given to an endpoint configured in the legacy bare URL form.
pub const DEFAULT_SERVICE_NAME: &str = "default";

/// One endpoint parsed out of the configuration string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointSpec {
    /// Service name.
    pub name: String,
    /// Workload type it serves.
    pub workload_type: WorkloadType,
    /// Endpoint URL.
    pub endpoint_url: String,
    /// First endpoint of its workload type.
    pub is_default: bool,
    /// First container endpoint; its readiness gates node readiness.
    pub is_primary: bool,
}

/// Parses `endpoint (";" endpoint)*` where each endpoint is either a bare URL or
/// `name,workloadType,url`.
///
/// The first endpoint of each workload type is its default and the first container endpoint is
/// the primary.
pub fn parse_endpoints(config: &str) -> Result<Vec<EndpointSpec>, RegistryError> {
    if config.trim().is_empty() {
        return Err(RegistryError::Empty);
    }
    let mut specs: Vec<EndpointSpec> = Vec::new();
    let mut defaulted = HashSet::new();
    let mut has_primary = false;
    for endpoint in config.split(';') {
        let parts: Vec<&str> = endpoint.split(',').map(str::trim).collect();
        let (name, workload_type, url) = match parts.as_slice() {
            [url] => (DEFAULT_SERVICE_NAME, WorkloadType::Container, *url),
            [name, workload, url] => (*name, workload.parse()?, *url),
            _ => {
                return Err(RegistryError::Format(format!(
                    "endpoint {:?} has {} elements, expected 1 or 3",
                    endpoint,
                    parts.len()
                )))
            }
        };
        if name.is_empty() || url.is_empty() {
            return Err(RegistryError::Format(format!(
                "endpoint {:?} has an empty name or url",
                endpoint
            )));
        }
        if specs.iter().any(|s| s.name == name) {
            return Err(RegistryError::Format(format!(
                "duplicate endpoint name {:?}",
                name
            )));
        }
        let is_default = defaulted.insert(workload_type);
        let is_primary = !has_primary && workload_type == WorkloadType::Container;
        has_primary |= is_primary;
        specs.push(EndpointSpec {
            name: name.to_owned(),
            workload_type,
            endpoint_url: url.to_owned(),
            is_default,
            is_primary,
        });
    }
    Ok(specs)
}

/// Creates service handles for configured endpoints.
pub trait Connector: Send + Sync {
    /// Connects to a runtime endpoint.
    fn connect_runtime(&self, spec: &EndpointSpec) -> anyhow::Result<Arc<dyn RuntimeService>>;
    /// Connects to an image endpoint.
    fn connect_image(&self, spec: &EndpointSpec) -> anyhow::Result<Arc<dyn ImageService>>;
}

/// A named runtime service.
#[derive(Clone)]
pub struct RuntimeEndpoint {
    /// Service name.
    pub name: String,
    /// Workload type it serves.
    pub workload_type: WorkloadType,
    /// Endpoint URL.
    pub endpoint_url: String,
    /// The capability handle.
    pub service: Arc<dyn RuntimeService>,
    /// Default for its workload type.
    pub is_default: bool,
    /// Primary runtime of the node.
    pub is_primary: bool,
}

impl std::fmt::Debug for RuntimeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeEndpoint")
            .field("name", &self.name)
            .field("workload_type", &self.workload_type)
            .field("endpoint_url", &self.endpoint_url)
            .field("is_default", &self.is_default)
            .field("is_primary", &self.is_primary)
            .finish()
    }
}

/// A named image service.
#[derive(Clone)]
pub struct ImageEndpoint {
    /// Service name.
    pub name: String,
    /// Workload type it serves.
    pub workload_type: WorkloadType,
    /// Endpoint URL.
    pub endpoint_url: String,
    /// The capability handle.
    pub service: Arc<dyn ImageService>,
    /// Default for its workload type.
    pub is_default: bool,
}

impl std::fmt::Debug for ImageEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageEndpoint")
            .field("name", &self.name)
            .field("workload_type", &self.workload_type)
            .field("endpoint_url", &self.endpoint_url)
            .field("is_default", &self.is_default)
            .finish()
    }
}

/// Readiness of every runtime service: workload type, then service name, then ready.
pub type RuntimeStatusMap = BTreeMap<WorkloadType, BTreeMap<String, bool>>;

/// The set of runtime and image services of this node, immutable once built.
#[derive(Clone, Debug)]
pub struct RuntimeRegistry {
    runtime_services: Vec<RuntimeEndpoint>,
    image_services: Vec<ImageEndpoint>,
}

impl RuntimeRegistry {
    /// Parses both endpoint configurations and connects to every endpoint. An empty image
    /// configuration reuses the runtime one. Every call made through the registry is bounded
    /// by `timeout`.
    pub fn new(
        runtime_config: &str,
        image_config: &str,
        connector: &dyn Connector,
        timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let image_config = if image_config.trim().is_empty() {
            runtime_config
        } else {
            image_config
        };

        let mut runtime_services = Vec::new();
        for spec in parse_endpoints(runtime_config)? {
            let service =
                connector
                    .connect_runtime(&spec)
                    .map_err(|source| RegistryError::Connect {
                        endpoint: spec.endpoint_url.clone(),
                        source,
                    })?;
            info!(
                name = %spec.name,
                workload_type = %spec.workload_type,
                endpoint = %spec.endpoint_url,
                is_default = spec.is_default,
                is_primary = spec.is_primary,
                "registered runtime service"
            );
            runtime_services.push(RuntimeEndpoint {
                service: Arc::new(TimeoutRuntimeService::new(service, timeout)),
                name: spec.name,
                workload_type: spec.workload_type,
                endpoint_url: spec.endpoint_url,
                is_default: spec.is_default,
                is_primary: spec.is_primary,
            });
        }

        let mut image_services = Vec::new();
        for spec in parse_endpoints(image_config)? {
            let service = connector
                .connect_image(&spec)
                .map_err(|source| RegistryError::Connect {
                    endpoint: spec.endpoint_url.clone(),
                    source,
                })?;
            info!(
                name = %spec.name,
                workload_type = %spec.workload_type,
                endpoint = %spec.endpoint_url,
                "registered image service"
            );
            image_services.push(ImageEndpoint {
                service: Arc::new(TimeoutImageService::new(service, timeout)),
                name: spec.name,
                workload_type: spec.workload_type,
                endpoint_url: spec.endpoint_url,
                is_default: spec.is_default,
            });
        }

        Ok(Self::from_endpoints(runtime_services, image_services))
    }

    /// Builds a registry out of already connected services.
    pub fn from_endpoints(
        runtime_services: Vec<RuntimeEndpoint>,
        image_services: Vec<ImageEndpoint>,
    ) -> Self {
        RuntimeRegistry {
            runtime_services,
            image_services,
        }
    }

    /// Every runtime service, in configuration order.
    pub fn get_all_runtime_services(&self) -> &[RuntimeEndpoint] {
        &self.runtime_services
    }

    /// Every image service, in configuration order.
    pub fn get_all_image_services(&self) -> &[ImageEndpoint] {
        &self.image_services
    }

    /// The runtime whose readiness gates node readiness.
    pub fn get_primary_runtime_service(&self) -> Result<&RuntimeEndpoint, RegistryError> {
        self.runtime_services
            .iter()
            .find(|s| s.is_primary)
            .ok_or(RegistryError::PrimaryNotDefined)
    }

    /// The default runtime service for a workload type.
    pub fn get_runtime_service_by_workload_type(
        &self,
        workload_type: WorkloadType,
    ) -> Result<&RuntimeEndpoint, RegistryError> {
        debug!(%workload_type, "looking up default runtime service");
        self.runtime_services
            .iter()
            .find(|s| s.is_default && s.workload_type == workload_type)
            .ok_or_else(|| {
                RegistryError::NotFound(format!("runtime service for workload {}", workload_type))
            })
    }

    /// The default image service for a workload type.
    pub fn get_image_service_by_workload_type(
        &self,
        workload_type: WorkloadType,
    ) -> Result<&ImageEndpoint, RegistryError> {
        debug!(%workload_type, "looking up default image service");
        self.image_services
            .iter()
            .find(|s| s.is_default && s.workload_type == workload_type)
            .ok_or_else(|| {
                RegistryError::NotFound(format!("image service for workload {}", workload_type))
            })
    }

    /// A runtime service by name.
    pub fn get_runtime_service_by_name(&self, name: &str) -> Result<&RuntimeEndpoint, RegistryError> {
        self.runtime_services
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| RegistryError::NotFound(format!("runtime service {}", name)))
    }

    /// An image service by name.
    pub fn get_image_service_by_name(&self, name: &str) -> Result<&ImageEndpoint, RegistryError> {
        self.image_services
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| RegistryError::NotFound(format!("image service {}", name)))
    }

    /// Probes every runtime service. A service is ready only if every condition it reports
    /// holds; a failed probe counts as not ready.
    pub async fn get_all_runtime_status(&self) -> RuntimeStatusMap {
        let mut statuses = RuntimeStatusMap::new();
        for s in &self.runtime_services {
            let ready = match s.service.status().await {
                Ok(status) => status.is_ready(),
                Err(e) => {
                    warn!(name = %s.name, error = %e, "runtime status probe failed");
                    false
                }
            };
            statuses
                .entry(s.workload_type)
                .or_default()
                .insert(s.name.clone(), ready);
        }
        statuses
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;
    use crate::runtime::fake::FakeConnector;

    const TIMEOUT: Duration = Duration::from_secs(15);

    #[test]
    fn test_parse_legacy_endpoint() {
        let specs = parse_endpoints("unix:///run/containerd.sock").unwrap();
        assert_eq!(
            specs,
            vec![EndpointSpec {
                name: "default".to_owned(),
                workload_type: WorkloadType::Container,
                endpoint_url: "unix:///run/containerd.sock".to_owned(),
                is_default: true,
                is_primary: true,
            }]
        );
    }

    #[test]
    fn test_parse_named_endpoints_defaults_first_of_each_type() {
        let specs = parse_endpoints(
            "vm1,vm,unix:///run/virtlet.sock;c1,container,unix:///run/c1.sock;c2,container,unix:///run/c2.sock;vm2,vm,unix:///run/v2.sock",
        )
        .unwrap();
        let flags: Vec<(&str, bool, bool)> = specs
            .iter()
            .map(|s| (s.name.as_str(), s.is_default, s.is_primary))
            .collect();
        assert_eq!(
            flags,
            vec![
                ("vm1", true, false),
                ("c1", true, true),
                ("c2", false, false),
                ("vm2", false, false),
            ]
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_endpoints(""), Err(RegistryError::Empty)));
        assert!(matches!(parse_endpoints("   "), Err(RegistryError::Empty)));
        let err = parse_endpoints("a,container").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        let err = parse_endpoints("a,container,url,extra").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        let err = parse_endpoints("a,wasm,url").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        let err = parse_endpoints("a,container,u1;a,vm,u2").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        let err = parse_endpoints("a,container,u1;").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_lookups() {
        let connector = FakeConnector::default();
        let registry = RuntimeRegistry::new(
            "vm1,vm,unix:///v.sock;c1,container,unix:///c.sock",
            "",
            &connector,
            TIMEOUT,
        )
        .unwrap();
        assert_eq!(registry.get_all_runtime_services().len(), 2);
        assert_eq!(registry.get_all_image_services().len(), 2);
        assert_eq!(registry.get_primary_runtime_service().unwrap().name, "c1");
        assert_eq!(
            registry
                .get_runtime_service_by_workload_type(WorkloadType::Vm)
                .unwrap()
                .name,
            "vm1"
        );
        assert_eq!(
            registry
                .get_image_service_by_workload_type(WorkloadType::Container)
                .unwrap()
                .name,
            "c1"
        );
        assert!(registry.get_runtime_service_by_name("c1").is_ok());
        assert!(matches!(
            registry.get_image_service_by_name("nope"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_primary_not_defined_without_container_runtime() {
        let connector = FakeConnector::default();
        let registry =
            RuntimeRegistry::new("vm1,vm,unix:///v.sock", "", &connector, TIMEOUT).unwrap();
        assert!(matches!(
            registry.get_primary_runtime_service(),
            Err(RegistryError::PrimaryNotDefined)
        ));
        assert!(matches!(
            registry.get_runtime_service_by_workload_type(WorkloadType::Container),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_runtime_status_absorbs_probe_failures() {
        let connector = FakeConnector::default();
        let registry = RuntimeRegistry::new(
            "c1,container,unix:///c1.sock;c2,container,unix:///c2.sock;vm1,vm,unix:///v.sock",
            "",
            &connector,
            TIMEOUT,
        )
        .unwrap();
        connector.runtime("c2").unwrap().set_status_error(true).await;
        connector.runtime("vm1").unwrap().set_ready(false).await;

        let statuses = registry.get_all_runtime_status().await;
        assert_eq!(statuses[&WorkloadType::Container]["c1"], true);
        assert_eq!(statuses[&WorkloadType::Container]["c2"], false);
        assert_eq!(statuses[&WorkloadType::Vm]["vm1"], false);
    }
}
