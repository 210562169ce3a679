//! Cluster pod-lister contract and its Kubernetes implementation

use async_trait::async_trait;
use gpusched_core::{SchedError, SchedResult};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::PathBuf;
use tracing::{debug, info};

/// Extended resource name of whole NVIDIA GPUs
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Lifecycle phase of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn from_phase(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Pod will never run again
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// What telemetry needs to know about a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    /// Empty until scheduled
    pub node_name: String,
    /// Whole GPUs requested across all containers
    pub gpu_request: u32,
}

impl From<&Pod> for PodInfo {
    fn from(pod: &Pod) -> Self {
        let gpu_request: u32 = pod
            .spec
            .as_ref()
            .map(|spec| {
                spec.containers
                    .iter()
                    .filter_map(|c| c.resources.as_ref()?.requests.as_ref()?.get(GPU_RESOURCE))
                    .filter_map(|q| q.0.trim().parse::<u32>().ok())
                    .sum()
            })
            .unwrap_or(0);

        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            phase: pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .map(PodPhase::from_phase)
                .unwrap_or(PodPhase::Unknown),
            node_name: pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default(),
            gpu_request,
        }
    }
}

/// Cluster API used by telemetry collection
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Pods in `namespace` matching `label_selector`; empty when none exist
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> SchedResult<Vec<PodInfo>>;
}

/// [`ClusterClient`] over the Kubernetes API
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect with an explicit kubeconfig, or in-cluster / `~/.kube/config` without one
    pub async fn connect(kubeconfig: Option<PathBuf>) -> SchedResult<Self> {
        let client = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(&path).map_err(|e| {
                    SchedError::Cluster(format!(
                        "failed to read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| {
                            SchedError::Cluster(format!(
                                "failed to load kubeconfig {}: {}",
                                path.display(),
                                e
                            ))
                        })?;
                Client::try_from(config)
                    .map_err(|e| SchedError::Cluster(format!("failed to create client: {}", e)))?
            }
            None => Client::try_default()
                .await
                .map_err(|e| SchedError::Cluster(format!("failed to create client: {}", e)))?,
        };

        info!("Kubernetes client connected");
        Ok(Self::new(client))
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> SchedResult<Vec<PodInfo>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(label_selector);

        match api.list(&params).await {
            Ok(list) => {
                debug!(
                    namespace,
                    selector = label_selector,
                    pods = list.items.len(),
                    "Listed pods"
                );
                Ok(list.items.iter().map(PodInfo::from).collect())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(Vec::new()),
            Err(e) => Err(SchedError::Cluster(format!(
                "list pods in {} ({}): {}",
                namespace, label_selector, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn container(gpus: Option<&str>) -> Container {
        let requests =
            gpus.map(|g| BTreeMap::from([(GPU_RESOURCE.to_string(), Quantity(g.to_string()))]));
        Container {
            name: "main".to_string(),
            resources: Some(ResourceRequirements {
                requests,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_info_from_pod() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("trainer-0".to_string()),
                namespace: Some("ml".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("gpu-node-1".to_string()),
                containers: vec![container(Some("2")), container(None), container(Some("1"))],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        };

        let info = PodInfo::from(&pod);
        assert_eq!(info.name, "trainer-0");
        assert_eq!(info.namespace, "ml");
        assert_eq!(info.node_name, "gpu-node-1");
        assert_eq!(info.phase, PodPhase::Running);
        assert_eq!(info.gpu_request, 3);
    }

    #[test]
    fn test_pod_phase() {
        assert!(PodPhase::from_phase("Succeeded").is_terminal());
        assert!(PodPhase::from_phase("Failed").is_terminal());
        assert!(!PodPhase::from_phase("Running").is_terminal());
        assert_eq!(PodPhase::from_phase("weird"), PodPhase::Unknown);
    }

    #[test]
    fn test_pod_without_spec() {
        let info = PodInfo::from(&Pod::default());
        assert_eq!(info.gpu_request, 0);
        assert_eq!(info.phase, PodPhase::Unknown);
    }
}
