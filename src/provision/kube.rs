//! kube-backed provisioner implementation
//!
//! Talks to the managed control plane (the "host" cluster) through its CRDs
//! and to provisioned user clusters through their admin kubeconfigs. All
//! CR access goes through `DynamicObject` with explicit `ApiResource`s so
//! the orchestrator does not need generated bindings for the platform API.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde_json::json;
use tracing::{debug, info};

use crate::error::Error;
use crate::provision::{
    ClusterHandle, ClusterInspector, ClusterProvisioner, MachineProvisioner, UnreadyPod,
    UserCluster,
};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::scenario::{ClusterSpec, MachineSpec};

/// Label carrying the owning project on cluster objects
const PROJECT_LABEL: &str = "project-id";
/// Secret holding the admin kubeconfig inside a cluster's namespace
const ADMIN_KUBECONFIG_SECRET: &str = "admin-kubeconfig";
/// Namespace the machine controller keeps its objects in
const MACHINE_NAMESPACE: &str = "kube-system";
/// Name of the machine deployment this orchestrator creates
const MACHINE_DEPLOYMENT_NAME: &str = "konform-workers";

fn cluster_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: "kubermatic.k8c.io".to_string(),
        version: "v1".to_string(),
        kind: "Cluster".to_string(),
    })
}

fn project_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: "kubermatic.k8c.io".to_string(),
        version: "v1".to_string(),
        kind: "Project".to_string(),
    })
}

fn addon_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: "kubermatic.k8c.io".to_string(),
        version: "v1".to_string(),
        kind: "Addon".to_string(),
    })
}

fn machine_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: "cluster.k8s.io".to_string(),
        version: "v1alpha1".to_string(),
        kind: "Machine".to_string(),
    })
}

fn machine_deployment_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: "cluster.k8s.io".to_string(),
        version: "v1alpha1".to_string(),
        kind: "MachineDeployment".to_string(),
    })
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 404)
}

/// Cluster provisioner backed by the managed control plane's CRDs
pub struct KubeClusterProvisioner {
    host: Client,
    project: String,
    retry: RetryConfig,
}

impl KubeClusterProvisioner {
    /// Create a provisioner for the given host-cluster client and project
    pub fn new(host: Client, project: impl Into<String>) -> Self {
        Self {
            host,
            project: project.into(),
            retry: RetryConfig::default(),
        }
    }

    fn clusters(&self) -> Api<DynamicObject> {
        Api::all_with(self.host.clone(), &cluster_resource())
    }
}

#[async_trait]
impl ClusterProvisioner for KubeClusterProvisioner {
    async fn create_cluster(&self, name: &str, spec: &ClusterSpec) -> Result<ClusterHandle, Error> {
        info!(cluster = name, provider = %spec.provider, "Creating cluster");

        let mut object = DynamicObject::new(name, &cluster_resource());
        object.metadata.labels = Some(
            [(PROJECT_LABEL.to_string(), self.project.clone())]
                .into_iter()
                .collect(),
        );
        // The provider name is the key of an empty per-provider section,
        // which json! cannot express with a dynamic key
        let mut cloud = serde_json::Map::new();
        cloud.insert("datacenter".to_string(), json!(spec.datacenter));
        cloud.insert(spec.provider.to_string(), json!({}));

        object.data = json!({
            "spec": {
                "humanReadableName": name,
                "version": spec.version.to_string(),
                "cloud": cloud,
                "clusterNetwork": {
                    "ipFamily": if spec.dual_stack { "IPv4+IPv6" } else { "IPv4" },
                },
            },
        });

        let clusters = self.clusters();
        clusters.create(&PostParams::default(), &object).await?;

        // The platform assigns the control-plane namespace asynchronously
        let (object, namespace) = retry_with_backoff(&self.retry, "read back created cluster", || {
            let clusters = clusters.clone();
            async move {
                let object = clusters.get(name).await?;
                let namespace = object
                    .data
                    .pointer("/status/namespaceName")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                match namespace {
                    Some(ns) => Ok((object, ns)),
                    None => Err(Error::provisioning(format!(
                        "cluster {name} has no control-plane namespace yet"
                    ))),
                }
            }
        })
        .await?;
        let platform_version = object
            .data
            .pointer("/status/versions/controlPlane")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(ClusterHandle {
            name: name.to_string(),
            namespace,
            platform_version,
        })
    }

    async fn delete_cluster(&self, name: &str) -> Result<(), Error> {
        debug!(cluster = name, "Issuing cluster deletion");
        match self.clusters().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Repeated deletes race with finalizer removal; gone is the goal
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_clusters(&self) -> Result<Vec<String>, Error> {
        let params =
            ListParams::default().labels(&format!("{PROJECT_LABEL}={}", self.project));
        let list = self.clusters().list(&params).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|c| c.metadata.name)
            .collect())
    }

    async fn cluster_exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.clusters().get_opt(name).await?.is_some())
    }

    async fn missing_conditions(&self, cluster: &ClusterHandle) -> Result<Vec<String>, Error> {
        let object = self.clusters().get(&cluster.name).await?;
        let conditions = object
            .data
            .pointer("/status/conditions")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        let missing = conditions
            .iter()
            .filter(|(name, condition)| {
                // The platform-version condition is ignored so third-party
                // deployments can be tested against.
                if name.contains("Version") {
                    return false;
                }
                condition
                    .pointer("/status")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown")
                    != "True"
            })
            .map(|(name, _)| name.clone())
            .collect();

        Ok(missing)
    }

    async fn unready_control_plane_pods(
        &self,
        cluster: &ClusterHandle,
    ) -> Result<Vec<String>, Error> {
        let pods: Api<Pod> = Api::namespaced(self.host.clone(), &cluster.namespace);
        let list = pods.list(&ListParams::default()).await?;
        Ok(list
            .items
            .iter()
            .filter(|p| !pod_is_ready(p))
            .filter_map(|p| p.metadata.name.clone())
            .collect())
    }

    async fn connect(&self, cluster: &ClusterHandle) -> Result<UserCluster, Error> {
        let secrets: Api<Secret> = Api::namespaced(self.host.clone(), &cluster.namespace);
        let secret = secrets.get(ADMIN_KUBECONFIG_SECRET).await?;
        let kubeconfig_bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get("kubeconfig"))
            .ok_or_else(|| {
                Error::provisioning(format!(
                    "admin kubeconfig secret of cluster {} has no kubeconfig key",
                    cluster.name
                ))
            })?;
        let kubeconfig_yaml = String::from_utf8(kubeconfig_bytes.0.clone())
            .map_err(|e| Error::provisioning(format!("kubeconfig is not valid UTF-8: {e}")))?;

        let kubeconfig = Kubeconfig::from_yaml(&kubeconfig_yaml)
            .map_err(|e| Error::provisioning(format!("failed to parse admin kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::provisioning(format!("failed to build client config: {e}")))?;
        let client = Client::try_from(config)?;

        Ok(UserCluster::new(client))
    }

    async fn create_project(&self, name: &str) -> Result<String, Error> {
        info!(project = name, "Creating project");
        let mut object = DynamicObject::new(name, &project_resource());
        object.data = json!({"spec": {"name": name}});

        let projects: Api<DynamicObject> =
            Api::all_with(self.host.clone(), &project_resource());
        projects.create(&PostParams::default(), &object).await?;
        Ok(name.to_string())
    }

    async fn delete_project(&self, id: &str) -> Result<(), Error> {
        let projects: Api<DynamicObject> =
            Api::all_with(self.host.clone(), &project_resource());
        match projects.delete(id, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(Error::teardown(format!("failed to delete project {id}: {err}"))),
        }
    }
}

/// Machine provisioner working through the user cluster's machine controller
pub struct KubeMachineProvisioner;

impl KubeMachineProvisioner {
    fn machine_deployments(user: &UserCluster) -> Result<Api<DynamicObject>, Error> {
        Ok(Api::namespaced_with(
            user.client()?.clone(),
            MACHINE_NAMESPACE,
            &machine_deployment_resource(),
        ))
    }
}

#[async_trait]
impl MachineProvisioner for KubeMachineProvisioner {
    async fn existing_replicas(&self, user: &UserCluster) -> Result<u32, Error> {
        let list = Self::machine_deployments(user)?
            .list(&ListParams::default())
            .await?;
        Ok(list
            .items
            .iter()
            .filter_map(|md| md.data.pointer("/spec/replicas").and_then(|v| v.as_u64()))
            .sum::<u64>() as u32)
    }

    async fn create_machines(&self, user: &UserCluster, spec: &MachineSpec) -> Result<(), Error> {
        info!(replicas = spec.replicas, os = %spec.operating_system, "Creating worker machines");

        let mut object = DynamicObject::new(MACHINE_DEPLOYMENT_NAME, &machine_deployment_resource());
        object.metadata.namespace = Some(MACHINE_NAMESPACE.to_string());
        object.data = json!({
            "spec": {
                "replicas": spec.replicas,
                "template": {
                    "spec": {
                        "versions": {"kubelet": spec.version.to_string()},
                        "providerSpec": {
                            "value": {
                                "cloudProvider": spec.provider.to_string(),
                                "operatingSystem": spec.operating_system.to_string(),
                                "containerRuntime": spec.container_runtime.to_string(),
                            },
                        },
                    },
                },
            },
        });

        Self::machine_deployments(user)?
            .create(&PostParams::default(), &object)
            .await?;
        Ok(())
    }

    async fn machines_without_node(&self, user: &UserCluster) -> Result<Vec<String>, Error> {
        let machines: Api<DynamicObject> = Api::namespaced_with(
            user.client()?.clone(),
            MACHINE_NAMESPACE,
            &machine_resource(),
        );
        let list = machines.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|m| {
                m.data
                    .pointer("/status/nodeRef/name")
                    .and_then(|v| v.as_str())
                    .map(str::is_empty)
                    .unwrap_or(true)
            })
            .filter_map(|m| m.metadata.name)
            .collect())
    }

    async fn unready_nodes(&self, user: &UserCluster) -> Result<Vec<String>, Error> {
        let nodes: Api<Node> = Api::all(user.client()?.clone());
        let list = nodes.list(&ListParams::default()).await?;
        Ok(list
            .items
            .iter()
            .filter(|n| !node_is_ready(n))
            .filter_map(|n| n.metadata.name.clone())
            .collect())
    }
}

/// Inspector reading workload state from the user cluster and addon state
/// from the host cluster
pub struct KubeClusterInspector {
    host: Client,
}

impl KubeClusterInspector {
    /// Create an inspector for the given host-cluster client
    pub fn new(host: Client) -> Self {
        Self { host }
    }
}

#[async_trait]
impl ClusterInspector for KubeClusterInspector {
    async fn unready_pods(&self, user: &UserCluster) -> Result<Vec<UnreadyPod>, Error> {
        let pods: Api<Pod> = Api::all(user.client()?.clone());
        let list = pods.list(&ListParams::default()).await?;

        Ok(list
            .items
            .iter()
            .filter(|p| !pod_is_ready(p))
            .map(|p| UnreadyPod {
                name: p.metadata.name.clone().unwrap_or_default(),
                namespace: p.metadata.namespace.clone().unwrap_or_default(),
                phase: p
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_default(),
                reason: p
                    .status
                    .as_ref()
                    .and_then(|s| s.reason.clone())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn unreconciled_addons(&self, cluster: &ClusterHandle) -> Result<Vec<String>, Error> {
        let addons: Api<DynamicObject> = Api::namespaced_with(
            self.host.clone(),
            &cluster.namespace,
            &addon_resource(),
        );
        let list = addons.list(&ListParams::default()).await?;

        Ok(list
            .items
            .into_iter()
            .filter(|a| {
                a.data
                    .pointer("/status/conditions/ReconciledSuccessfully/status")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown")
                    != "True"
            })
            .filter_map(|a| a.metadata.name)
            .collect())
    }
}
