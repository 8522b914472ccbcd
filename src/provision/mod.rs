//! Provisioning and inspection seams
//!
//! The executor drives scenarios entirely through the capability traits in
//! this module; the production implementation in [`kube`] talks to a managed
//! control plane, and tests substitute mocks. The traits are deliberately
//! narrow: create/delete/list plus the condition observations the wait
//! phases poll.

pub mod kube;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::scenario::{ClusterSpec, MachineSpec};

/// Handle to a provisioned cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHandle {
    /// Unique cluster name (scenario name plus a random suffix)
    pub name: String,
    /// Namespace in the host cluster holding this cluster's control plane
    pub namespace: String,
    /// Control-plane platform version reported by the provisioner
    pub platform_version: String,
}

/// A pod that is not (yet) ready, as observed in the user cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadyPod {
    /// Pod name
    pub name: String,
    /// Pod namespace
    pub namespace: String,
    /// Pod phase (`Pending`, `Running`, `Failed`, ...)
    pub phase: String,
    /// Status reason, if the kubelet reported one
    pub reason: String,
}

impl UnreadyPod {
    /// A pod scheduled but rejected by kubelet admission due to the
    /// scheduler/kubelet node-affinity race. Such pods never become ready
    /// and must not block workload readiness.
    pub fn failed_kubelet_admission(&self) -> bool {
        self.phase == "Failed" && self.reason == "NodeAffinity"
    }
}

/// Live handle to a provisioned user cluster, handed to checks.
///
/// Stub environments run without a real cluster; [`UserCluster::detached`]
/// produces a handle whose client accessor errors instead of panicking.
#[derive(Clone)]
pub struct UserCluster {
    client: Option<::kube::Client>,
}

impl UserCluster {
    /// Wrap a connected kube client
    pub fn new(client: ::kube::Client) -> Self {
        Self {
            client: Some(client),
        }
    }

    /// A handle without a live cluster behind it
    pub fn detached() -> Self {
        Self { client: None }
    }

    /// The kube client for the user cluster
    pub fn client(&self) -> Result<&::kube::Client, Error> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::provisioning("no live user cluster attached"))
    }
}

impl std::fmt::Debug for UserCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCluster")
            .field("connected", &self.client.is_some())
            .finish()
    }
}

/// Cluster lifecycle operations against the managed control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    /// Create a cluster for the given spec under the given unique name
    async fn create_cluster(&self, name: &str, spec: &ClusterSpec) -> Result<ClusterHandle, Error>;

    /// Issue a cluster deletion. Idempotent; callers poll
    /// [`ClusterProvisioner::cluster_exists`] until the object is gone.
    async fn delete_cluster(&self, name: &str) -> Result<(), Error>;

    /// Names of all clusters owned by this run's project
    async fn list_clusters(&self) -> Result<Vec<String>, Error>;

    /// Whether the named cluster object still exists (finalizers may keep it
    /// around long after deletion was requested)
    async fn cluster_exists(&self, name: &str) -> Result<bool, Error>;

    /// Readiness conditions the control plane has not met yet. The platform
    /// version condition is excluded so third-party deployments can be
    /// tested against.
    async fn missing_conditions(&self, cluster: &ClusterHandle) -> Result<Vec<String>, Error>;

    /// Control-plane pods in the host cluster that are not ready
    async fn unready_control_plane_pods(
        &self,
        cluster: &ClusterHandle,
    ) -> Result<Vec<String>, Error>;

    /// Connect to the provisioned user cluster
    async fn connect(&self, cluster: &ClusterHandle) -> Result<UserCluster, Error>;

    /// Create a project owning this run's clusters; returns its identifier
    async fn create_project(&self, name: &str) -> Result<String, Error>;

    /// Delete a project created by this run
    async fn delete_project(&self, id: &str) -> Result<(), Error>;
}

/// Worker machine operations, performed against the live user cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineProvisioner: Send + Sync {
    /// Sum of replicas across existing machine deployments
    async fn existing_replicas(&self, user: &UserCluster) -> Result<u32, Error>;

    /// Create machines per the given spec
    async fn create_machines(&self, user: &UserCluster, spec: &MachineSpec) -> Result<(), Error>;

    /// Machine objects without a realized node back-reference
    async fn machines_without_node(&self, user: &UserCluster) -> Result<Vec<String>, Error>;

    /// Nodes not reporting the Ready condition
    async fn unready_nodes(&self, user: &UserCluster) -> Result<Vec<String>, Error>;
}

/// Read-only workload and addon observations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterInspector: Send + Sync {
    /// Pods in the user cluster that are not ready, excluding nothing;
    /// callers decide which unready pods are benign
    async fn unready_pods(&self, user: &UserCluster) -> Result<Vec<UnreadyPod>, Error>;

    /// Addon objects of the cluster that have not reconciled successfully
    async fn unreconciled_addons(&self, cluster: &ClusterHandle) -> Result<Vec<String>, Error>;
}
