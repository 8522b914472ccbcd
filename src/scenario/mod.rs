//! Scenario model
//!
//! A [`Scenario`] is one (provider, operating system, container runtime,
//! Kubernetes version) combination to provision and test. Scenarios are
//! immutable values created by the [`generator`]; the executor only reads
//! them. Provider-specific behavior is dispatched through [`CloudProvider`]
//! rather than per-provider subtypes.

pub mod generator;
pub mod matrix;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Cloud providers a cluster can be scheduled on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    /// Amazon Web Services
    Aws,
    /// Microsoft Azure
    Azure,
    /// DigitalOcean
    Digitalocean,
    /// Google Cloud Platform
    Gcp,
    /// Hetzner Cloud
    Hetzner,
    /// OpenStack
    Openstack,
    /// Equinix Metal (formerly Packet); bare metal, slower to provision
    Packet,
}

impl CloudProvider {
    /// Whether this provider can fulfil PersistentVolumeClaims
    pub fn supports_storage(&self) -> bool {
        matches!(
            self,
            Self::Aws | Self::Azure | Self::Gcp | Self::Openstack
        )
    }

    /// Whether this provider can fulfil Services of type LoadBalancer
    pub fn supports_load_balancers(&self) -> bool {
        matches!(self, Self::Aws | Self::Azure | Self::Gcp | Self::Hetzner)
    }

    /// Whether this provider supports dual-stack cluster networking
    pub fn supports_dual_stack(&self) -> bool {
        matches!(self, Self::Aws | Self::Azure | Self::Gcp | Self::Openstack)
    }

    /// Whether this provider supports the given operating system
    pub fn supports_os(&self, os: OperatingSystem) -> bool {
        use OperatingSystem::*;
        match self {
            Self::Aws => true,
            Self::Azure => matches!(os, Ubuntu | Centos | Flatcar | Rhel),
            Self::Digitalocean => matches!(os, Ubuntu | Centos),
            Self::Gcp => matches!(os, Ubuntu),
            Self::Hetzner => matches!(os, Ubuntu | Centos),
            Self::Openstack => matches!(os, Ubuntu | Centos | Flatcar | Rhel),
            Self::Packet => matches!(os, Ubuntu | Centos | Flatcar),
        }
    }

    /// All known providers
    pub fn all() -> &'static [CloudProvider] {
        &[
            Self::Aws,
            Self::Azure,
            Self::Digitalocean,
            Self::Gcp,
            Self::Hetzner,
            Self::Openstack,
            Self::Packet,
        ]
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Digitalocean => "digitalocean",
            Self::Gcp => "gcp",
            Self::Hetzner => "hetzner",
            Self::Openstack => "openstack",
            Self::Packet => "packet",
        };
        f.write_str(s)
    }
}

/// Node operating systems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OperatingSystem {
    /// Ubuntu LTS
    Ubuntu,
    /// CentOS
    Centos,
    /// Flatcar Container Linux
    Flatcar,
    /// Red Hat Enterprise Linux
    Rhel,
    /// SUSE Linux Enterprise Server; AWS-only, docker-only
    Sles,
}

impl OperatingSystem {
    /// All known operating systems
    pub fn all() -> &'static [OperatingSystem] {
        &[Self::Ubuntu, Self::Centos, Self::Flatcar, Self::Rhel, Self::Sles]
    }
}

impl fmt::Display for OperatingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ubuntu => "ubuntu",
            Self::Centos => "centos",
            Self::Flatcar => "flatcar",
            Self::Rhel => "rhel",
            Self::Sles => "sles",
        };
        f.write_str(s)
    }
}

/// Container runtimes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    /// containerd
    Containerd,
    /// Docker; removed from Kubernetes as of 1.24
    Docker,
}

impl ContainerRuntime {
    /// The last minor release that still ships this runtime, if any
    pub fn removed_in(&self) -> Option<KubernetesVersion> {
        match self {
            Self::Containerd => None,
            Self::Docker => Some(KubernetesVersion::new(1, 24, 0)),
        }
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Containerd => f.write_str("containerd"),
            Self::Docker => f.write_str("docker"),
        }
    }
}

/// A Kubernetes release, `major.minor[.patch]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KubernetesVersion {
    /// Major version, in practice always 1
    pub major: u32,
    /// Minor release
    pub minor: u32,
    /// Patch release
    pub patch: u32,
}

impl KubernetesVersion {
    /// Construct a version from its parts
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// `major.minor`, the form used in scenario names
    pub fn minor_release(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }
}

impl FromStr for KubernetesVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('v');
        let mut parts = s.splitn(3, '.');
        let parse = |part: Option<&str>, label: &str| -> Result<u32, Error> {
            part.ok_or_else(|| Error::config(format!("version {s:?} is missing its {label} part")))?
                .parse()
                .map_err(|_| Error::config(format!("version {s:?} has a non-numeric {label} part")))
        };
        let major = parse(parts.next(), "major")?;
        let minor = parse(parts.next(), "minor")?;
        let patch = match parts.next() {
            Some(p) => p
                .parse()
                .map_err(|_| Error::config(format!("version {s:?} has a non-numeric patch part")))?,
            None => 0,
        };
        Ok(Self { major, minor, patch })
    }
}

impl TryFrom<String> for KubernetesVersion {
    type Error = Error;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<KubernetesVersion> for String {
    fn from(v: KubernetesVersion) -> Self {
        v.to_string()
    }
}

impl fmt::Display for KubernetesVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// One combination to provision and test. Immutable after generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    /// Cloud provider the cluster is scheduled on
    pub provider: CloudProvider,
    /// Node operating system
    pub operating_system: OperatingSystem,
    /// Node container runtime
    pub container_runtime: ContainerRuntime,
    /// Kubernetes control-plane and node version
    pub version: KubernetesVersion,
    /// Whether the cluster runs dual-stack networking
    pub dual_stack: bool,
    /// Datacenter the provider schedules this cluster into
    pub datacenter: String,
}

impl Scenario {
    /// Deterministic scenario name derived from its fields.
    ///
    /// Unique per combination; also used as the JUnit report file stem, so
    /// parallel workers never collide on disk.
    pub fn name(&self) -> String {
        let mut name = format!(
            "{}-{}-{}-{}",
            self.provider,
            self.operating_system,
            self.container_runtime,
            self.version.minor_release(),
        );
        if self.dual_stack {
            name.push_str("-dualstack");
        }
        name
    }

    /// Build the cluster creation spec for this scenario
    pub fn cluster_spec(&self) -> ClusterSpec {
        ClusterSpec {
            version: self.version,
            provider: self.provider,
            datacenter: self.datacenter.clone(),
            dual_stack: self.dual_stack,
        }
    }

    /// Build the worker machine spec for this scenario.
    ///
    /// Fallible: some providers resolve image references lazily and the
    /// lookup can transiently fail, which is why the executor retries this
    /// within a bounded window.
    pub fn machine_spec(&self, replicas: u32) -> Result<MachineSpec, Error> {
        if replicas == 0 {
            return Err(Error::config("machine spec needs at least one replica"));
        }
        Ok(MachineSpec {
            replicas,
            provider: self.provider,
            operating_system: self.operating_system,
            container_runtime: self.container_runtime,
            version: self.version,
        })
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Cluster creation request handed to the provisioner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    /// Control-plane version
    pub version: KubernetesVersion,
    /// Target provider
    pub provider: CloudProvider,
    /// Target datacenter
    pub datacenter: String,
    /// Dual-stack networking
    pub dual_stack: bool,
}

/// Worker machine request handed to the machine provisioner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    /// Desired replica count
    pub replicas: u32,
    /// Target provider
    pub provider: CloudProvider,
    /// Node operating system
    pub operating_system: OperatingSystem,
    /// Node container runtime
    pub container_runtime: ContainerRuntime,
    /// Kubelet version
    pub version: KubernetesVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> Scenario {
        Scenario {
            provider: CloudProvider::Aws,
            operating_system: OperatingSystem::Ubuntu,
            container_runtime: ContainerRuntime::Containerd,
            version: "1.30.4".parse().unwrap(),
            dual_stack: false,
            datacenter: "aws-eu-central-1a".to_string(),
        }
    }

    #[test]
    fn name_is_deterministic_and_derived_from_fields() {
        assert_eq!(scenario().name(), "aws-ubuntu-containerd-1.30");

        let mut dual = scenario();
        dual.dual_stack = true;
        assert_eq!(dual.name(), "aws-ubuntu-containerd-1.30-dualstack");
    }

    #[test]
    fn versions_parse_with_and_without_patch() {
        let v: KubernetesVersion = "1.30".parse().unwrap();
        assert_eq!(v, KubernetesVersion::new(1, 30, 0));

        let v: KubernetesVersion = "v1.31.2".parse().unwrap();
        assert_eq!(v, KubernetesVersion::new(1, 31, 2));

        assert!("one.thirty".parse::<KubernetesVersion>().is_err());
        assert!("1".parse::<KubernetesVersion>().is_err());
    }

    #[test]
    fn versions_order_numerically_not_lexically() {
        let v9: KubernetesVersion = "1.9".parse().unwrap();
        let v30: KubernetesVersion = "1.30".parse().unwrap();
        assert!(v9 < v30);
    }

    #[test]
    fn docker_is_gone_from_one_twentyfour() {
        let cutoff = ContainerRuntime::Docker.removed_in().unwrap();
        assert_eq!(cutoff, KubernetesVersion::new(1, 24, 0));
        assert!(ContainerRuntime::Containerd.removed_in().is_none());
    }

    #[test]
    fn provider_capability_matrix_matches_cloud_reality() {
        assert!(CloudProvider::Aws.supports_storage());
        assert!(CloudProvider::Hetzner.supports_load_balancers());
        assert!(!CloudProvider::Hetzner.supports_storage());
        assert!(!CloudProvider::Packet.supports_load_balancers());
        assert!(!CloudProvider::Gcp.supports_os(OperatingSystem::Flatcar));
        assert!(CloudProvider::Aws.supports_os(OperatingSystem::Sles));
    }

    #[test]
    fn machine_spec_rejects_zero_replicas() {
        assert!(scenario().machine_spec(0).is_err());
        assert_eq!(scenario().machine_spec(3).unwrap().replicas, 3);
    }
}
