//! Resolved run configuration
//!
//! Flags and an optional YAML file are merged into one validated [`Options`]
//! value before the core ever runs; nothing downstream re-reads flags or
//! files. CLI flags win over file values, file values over defaults.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::checks;
use crate::error::Error;
use crate::metrics::MetricsConfig;
use crate::runner::executor::ExecutorOptions;
use crate::runner::results::TestConfiguration;
use crate::scenario::{CloudProvider, ContainerRuntime, KubernetesVersion, OperatingSystem};

/// Fully resolved, validated configuration for one orchestrator run
#[derive(Debug, Clone)]
pub struct Options {
    /// Enabled cloud providers
    pub providers: BTreeSet<CloudProvider>,
    /// Enabled operating systems
    pub distributions: BTreeSet<OperatingSystem>,
    /// Enabled container runtimes
    pub container_runtimes: BTreeSet<ContainerRuntime>,
    /// Kubernetes versions to test
    pub versions: Vec<KubernetesVersion>,
    /// Dual-stack networking toggle
    pub dual_stack: bool,
    /// Operating-system-manager toggle
    pub operating_system_manager: bool,
    /// Check names excluded from the battery
    pub excluded_checks: BTreeSet<String>,
    /// Number of clusters tested in parallel
    pub parallelism: usize,
    /// Worker nodes per cluster
    pub node_count: u32,
    /// Prefix for generated cluster names
    pub name_prefix: String,
    /// Existing project to schedule clusters into; a fresh project is
    /// created (and deleted afterwards) when unset
    pub project: Option<String>,
    /// Directory for JUnit reports
    pub reports_root: PathBuf,
    /// Results-status file for retry-only-failed runs
    pub results_file: Option<PathBuf>,
    /// Whether to drop scenarios that passed in a previous run
    pub retry_failed: bool,
    /// Per-provider datacenter overrides
    pub datacenters: BTreeMap<CloudProvider, String>,
    /// Reconciliation wait deadline
    pub reconciliation_timeout: Duration,
    /// Control-plane wait deadline
    pub control_plane_timeout: Duration,
    /// Shared budget for node and workload waits
    pub node_ready_timeout: Duration,
    /// Per-check timeout
    pub check_timeout: Duration,
    /// Poll interval for user-cluster conditions
    pub poll_interval: Duration,
    /// Cluster deletion deadline
    pub delete_timeout: Duration,
    /// Whether clusters are torn down after testing
    pub delete_cluster_after_tests: bool,
    /// Metrics export settings
    pub metrics: MetricsConfig,
}

impl Default for Options {
    fn default() -> Self {
        let executor = ExecutorOptions::default();
        Self {
            providers: BTreeSet::new(),
            distributions: BTreeSet::new(),
            container_runtimes: [ContainerRuntime::Containerd].into(),
            versions: Vec::new(),
            dual_stack: false,
            operating_system_manager: false,
            excluded_checks: BTreeSet::new(),
            parallelism: 1,
            node_count: executor.node_count,
            name_prefix: String::new(),
            project: None,
            reports_root: executor.reports_root.clone(),
            results_file: None,
            retry_failed: false,
            datacenters: BTreeMap::new(),
            reconciliation_timeout: executor.reconciliation_timeout,
            control_plane_timeout: executor.control_plane_timeout,
            node_ready_timeout: executor.node_ready_timeout,
            check_timeout: executor.check_timeout,
            poll_interval: executor.poll_interval,
            delete_timeout: executor.delete_timeout,
            delete_cluster_after_tests: executor.delete_cluster_after_tests,
            metrics: MetricsConfig::default(),
        }
    }
}

impl Options {
    /// Check invariants that would otherwise surface deep inside the run
    pub fn validate(&self) -> Result<(), Error> {
        if self.providers.is_empty() {
            return Err(Error::config("at least one provider must be enabled"));
        }
        if self.distributions.is_empty() {
            return Err(Error::config("at least one distribution must be enabled"));
        }
        if self.versions.is_empty() {
            return Err(Error::config("at least one version must be enabled"));
        }
        if self.parallelism == 0 {
            return Err(Error::config("parallelism must be at least 1"));
        }
        if self.node_count == 0 {
            return Err(Error::config("node count must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll interval must not be zero"));
        }
        if self.retry_failed && self.results_file.is_none() {
            return Err(Error::config(
                "retrying failed scenarios requires a results file",
            ));
        }
        Ok(())
    }

    /// The executor's slice of this configuration
    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            reports_root: self.reports_root.clone(),
            name_prefix: self.name_prefix.clone(),
            node_count: self.node_count,
            enabled_operating_systems: self.distributions.clone(),
            reconciliation_timeout: self.reconciliation_timeout,
            control_plane_timeout: self.control_plane_timeout,
            node_ready_timeout: self.node_ready_timeout,
            check_timeout: self.check_timeout,
            poll_interval: self.poll_interval,
            delete_timeout: self.delete_timeout,
            delete_cluster_after_tests: self.delete_cluster_after_tests,
        }
    }

    /// The configuration fingerprint recorded in the results file
    pub fn test_configuration(&self) -> TestConfiguration {
        let enabled_checks = checks::default_checks(&self.excluded_checks)
            .iter()
            .map(|c| c.name())
            .collect();
        TestConfiguration {
            dual_stack: self.dual_stack,
            operating_system_manager: self.operating_system_manager,
            checks: enabled_checks,
        }
    }
}

/// Resolve the effective distribution set from enable and exclude lists.
///
/// Exactly one of the two lists must be given: silently testing everything
/// (or nothing) because both were empty has bitten before.
pub fn effective_distributions(
    enabled: &[OperatingSystem],
    excluded: &[OperatingSystem],
) -> Result<BTreeSet<OperatingSystem>, Error> {
    match (enabled.is_empty(), excluded.is_empty()) {
        (false, false) => Err(Error::config(
            "--distributions and --exclude-distributions must not be given at the same time",
        )),
        (true, true) => Err(Error::config(
            "either --distributions or --exclude-distributions must be given",
        )),
        (false, true) => Ok(enabled.iter().copied().collect()),
        (true, false) => {
            let excluded: BTreeSet<_> = excluded.iter().copied().collect();
            let remaining: BTreeSet<_> = OperatingSystem::all()
                .iter()
                .copied()
                .filter(|os| !excluded.contains(os))
                .collect();
            if remaining.is_empty() {
                return Err(Error::config(
                    "no distribution remained after applying --exclude-distributions",
                ));
            }
            Ok(remaining)
        }
    }
}

/// YAML overlay with the same shape as the flags; all fields optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OptionsFile {
    /// Enabled providers
    pub providers: Option<Vec<CloudProvider>>,
    /// Enabled distributions
    pub distributions: Option<Vec<OperatingSystem>>,
    /// Excluded distributions
    pub exclude_distributions: Option<Vec<OperatingSystem>>,
    /// Enabled container runtimes
    pub container_runtimes: Option<Vec<ContainerRuntime>>,
    /// Versions to test
    pub versions: Option<Vec<KubernetesVersion>>,
    /// Dual-stack toggle
    pub dual_stack_enabled: Option<bool>,
    /// Operating-system-manager toggle
    pub operating_system_manager_enabled: Option<bool>,
    /// Excluded check names
    pub exclude_checks: Option<Vec<String>>,
    /// Parallel cluster count
    pub cluster_parallel_count: Option<usize>,
    /// Worker nodes per cluster
    pub node_count: Option<u32>,
    /// Cluster name prefix
    pub name_prefix: Option<String>,
    /// Existing project identifier
    pub project: Option<String>,
    /// JUnit report directory
    pub reports_root: Option<PathBuf>,
    /// Results-status file path
    pub results_file: Option<PathBuf>,
    /// Retry-only-failed toggle
    pub retry_failed_scenarios: Option<bool>,
    /// Per-provider datacenters
    pub datacenters: Option<BTreeMap<CloudProvider, String>>,
    /// Control-plane wait deadline, seconds
    pub control_plane_timeout_seconds: Option<u64>,
    /// Node readiness budget, seconds
    pub node_ready_timeout_seconds: Option<u64>,
    /// Per-check timeout, seconds
    pub check_timeout_seconds: Option<u64>,
    /// Poll interval, seconds
    pub poll_interval_seconds: Option<u64>,
    /// Whether to delete clusters after tests
    pub delete_cluster_after_tests: Option<bool>,
    /// OTLP endpoint for metrics
    pub otlp_endpoint: Option<String>,
}

impl OptionsFile {
    /// Parse an overlay from YAML
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("invalid configuration file: {e}")))
    }

    /// Layer this overlay onto `options`; only set fields override
    pub fn apply(&self, options: &mut Options) {
        if let Some(providers) = &self.providers {
            options.providers = providers.iter().copied().collect();
        }
        if let Some(distributions) = &self.distributions {
            options.distributions = distributions.iter().copied().collect();
        }
        if let Some(excluded) = &self.exclude_distributions {
            if let Ok(remaining) = effective_distributions(&[], excluded) {
                options.distributions = remaining;
            }
        }
        if let Some(runtimes) = &self.container_runtimes {
            options.container_runtimes = runtimes.iter().copied().collect();
        }
        if let Some(versions) = &self.versions {
            options.versions = versions.clone();
        }
        if let Some(dual_stack) = self.dual_stack_enabled {
            options.dual_stack = dual_stack;
        }
        if let Some(osm) = self.operating_system_manager_enabled {
            options.operating_system_manager = osm;
        }
        if let Some(excluded) = &self.exclude_checks {
            options.excluded_checks = excluded.iter().cloned().collect();
        }
        if let Some(parallel) = self.cluster_parallel_count {
            options.parallelism = parallel;
        }
        if let Some(nodes) = self.node_count {
            options.node_count = nodes;
        }
        if let Some(prefix) = &self.name_prefix {
            options.name_prefix = prefix.clone();
        }
        if let Some(project) = &self.project {
            options.project = Some(project.clone());
        }
        if let Some(root) = &self.reports_root {
            options.reports_root = root.clone();
        }
        if let Some(file) = &self.results_file {
            options.results_file = Some(file.clone());
        }
        if let Some(retry) = self.retry_failed_scenarios {
            options.retry_failed = retry;
        }
        if let Some(datacenters) = &self.datacenters {
            options.datacenters = datacenters.clone();
        }
        if let Some(secs) = self.control_plane_timeout_seconds {
            options.control_plane_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.node_ready_timeout_seconds {
            options.node_ready_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.check_timeout_seconds {
            options.check_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.poll_interval_seconds {
            options.poll_interval = Duration::from_secs(secs);
        }
        if let Some(delete) = self.delete_cluster_after_tests {
            options.delete_cluster_after_tests = delete;
        }
        if let Some(endpoint) = &self.otlp_endpoint {
            options.metrics.otlp_endpoint = Some(endpoint.clone());
        }
    }
}
