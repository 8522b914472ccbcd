//! Scenario matrix generation
//!
//! Expands enabled providers × operating systems × container runtimes ×
//! versions into the filtered, shuffled scenario list for one run. All
//! compatibility filters are pure functions of the candidate; the shuffle is
//! time-seeded so scenarios hitting the same quota-limited account are
//! decorrelated across parallel workers.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::error::Error;
use crate::runner::results::{ResultsFile, ScenarioStatus};
use crate::scenario::{
    CloudProvider, ContainerRuntime, KubernetesVersion, OperatingSystem, Scenario,
};

/// Builder for the scenario matrix
#[derive(Debug, Clone, Default)]
pub struct Generator {
    providers: BTreeSet<CloudProvider>,
    operating_systems: BTreeSet<OperatingSystem>,
    container_runtimes: BTreeSet<ContainerRuntime>,
    versions: Vec<KubernetesVersion>,
    dual_stack: bool,
    operating_system_manager: bool,
    datacenters: BTreeMap<CloudProvider, String>,
}

impl Generator {
    /// Create an empty generator; every dimension must be populated before
    /// [`Generator::generate`] is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the given cloud providers
    pub fn with_providers(mut self, providers: impl IntoIterator<Item = CloudProvider>) -> Self {
        self.providers.extend(providers);
        self
    }

    /// Enable the given operating systems
    pub fn with_operating_systems(
        mut self,
        systems: impl IntoIterator<Item = OperatingSystem>,
    ) -> Self {
        self.operating_systems.extend(systems);
        self
    }

    /// Enable the given container runtimes
    pub fn with_container_runtimes(
        mut self,
        runtimes: impl IntoIterator<Item = ContainerRuntime>,
    ) -> Self {
        self.container_runtimes.extend(runtimes);
        self
    }

    /// Enable the given Kubernetes versions
    pub fn with_versions(mut self, versions: impl IntoIterator<Item = KubernetesVersion>) -> Self {
        self.versions.extend(versions);
        self
    }

    /// Toggle dual-stack networking for all generated scenarios
    pub fn with_dual_stack(mut self, enabled: bool) -> Self {
        self.dual_stack = enabled;
        self
    }

    /// Toggle the operating-system-manager feature; OSes it cannot manage
    /// are excluded from the matrix while it is on.
    pub fn with_operating_system_manager(mut self, enabled: bool) -> Self {
        self.operating_system_manager = enabled;
        self
    }

    /// Override the datacenter a provider schedules clusters into
    pub fn with_datacenter(mut self, provider: CloudProvider, datacenter: impl Into<String>) -> Self {
        self.datacenters.insert(provider, datacenter.into());
        self
    }

    /// Expand, filter and shuffle the scenario matrix.
    ///
    /// An empty result after filtering is a configuration error: silently
    /// testing nothing must never look like a passing run.
    pub fn generate(&self) -> Result<Vec<Scenario>, Error> {
        if self.providers.is_empty() {
            return Err(Error::config("no cloud providers enabled"));
        }
        if self.operating_systems.is_empty() {
            return Err(Error::config("no operating systems enabled"));
        }
        if self.container_runtimes.is_empty() {
            return Err(Error::config("no container runtimes enabled"));
        }
        if self.versions.is_empty() {
            return Err(Error::config("no Kubernetes versions enabled"));
        }

        let mut scenarios = Vec::new();
        for &version in &self.versions {
            for &provider in &self.providers {
                for &os in &self.operating_systems {
                    for &runtime in &self.container_runtimes {
                        let candidate = Scenario {
                            provider,
                            operating_system: os,
                            container_runtime: runtime,
                            version,
                            dual_stack: self.dual_stack,
                            datacenter: self.datacenter_for(provider),
                        };
                        if self.is_compatible(&candidate) {
                            scenarios.push(candidate);
                        }
                    }
                }
            }
        }

        if scenarios.is_empty() {
            return Err(Error::NoScenarios);
        }

        info!(count = scenarios.len(), "Generated scenario matrix");
        Ok(shuffle(scenarios))
    }

    fn datacenter_for(&self, provider: CloudProvider) -> String {
        self.datacenters
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| format!("{provider}-default"))
    }

    /// Pure compatibility filter over one candidate
    fn is_compatible(&self, candidate: &Scenario) -> bool {
        if !candidate.provider.supports_os(candidate.operating_system) {
            return false;
        }

        // Runtimes removed from Kubernetes cannot run clusters at or above
        // their removal release.
        if let Some(removed_in) = candidate.container_runtime.removed_in() {
            if candidate.version >= removed_in {
                return false;
            }
        }

        // SLES is the odd one out: AWS only, docker only.
        if candidate.operating_system == OperatingSystem::Sles
            && (candidate.provider != CloudProvider::Aws
                || candidate.container_runtime != ContainerRuntime::Docker)
        {
            return false;
        }

        // The operating-system-manager has no SLES support.
        if self.operating_system_manager && candidate.operating_system == OperatingSystem::Sles {
            return false;
        }

        true
    }
}

/// Shuffle scenarios with a time-seeded source.
///
/// Scenarios for one provider sit adjacent in the expanded matrix; without
/// shuffling, parallel workers would hit the same cloud account at once and
/// trip quota limits.
fn shuffle(mut scenarios: Vec<Scenario>) -> Vec<Scenario> {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    scenarios.shuffle(&mut StdRng::seed_from_u64(seed));
    scenarios
}

/// Drop scenarios that already passed in a previous run, as recorded in a
/// results-status file.
///
/// If the recorded configuration no longer matches the current one the
/// previous results are disregarded with a warning, because a pass under
/// different settings proves nothing about this run.
pub fn keep_only_failed(
    scenarios: Vec<Scenario>,
    previous: &ResultsFile,
    current_config: &crate::runner::results::TestConfiguration,
) -> Vec<Scenario> {
    if &previous.configuration != current_config {
        warn!("Disregarding previous test results: options do not match the previous run");
        return scenarios;
    }

    scenarios
        .into_iter()
        .filter(|scenario| {
            let passed = previous
                .results
                .iter()
                .any(|r| r.scenario == scenario.name() && r.status == ScenarioStatus::Passed);
            if passed {
                info!(scenario = %scenario.name(), "Skipping, scenario passed in a previous run");
            }
            !passed
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::results::{ResultsFile, ScenarioRecord, TestConfiguration};

    fn versions(specs: &[&str]) -> Vec<KubernetesVersion> {
        specs.iter().map(|s| s.parse().unwrap()).collect()
    }

    // ==========================================================================
    // Story: Matrix Expansion and Filtering
    // ==========================================================================

    #[test]
    fn single_combination_yields_one_deterministically_named_scenario() {
        let scenarios = Generator::new()
            .with_providers([CloudProvider::Aws])
            .with_operating_systems([OperatingSystem::Ubuntu])
            .with_container_runtimes([ContainerRuntime::Containerd])
            .with_versions(versions(&["1.30"]))
            .generate()
            .unwrap();

        assert_eq!(scenarios.len(), 1);
        assert_eq!(scenarios[0].name(), "aws-ubuntu-containerd-1.30");
    }

    #[test]
    fn output_count_is_product_minus_filtered_combinations() {
        // 2 providers x 2 OSes x 1 runtime x 2 versions = 8 candidates.
        // GCP supports only ubuntu, which removes 2 (gcp+centos per version).
        let scenarios = Generator::new()
            .with_providers([CloudProvider::Aws, CloudProvider::Gcp])
            .with_operating_systems([OperatingSystem::Ubuntu, OperatingSystem::Centos])
            .with_container_runtimes([ContainerRuntime::Containerd])
            .with_versions(versions(&["1.30", "1.31"]))
            .generate()
            .unwrap();

        assert_eq!(scenarios.len(), 6);

        let names: BTreeSet<String> = scenarios.iter().map(Scenario::name).collect();
        assert_eq!(names.len(), 6, "names must be unique");
        assert!(!names.iter().any(|n| n.contains("gcp-centos")));
    }

    #[test]
    fn docker_is_filtered_at_and_above_its_removal_release() {
        let scenarios = Generator::new()
            .with_providers([CloudProvider::Aws])
            .with_operating_systems([OperatingSystem::Ubuntu])
            .with_container_runtimes([ContainerRuntime::Containerd, ContainerRuntime::Docker])
            .with_versions(versions(&["1.23", "1.24", "1.30"]))
            .generate()
            .unwrap();

        let names: Vec<String> = scenarios.iter().map(Scenario::name).collect();
        assert!(names.contains(&"aws-ubuntu-docker-1.23".to_string()));
        assert!(!names.iter().any(|n| n.contains("docker-1.24")));
        assert!(!names.iter().any(|n| n.contains("docker-1.30")));
        // containerd is unaffected
        assert!(names.contains(&"aws-ubuntu-containerd-1.30".to_string()));
    }

    #[test]
    fn sles_only_exists_on_aws_with_docker() {
        let scenarios = Generator::new()
            .with_providers([CloudProvider::Aws, CloudProvider::Openstack])
            .with_operating_systems([OperatingSystem::Sles])
            .with_container_runtimes([ContainerRuntime::Containerd, ContainerRuntime::Docker])
            .with_versions(versions(&["1.23"]))
            .generate()
            .unwrap();

        let names: Vec<String> = scenarios.iter().map(Scenario::name).collect();
        assert_eq!(names, vec!["aws-sles-docker-1.23".to_string()]);
    }

    #[test]
    fn operating_system_manager_excludes_unmanaged_oses() {
        let result = Generator::new()
            .with_providers([CloudProvider::Aws])
            .with_operating_systems([OperatingSystem::Sles])
            .with_container_runtimes([ContainerRuntime::Docker])
            .with_versions(versions(&["1.23"]))
            .with_operating_system_manager(true)
            .generate();

        assert!(matches!(result, Err(Error::NoScenarios)));
    }

    #[test]
    fn empty_matrix_after_filtering_is_a_configuration_error() {
        // gcp never supports flatcar, so nothing survives
        let result = Generator::new()
            .with_providers([CloudProvider::Gcp])
            .with_operating_systems([OperatingSystem::Flatcar])
            .with_container_runtimes([ContainerRuntime::Containerd])
            .with_versions(versions(&["1.30"]))
            .generate();

        assert!(matches!(result, Err(Error::NoScenarios)));
    }

    #[test]
    fn missing_dimension_is_reported_before_expansion() {
        let result = Generator::new()
            .with_operating_systems([OperatingSystem::Ubuntu])
            .with_container_runtimes([ContainerRuntime::Containerd])
            .with_versions(versions(&["1.30"]))
            .generate();

        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn dual_stack_and_datacenter_land_on_every_scenario() {
        let scenarios = Generator::new()
            .with_providers([CloudProvider::Aws])
            .with_operating_systems([OperatingSystem::Ubuntu])
            .with_container_runtimes([ContainerRuntime::Containerd])
            .with_versions(versions(&["1.30"]))
            .with_dual_stack(true)
            .with_datacenter(CloudProvider::Aws, "aws-eu-central-1a")
            .generate()
            .unwrap();

        assert!(scenarios[0].dual_stack);
        assert_eq!(scenarios[0].datacenter, "aws-eu-central-1a");
        assert_eq!(scenarios[0].name(), "aws-ubuntu-containerd-1.30-dualstack");
    }

    // ==========================================================================
    // Story: Shuffling
    // ==========================================================================

    #[test]
    fn shuffle_is_a_permutation_of_the_filtered_matrix() {
        let generator = Generator::new()
            .with_providers([CloudProvider::Aws, CloudProvider::Azure, CloudProvider::Openstack])
            .with_operating_systems([OperatingSystem::Ubuntu, OperatingSystem::Flatcar])
            .with_container_runtimes([ContainerRuntime::Containerd])
            .with_versions(versions(&["1.29", "1.30", "1.31"]));

        let first = generator.generate().unwrap();
        let second = generator.generate().unwrap();

        let mut first_names: Vec<String> = first.iter().map(Scenario::name).collect();
        let mut second_names: Vec<String> = second.iter().map(Scenario::name).collect();
        first_names.sort();
        second_names.sort();
        assert_eq!(first_names, second_names);
    }

    // ==========================================================================
    // Story: Retrying Only Failed Scenarios
    // ==========================================================================

    fn previous_run(records: Vec<ScenarioRecord>) -> ResultsFile {
        ResultsFile {
            results: records,
            ..ResultsFile::default()
        }
    }

    #[test]
    fn previously_passed_scenarios_are_dropped() {
        let scenarios = Generator::new()
            .with_providers([CloudProvider::Aws])
            .with_operating_systems([OperatingSystem::Ubuntu, OperatingSystem::Flatcar])
            .with_container_runtimes([ContainerRuntime::Containerd])
            .with_versions(versions(&["1.30"]))
            .generate()
            .unwrap();

        let previous = previous_run(vec![
            ScenarioRecord {
                scenario: "aws-ubuntu-containerd-1.30".to_string(),
                status: ScenarioStatus::Passed,
                message: String::new(),
            },
            ScenarioRecord {
                scenario: "aws-flatcar-containerd-1.30".to_string(),
                status: ScenarioStatus::Failed,
                message: "node never joined".to_string(),
            },
        ]);

        let filtered = keep_only_failed(scenarios, &previous, &TestConfiguration::default());
        let names: Vec<String> = filtered.iter().map(Scenario::name).collect();
        assert_eq!(names, vec!["aws-flatcar-containerd-1.30".to_string()]);
    }

    #[test]
    fn changed_configuration_disregards_previous_results() {
        let scenarios = Generator::new()
            .with_providers([CloudProvider::Aws])
            .with_operating_systems([OperatingSystem::Ubuntu])
            .with_container_runtimes([ContainerRuntime::Containerd])
            .with_versions(versions(&["1.30"]))
            .generate()
            .unwrap();

        let previous = previous_run(vec![ScenarioRecord {
            scenario: "aws-ubuntu-containerd-1.30".to_string(),
            status: ScenarioStatus::Passed,
            message: String::new(),
        }]);

        let changed = TestConfiguration {
            dual_stack: true,
            ..TestConfiguration::default()
        };

        let filtered = keep_only_failed(scenarios.clone(), &previous, &changed);
        assert_eq!(filtered.len(), scenarios.len());
    }
}
