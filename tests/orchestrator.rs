//! End-to-end orchestrator tests against stubbed provisioners
//!
//! These tests tell the story of a whole run without any cloud behind it:
//! the worker pool takes a scenario set, drives every scenario through its
//! lifecycle against in-memory provisioner stubs, and produces exactly one
//! result per scenario - pass, fail and teardown behavior included.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use konform::checks::{Check, CheckContext};
use konform::error::Error;
use konform::metrics::MetricsSink;
use konform::provision::{
    ClusterHandle, ClusterInspector, ClusterProvisioner, MachineProvisioner, UnreadyPod,
    UserCluster,
};
use konform::runner::executor::{Executor, ExecutorOptions};
use konform::runner::results::ScenarioStatus;
use konform::runner::TestRunner;
use konform::scenario::generator::Generator;
use konform::scenario::{
    CloudProvider, ClusterSpec, ContainerRuntime, MachineSpec, OperatingSystem, Scenario,
};

/// In-memory provisioner: clusters materialize instantly, deletion succeeds
/// on the second existence probe, and every interaction is counted so tests
/// can assert on what actually happened.
#[derive(Default)]
struct StubProvisioner {
    fail_create: bool,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    teardown_probes: AtomicUsize,
}

#[async_trait]
impl ClusterProvisioner for StubProvisioner {
    async fn create_cluster(&self, name: &str, _spec: &ClusterSpec) -> Result<ClusterHandle, Error> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Err(Error::provisioning("instance quota exceeded"));
        }
        Ok(ClusterHandle {
            name: name.to_string(),
            namespace: format!("cluster-{name}"),
            platform_version: "2.27.0".to_string(),
        })
    }

    async fn delete_cluster(&self, _name: &str) -> Result<(), Error> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_clusters(&self) -> Result<Vec<String>, Error> {
        Ok(vec![])
    }

    async fn cluster_exists(&self, _name: &str) -> Result<bool, Error> {
        // First probe sees the cluster, the next sees it gone; exercises the
        // delete-then-poll loop without waiting.
        Ok(self.teardown_probes.fetch_add(1, Ordering::SeqCst) % 2 == 0 && !self.fail_create)
    }

    async fn missing_conditions(&self, _cluster: &ClusterHandle) -> Result<Vec<String>, Error> {
        Ok(vec![])
    }

    async fn unready_control_plane_pods(
        &self,
        _cluster: &ClusterHandle,
    ) -> Result<Vec<String>, Error> {
        Ok(vec![])
    }

    async fn connect(&self, _cluster: &ClusterHandle) -> Result<UserCluster, Error> {
        Ok(UserCluster::detached())
    }

    async fn create_project(&self, name: &str) -> Result<String, Error> {
        Ok(name.to_string())
    }

    async fn delete_project(&self, _id: &str) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Default)]
struct StubMachines;

#[async_trait]
impl MachineProvisioner for StubMachines {
    async fn existing_replicas(&self, _user: &UserCluster) -> Result<u32, Error> {
        Ok(0)
    }

    async fn create_machines(&self, _user: &UserCluster, spec: &MachineSpec) -> Result<(), Error> {
        assert!(spec.replicas > 0);
        Ok(())
    }

    async fn machines_without_node(&self, _user: &UserCluster) -> Result<Vec<String>, Error> {
        Ok(vec![])
    }

    async fn unready_nodes(&self, _user: &UserCluster) -> Result<Vec<String>, Error> {
        Ok(vec![])
    }
}

#[derive(Default)]
struct StubInspector;

#[async_trait]
impl ClusterInspector for StubInspector {
    async fn unready_pods(&self, _user: &UserCluster) -> Result<Vec<UnreadyPod>, Error> {
        Ok(vec![])
    }

    async fn unreconciled_addons(&self, _cluster: &ClusterHandle) -> Result<Vec<String>, Error> {
        Ok(vec![])
    }
}

struct PassingCheck;

#[async_trait]
impl Check for PassingCheck {
    fn name(&self) -> String {
        "smoke".to_string()
    }

    async fn run(&self, _ctx: &CheckContext, _attempt: u32) -> Result<(), Error> {
        Ok(())
    }
}

struct FailingCheck;

#[async_trait]
impl Check for FailingCheck {
    fn name(&self) -> String {
        "rbac".to_string()
    }

    async fn run(&self, _ctx: &CheckContext, _attempt: u32) -> Result<(), Error> {
        Err(Error::CheckFailed {
            check: "rbac".to_string(),
            message: "cluster role binding missing".to_string(),
        })
    }
}

fn single_scenario() -> Scenario {
    let scenarios = Generator::new()
        .with_providers([CloudProvider::Aws])
        .with_operating_systems([OperatingSystem::Ubuntu])
        .with_container_runtimes([ContainerRuntime::Containerd])
        .with_versions(["1.30".parse().unwrap()])
        .generate()
        .expect("single combination generates");
    assert_eq!(scenarios.len(), 1);
    assert_eq!(scenarios[0].name(), "aws-ubuntu-containerd-1.30");
    scenarios.into_iter().next().unwrap()
}

fn executor(
    provisioner: Arc<StubProvisioner>,
    checks: Vec<Arc<dyn Check>>,
    reports_root: std::path::PathBuf,
) -> Executor {
    Executor::new(
        provisioner,
        Arc::new(StubMachines),
        Arc::new(StubInspector),
        checks,
        Arc::new(MetricsSink::disabled()),
        ExecutorOptions {
            reports_root,
            poll_interval: Duration::from_millis(10),
            ..ExecutorOptions::default()
        },
    )
}

// =============================================================================
// Story: A Healthy Cluster Passes
// =============================================================================

#[tokio::test]
async fn happy_path_scenario_passes_with_clean_report() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(StubProvisioner::default());
    let executor = executor(
        provisioner.clone(),
        vec![Arc::new(PassingCheck)],
        dir.path().into(),
    );

    let result = executor
        .execute_scenario(&single_scenario(), &CancellationToken::new())
        .await;

    assert_eq!(result.status, ScenarioStatus::Passed);
    assert_eq!(result.report.tests, 1, "only check outcomes count as tests");
    assert_eq!(result.report.failures, 0);
    assert_eq!(result.platform_version, "2.27.0");
    assert!(result
        .cluster_name
        .as_deref()
        .unwrap()
        .starts_with("aws-ubuntu-containerd-1.30-"));

    // The check executed and landed in the report
    let smoke = result
        .report
        .test_cases
        .iter()
        .find(|c| c.name == "smoke")
        .expect("check case recorded");
    assert!(!smoke.is_failure());
    assert!(!smoke.skipped);

    // The JUnit report was written under the deterministic scenario name
    let junit = dir.path().join("junit.aws-ubuntu-containerd-1.30.xml");
    assert!(junit.exists());
    assert!(
        provisioner.delete_calls.load(Ordering::SeqCst) >= 1,
        "the cluster was torn down after testing"
    );
}

// =============================================================================
// Story: Provisioning Failure Still Tears Down
// =============================================================================

#[tokio::test]
async fn create_failure_fails_scenario_and_still_invokes_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(StubProvisioner {
        fail_create: true,
        ..StubProvisioner::default()
    });
    let executor = executor(
        provisioner.clone(),
        vec![Arc::new(PassingCheck)],
        dir.path().into(),
    );

    let result = executor
        .execute_scenario(&single_scenario(), &CancellationToken::new())
        .await;

    assert_eq!(result.status, ScenarioStatus::Failed);
    assert!(result.message.contains("quota exceeded"));
    assert!(
        provisioner.teardown_probes.load(Ordering::SeqCst) > 0,
        "teardown ran even though provisioning failed"
    );
    // No check ran on the unprovisioned cluster
    assert!(result.report.test_cases.iter().all(|c| c.name != "smoke"));
}

// =============================================================================
// Story: Check Failures Are Recorded, Not Fatal to the Run
// =============================================================================

#[tokio::test(start_paused = true)]
async fn failing_check_fails_the_scenario_but_other_checks_still_run() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(StubProvisioner::default());
    let executor = executor(
        provisioner.clone(),
        vec![Arc::new(FailingCheck), Arc::new(PassingCheck)],
        dir.path().into(),
    );

    let result = executor
        .execute_scenario(&single_scenario(), &CancellationToken::new())
        .await;

    assert_eq!(result.status, ScenarioStatus::Failed);
    assert_eq!(result.report.tests, 2, "one case per executed check");
    assert_eq!(result.report.failures, 1);

    let smoke = result
        .report
        .test_cases
        .iter()
        .find(|c| c.name == "smoke")
        .expect("sibling check still ran");
    assert!(!smoke.is_failure());

    // Teardown ran despite the failure
    assert!(provisioner.teardown_probes.load(Ordering::SeqCst) > 0);
}

// =============================================================================
// Story: Validation Skips Land in the Tally
// =============================================================================

#[tokio::test]
async fn disabled_operating_system_is_skipped_without_provisioning() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(StubProvisioner::default());
    let executor = Executor::new(
        provisioner.clone(),
        Arc::new(StubMachines),
        Arc::new(StubInspector),
        vec![Arc::new(PassingCheck)],
        Arc::new(MetricsSink::disabled()),
        ExecutorOptions {
            reports_root: dir.path().into(),
            enabled_operating_systems: [OperatingSystem::Flatcar].into(),
            poll_interval: Duration::from_millis(10),
            ..ExecutorOptions::default()
        },
    );

    let result = executor
        .execute_scenario(&single_scenario(), &CancellationToken::new())
        .await;

    assert_eq!(result.status, ScenarioStatus::Skipped);
    assert!(result.message.contains("not currently enabled"));
    assert_eq!(provisioner.create_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        provisioner.teardown_probes.load(Ordering::SeqCst),
        0,
        "nothing to tear down for a skipped scenario"
    );
}

#[tokio::test]
async fn dual_stack_on_unsupported_provider_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(StubProvisioner::default());
    let executor = executor(provisioner.clone(), vec![], dir.path().into());

    let scenarios = Generator::new()
        .with_providers([CloudProvider::Hetzner])
        .with_operating_systems([OperatingSystem::Ubuntu])
        .with_container_runtimes([ContainerRuntime::Containerd])
        .with_versions(["1.30".parse().unwrap()])
        .with_dual_stack(true)
        .generate()
        .unwrap();

    let result = executor
        .execute_scenario(&scenarios[0], &CancellationToken::new())
        .await;

    assert_eq!(result.status, ScenarioStatus::Skipped);
    assert!(result.message.contains("dual-stack"));
}

// =============================================================================
// Story: The Pool Drains the Whole Set
// =============================================================================

#[tokio::test]
async fn two_scenarios_with_parallelism_one_both_complete_in_some_order() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(StubProvisioner::default());
    let executor = executor(
        provisioner.clone(),
        vec![Arc::new(PassingCheck)],
        dir.path().into(),
    );
    let runner = TestRunner::new(Arc::new(executor), 1);

    let scenarios = Generator::new()
        .with_providers([CloudProvider::Aws])
        .with_operating_systems([OperatingSystem::Ubuntu, OperatingSystem::Flatcar])
        .with_container_runtimes([ContainerRuntime::Containerd])
        .with_versions(["1.30".parse().unwrap()])
        .generate()
        .unwrap();
    assert_eq!(scenarios.len(), 2);

    let results = runner.run(scenarios, &CancellationToken::new()).await;

    assert_eq!(results.len(), 2, "no result lost");
    let names: BTreeSet<&str> = results.iter().map(|r| r.scenario_name.as_str()).collect();
    assert_eq!(
        names,
        ["aws-flatcar-containerd-1.30", "aws-ubuntu-containerd-1.30"]
            .into_iter()
            .collect()
    );
    assert!(results.iter().all(|r| r.status == ScenarioStatus::Passed));
    assert_eq!(provisioner.create_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn mixed_outcomes_all_reach_the_tally() {
    let dir = tempfile::tempdir().unwrap();

    // The Centos scenario is disabled at execution time and must surface as
    // a skip in the tally; the other two pass.
    let provisioner = Arc::new(StubProvisioner::default());
    let executor = Executor::new(
        provisioner.clone(),
        Arc::new(StubMachines),
        Arc::new(StubInspector),
        vec![Arc::new(PassingCheck)],
        Arc::new(MetricsSink::disabled()),
        ExecutorOptions {
            reports_root: dir.path().into(),
            enabled_operating_systems: [OperatingSystem::Ubuntu, OperatingSystem::Flatcar].into(),
            poll_interval: Duration::from_millis(10),
            ..ExecutorOptions::default()
        },
    );
    let runner = TestRunner::new(Arc::new(executor), 2);

    let scenarios = Generator::new()
        .with_providers([CloudProvider::Aws])
        .with_operating_systems([
            OperatingSystem::Ubuntu,
            OperatingSystem::Flatcar,
            OperatingSystem::Centos,
        ])
        .with_container_runtimes([ContainerRuntime::Containerd])
        .with_versions(["1.30".parse().unwrap()])
        .generate()
        .unwrap();

    let results = runner.run(scenarios, &CancellationToken::new()).await;

    assert_eq!(results.len(), 3);
    let skipped = results
        .iter()
        .filter(|r| r.status == ScenarioStatus::Skipped)
        .count();
    let passed = results
        .iter()
        .filter(|r| r.status == ScenarioStatus::Passed)
        .count();
    assert_eq!(skipped, 1, "the disabled OS shows up as a skip, not silence");
    assert_eq!(passed, 2);
}
