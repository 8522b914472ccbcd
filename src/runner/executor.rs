//! Per-scenario lifecycle execution
//!
//! One worker drives one scenario through its phases strictly sequentially:
//! validate, provision, a chain of budget-sharing waits, the check battery,
//! and teardown. A failure in any phase after provisioning still reaches
//! teardown, and every error on the way is folded into one aggregate so a
//! check failure never hides a teardown failure.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::distributions::Slice;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checks::{run_checks, Check, CheckContext};
use crate::error::{AggregateError, Error};
use crate::metrics::MetricsSink;
use crate::provision::{ClusterInspector, ClusterProvisioner, MachineProvisioner, UserCluster};
use crate::report::{xml, TestReport};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::runner::results::{ScenarioResult, ScenarioStatus};
use crate::scenario::{CloudProvider, OperatingSystem, Scenario};
use crate::wait::{poll, poll_with_budget, PollOutcome, RunBudget};

/// Timeouts and paths for scenario execution, resolved before the run
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Directory receiving one JUnit XML file per scenario
    pub reports_root: PathBuf,
    /// Prefix for generated cluster names
    pub name_prefix: String,
    /// Desired worker node count per cluster
    pub node_count: u32,
    /// Operating systems currently enabled; scenarios for others are skipped
    pub enabled_operating_systems: BTreeSet<OperatingSystem>,
    /// Deadline for the reconciliation wait
    pub reconciliation_timeout: Duration,
    /// Deadline for the control-plane wait
    pub control_plane_timeout: Duration,
    /// Shared budget for the node and workload waits
    pub node_ready_timeout: Duration,
    /// Per-check timeout
    pub check_timeout: Duration,
    /// Poll interval for user-cluster conditions
    pub poll_interval: Duration,
    /// Deadline for cluster deletion
    pub delete_timeout: Duration,
    /// Whether to tear clusters down after testing
    pub delete_cluster_after_tests: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            reports_root: PathBuf::from("/opt/reports"),
            name_prefix: String::new(),
            node_count: 3,
            enabled_operating_systems: OperatingSystem::all().iter().copied().collect(),
            reconciliation_timeout: Duration::from_secs(5 * 60),
            control_plane_timeout: Duration::from_secs(10 * 60),
            node_ready_timeout: Duration::from_secs(20 * 60),
            check_timeout: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(5),
            delete_timeout: Duration::from_secs(15 * 60),
            delete_cluster_after_tests: true,
        }
    }
}

/// Drives single scenarios through their lifecycle; shared by all workers
pub struct Executor {
    provisioner: Arc<dyn ClusterProvisioner>,
    machines: Arc<dyn MachineProvisioner>,
    inspector: Arc<dyn ClusterInspector>,
    checks: Vec<Arc<dyn Check>>,
    metrics: Arc<MetricsSink>,
    opts: ExecutorOptions,
}

impl Executor {
    /// Create an executor over the given collaborators
    pub fn new(
        provisioner: Arc<dyn ClusterProvisioner>,
        machines: Arc<dyn MachineProvisioner>,
        inspector: Arc<dyn ClusterInspector>,
        checks: Vec<Arc<dyn Check>>,
        metrics: Arc<MetricsSink>,
        opts: ExecutorOptions,
    ) -> Self {
        Self {
            provisioner,
            machines,
            inspector,
            checks,
            metrics,
            opts,
        }
    }

    /// Run one scenario start to finish and produce its result.
    ///
    /// Never panics and never returns early without a result; the worker
    /// loop depends on exactly one result per scenario.
    pub async fn execute_scenario(
        &self,
        scenario: &Scenario,
        cancel: &CancellationToken,
    ) -> ScenarioResult {
        let scenario_name = scenario.name();
        let started = Instant::now();
        let mut report = TestReport::new(&scenario_name);

        // Validation runs lazily at dequeue time so skip reasons land in the
        // final tally next to executed scenarios.
        if let Err(reason) = self.validate(scenario) {
            info!(scenario = %scenario_name, reason = %reason, "Skipping scenario");
            self.write_report(&mut report, started);
            return ScenarioResult {
                scenario_name,
                status: ScenarioStatus::Skipped,
                message: reason,
                duration: started.elapsed(),
                cluster_name: None,
                platform_version: String::new(),
                report,
            };
        }

        let mut aggregate = AggregateError::new();
        let cluster_name = self.generate_cluster_name(&scenario_name);
        let mut platform_version = String::new();

        info!(scenario = %scenario_name, cluster = %cluster_name, "Creating cluster");
        let provisioned = aggregate.record(
            self.provisioner
                .create_cluster(&cluster_name, &scenario.cluster_spec())
                .await,
        );
        self.record_phase(&scenario_name, "create cluster", started);

        if let Some(cluster) = &provisioned {
            platform_version = cluster.platform_version.clone();

            if let Err(err) = self
                .run_cluster_phases(scenario, cluster, cancel, &mut report)
                .await
            {
                if err.is_cancelled() {
                    info!(scenario = %scenario_name, "Cancelled, proceeding to teardown");
                }
                aggregate.push(err);
            }
        }

        // Teardown runs for provisioned and half-provisioned clusters alike,
        // on a context independent of the run-level cancellation.
        if self.opts.delete_cluster_after_tests {
            let phase_start = Instant::now();
            aggregate.record(self.teardown(&cluster_name, scenario.provider).await);
            self.record_phase(&scenario_name, "delete cluster", phase_start);
        }

        self.write_report(&mut report, started);
        self.metrics
            .record_scenario_runtime(&scenario_name, started.elapsed());

        let failed = !aggregate.is_empty() || report.failures > 0 || report.errors > 0;
        ScenarioResult {
            scenario_name,
            status: if failed {
                ScenarioStatus::Failed
            } else {
                ScenarioStatus::Passed
            },
            message: if aggregate.is_empty() {
                String::new()
            } else {
                aggregate.to_string()
            },
            duration: started.elapsed(),
            cluster_name: Some(cluster_name),
            platform_version,
            report,
        }
    }

    /// Static validation at dequeue time
    fn validate(&self, scenario: &Scenario) -> Result<(), String> {
        if !self
            .opts
            .enabled_operating_systems
            .contains(&scenario.operating_system)
        {
            return Err(format!(
                "operating system {} is not currently enabled",
                scenario.operating_system
            ));
        }
        if scenario.dual_stack && !scenario.provider.supports_dual_stack() {
            return Err(format!(
                "provider {} does not support dual-stack networking",
                scenario.provider
            ));
        }
        Ok(())
    }

    /// Phases 3 through 9; any error short-circuits to teardown
    async fn run_cluster_phases(
        &self,
        scenario: &Scenario,
        cluster: &crate::provision::ClusterHandle,
        cancel: &CancellationToken,
        report: &mut TestReport,
    ) -> Result<(), Error> {
        let scenario_name = scenario.name();

        info!(scenario = %scenario_name, "Waiting for successful reconciliation");
        let phase_start = Instant::now();
        poll(
            "reconciliation",
            self.opts.poll_interval,
            self.opts.reconciliation_timeout,
            cancel,
            || async move {
                match self.provisioner.missing_conditions(cluster).await {
                    Ok(missing) if missing.is_empty() => PollOutcome::Ready,
                    Ok(missing) => PollOutcome::Pending(Error::provisioning(format!(
                        "missing conditions: {}",
                        missing.join(", ")
                    ))),
                    Err(err) => PollOutcome::Pending(err),
                }
            },
        )
        .await?;
        self.record_phase(&scenario_name, "reconciliation", phase_start);

        info!(scenario = %scenario_name, "Waiting for control plane");
        let phase_start = Instant::now();
        poll(
            "control-plane",
            self.opts.poll_interval,
            self.opts.control_plane_timeout,
            cancel,
            || async move {
                match self.provisioner.unready_control_plane_pods(cluster).await {
                    Ok(unready) if unready.is_empty() => PollOutcome::Ready,
                    Ok(unready) => PollOutcome::Pending(Error::provisioning(format!(
                        "{} control plane pods not ready: {}",
                        unready.len(),
                        unready.join(", ")
                    ))),
                    Err(err) => PollOutcome::Pending(err),
                }
            },
        )
        .await?;
        self.record_phase(&scenario_name, "control-plane", phase_start);

        // The apiserver may refuse connections for a short while even after
        // its pods report ready; retry instead of failing the scenario.
        let user = retry_with_backoff(
            &RetryConfig {
                max_attempts: 15,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(1),
                backoff_multiplier: 1.0,
            },
            "connect to user cluster",
            || self.provisioner.connect(cluster),
        )
        .await?;
        let user_ref = &user;

        let phase_start = Instant::now();
        self.create_machines(scenario, user_ref).await?;
        self.record_phase(&scenario_name, "create machine deployment", phase_start);

        // One budget bounds the whole wait chain from here: each wait hands
        // its leftover time to the next instead of starting a fresh ceiling.
        let mut budget = RunBudget::new(self.opts.node_ready_timeout);
        if scenario.provider == CloudProvider::Packet {
            // Bare metal provisions real machines, not VMs
            budget = budget.extend(Duration::from_secs(5 * 60));
        }

        info!(scenario = %scenario_name, "Waiting for machines to get a node");
        let phase_start = Instant::now();
        budget = poll_with_budget(
            "machines-join",
            Duration::from_secs(10),
            budget,
            cancel,
            || async move {
                match self.machines.machines_without_node(user_ref).await {
                    Ok(pending) if pending.is_empty() => PollOutcome::Ready,
                    Ok(pending) => PollOutcome::Pending(Error::provisioning(format!(
                        "machines without node: {}",
                        pending.join(", ")
                    ))),
                    Err(err) => PollOutcome::Pending(err),
                }
            },
        )
        .await?;
        self.record_phase(&scenario_name, "machines-join", phase_start);

        info!(scenario = %scenario_name, "Waiting for nodes to be ready");
        let phase_start = Instant::now();
        budget = poll_with_budget(
            "nodes-ready",
            Duration::from_secs(10),
            budget,
            cancel,
            || async move {
                match self.machines.unready_nodes(user_ref).await {
                    Ok(unready) if unready.is_empty() => PollOutcome::Ready,
                    Ok(unready) => PollOutcome::Pending(Error::provisioning(format!(
                        "nodes not ready: {}",
                        unready.join(", ")
                    ))),
                    Err(err) => PollOutcome::Pending(err),
                }
            },
        )
        .await?;
        self.record_phase(&scenario_name, "nodes-ready", phase_start);

        info!(scenario = %scenario_name, "Waiting for pods to be ready");
        let phase_start = Instant::now();
        budget = poll_with_budget(
            "workloads-ready",
            self.opts.poll_interval,
            budget,
            cancel,
            || async move {
                match self.inspector.unready_pods(user_ref).await {
                    Ok(unready) => {
                        // Pods that lost the scheduler/kubelet affinity
                        // race never recover and must not block here.
                        let blocking: Vec<_> = unready
                            .iter()
                            .filter(|p| !p.failed_kubelet_admission())
                            .collect();
                        if blocking.is_empty() {
                            PollOutcome::Ready
                        } else {
                            PollOutcome::Pending(Error::provisioning(format!(
                                "{} pods not ready, first: {}/{}",
                                blocking.len(),
                                blocking[0].namespace,
                                blocking[0].name
                            )))
                        }
                    }
                    Err(err) => PollOutcome::Pending(err),
                }
            },
        )
        .await?;
        self.record_phase(&scenario_name, "workloads-ready", phase_start);

        info!(scenario = %scenario_name, "Waiting for addons to reconcile");
        let phase_start = Instant::now();
        poll_with_budget("addons", self.opts.poll_interval, budget, cancel, || async move {
            match self.inspector.unreconciled_addons(cluster).await {
                Ok(pending) if pending.is_empty() => PollOutcome::Ready,
                Ok(pending) => PollOutcome::Pending(Error::provisioning(format!(
                    "addons not reconciled: {}",
                    pending.join(", ")
                ))),
                Err(err) => PollOutcome::Pending(err),
            }
        })
        .await?;
        self.record_phase(&scenario_name, "addons", phase_start);

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let ctx = CheckContext {
            scenario: scenario.clone(),
            cluster: cluster.clone(),
            user,
            timeout: self.opts.check_timeout,
            cancel: cancel.clone(),
        };
        run_checks(&self.checks, &ctx, report, &self.metrics).await;

        Ok(())
    }

    /// Phase 5: diff existing replicas against the desired count and only
    /// ever scale up.
    async fn create_machines(&self, scenario: &Scenario, user: &UserCluster) -> Result<(), Error> {
        let existing = self.machines.existing_replicas(user).await?;
        if existing > self.opts.node_count {
            return Err(Error::provisioning(format!(
                "found {existing} existing replicas but want {}, scale-down is not supported",
                self.opts.node_count
            )));
        }
        let missing = self.opts.node_count - existing;
        if missing == 0 {
            info!("Desired node count already present");
            return Ok(());
        }

        // Spec construction resolves provider images and can transiently
        // fail; keep asking within a bounded window.
        let spec = retry_with_backoff(
            &RetryConfig {
                max_attempts: 6,
                initial_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(10),
                backoff_multiplier: 1.0,
            },
            "build machine spec",
            || async move { scenario.machine_spec(missing) },
        )
        .await?;

        self.machines.create_machines(user, &spec).await
    }

    /// Phase 10: poll-until-gone deletion on a cancellation-independent
    /// context, tolerant of finalizer races and repeated delete calls.
    async fn teardown(&self, cluster_name: &str, provider: CloudProvider) -> Result<(), Error> {
        let mut timeout = self.opts.delete_timeout;
        if provider == CloudProvider::Azure {
            // Azure routinely needs more than 15 minutes
            timeout += Duration::from_secs(15 * 60);
        }

        // Deliberately not a child of the run token: an interrupted run must
        // still clean up its cloud resources.
        let detached = CancellationToken::new();

        poll("cluster-gone", self.opts.poll_interval, timeout, &detached, || async move {
            match self.provisioner.cluster_exists(cluster_name).await {
                Ok(false) => PollOutcome::Ready,
                Ok(true) => {
                    if let Err(err) = self.provisioner.delete_cluster(cluster_name).await {
                        warn!(cluster = cluster_name, error = %err, "Delete call failed, will retry");
                    }
                    PollOutcome::Pending(Error::teardown("cluster object still present"))
                }
                Err(err) => PollOutcome::Pending(err),
            }
        })
        .await
        .map_err(|err| Error::teardown(format!("cluster {cluster_name}: {err}")))
    }

    fn generate_cluster_name(&self, scenario_name: &str) -> String {
        const CHARSET: &[char] = &[
            'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q',
            'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7',
            '8', '9',
        ];
        let sampler = Slice::new(CHARSET).expect("charset is non-empty");
        let suffix: String = rand::thread_rng().sample_iter(&sampler).take(8).collect();

        let mut name = String::new();
        if !self.opts.name_prefix.is_empty() {
            name.push_str(&self.opts.name_prefix);
            name.push('-');
        }
        name.push_str(scenario_name);
        name.push('-');
        name.push_str(&suffix);
        name
    }

    fn record_phase(&self, scenario: &str, phase: &str, started: Instant) {
        self.metrics
            .record_phase_runtime(scenario, phase, started.elapsed());
    }

    /// The JUnit report goes to disk unconditionally, failures included;
    /// the file name is derived from the scenario so workers never collide.
    fn write_report(&self, report: &mut TestReport, started: Instant) {
        report.duration = started.elapsed();
        let path = self
            .opts
            .reports_root
            .join(format!("junit.{}.xml", report.name));
        if let Err(err) = xml::write_report_file(report, &path) {
            warn!(path = %path.display(), error = %err, "Failed to write JUnit report");
        }
    }
}
