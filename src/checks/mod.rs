//! Pluggable conformance checks
//!
//! A [`Check`] probes one behavior of a provisioned cluster. Checks run in
//! order, independently and best-effort: a failing check is recorded as a
//! failed test case and its siblings still run, because partial signal is
//! the point of a smoke-test battery. Checks declaring a capability are
//! skipped on providers that lack it.

pub mod workload;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Error;
use crate::metrics::MetricsSink;
use crate::provision::{ClusterHandle, UserCluster};
use crate::report::{TestCase, TestReport};
use crate::retry::measured_retry_n_attempts;
use crate::scenario::Scenario;

/// Checks that failed hard are retried this many times
const MAX_CHECK_ATTEMPTS: u32 = 3;

/// Provider capability a check depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// No special capability needed
    None,
    /// Dynamic volume provisioning
    Storage,
    /// Services of type LoadBalancer
    LoadBalancers,
}

/// Everything a check may need about the cluster under test
#[derive(Debug, Clone)]
pub struct CheckContext {
    /// The scenario being exercised
    pub scenario: Scenario,
    /// Handle to the provisioned cluster
    pub cluster: ClusterHandle,
    /// Live user cluster
    pub user: UserCluster,
    /// Per-check timeout
    pub timeout: Duration,
    /// Run-level cancellation signal
    pub cancel: CancellationToken,
}

/// One conformance check
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Check: Send + Sync {
    /// Stable check name; doubles as the test case name
    fn name(&self) -> String;

    /// Capability this check needs from the provider
    fn required_capability(&self) -> Capability {
        Capability::None
    }

    /// Run the check once. `attempt` starts at 1 and grows on retries.
    async fn run(&self, ctx: &CheckContext, attempt: u32) -> Result<(), Error>;
}

/// Build the default check battery, minus the excluded names
pub fn default_checks(excluded: &BTreeSet<String>) -> Vec<Arc<dyn Check>> {
    let all: Vec<Arc<dyn Check>> = vec![
        Arc::new(workload::StorageCheck),
        Arc::new(workload::LoadBalancerCheck),
    ];

    all.into_iter()
        .filter(|check| !excluded.contains(&check.name()))
        .collect()
}

fn provider_has(scenario: &Scenario, capability: Capability) -> bool {
    match capability {
        Capability::None => true,
        Capability::Storage => scenario.provider.supports_storage(),
        Capability::LoadBalancers => scenario.provider.supports_load_balancers(),
    }
}

/// Run the check battery against one cluster.
///
/// Each check becomes one test case in `report`: executed checks carry their
/// duration and failure message, capability-gated checks are recorded as
/// skipped. Failures never abort the remaining checks.
pub async fn run_checks(
    checks: &[Arc<dyn Check>],
    ctx: &CheckContext,
    report: &mut TestReport,
    sink: &MetricsSink,
) {
    for check in checks {
        let name = check.name();

        if !provider_has(&ctx.scenario, check.required_capability()) {
            info!(check = %name, provider = %ctx.scenario.provider, "Skipping check, provider lacks capability");
            report.test_cases.push(TestCase {
                name: name.clone(),
                class_name: "conformance".to_string(),
                duration: Duration::ZERO,
                failure_message: None,
                skipped: true,
            });
            continue;
        }

        let started = std::time::Instant::now();
        let result = measured_retry_n_attempts(sink, &name, MAX_CHECK_ATTEMPTS, |attempt| {
            check.run(ctx, attempt)
        })
        .await;

        let mut case = TestCase {
            name: name.clone(),
            class_name: "conformance".to_string(),
            duration: started.elapsed(),
            failure_message: None,
            skipped: false,
        };

        if let Err(err) = result {
            warn!(check = %name, error = %err, "Check failed");
            case.failure_message = Some(err.to_string());
            report.failures += 1;
        }

        report.test_cases.push(case);
        report.tests += 1;
    }
}
