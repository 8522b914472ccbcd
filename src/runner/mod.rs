//! Scenario test runner
//!
//! A fixed pool of workers pulls scenarios from a shared queue, drives each
//! one through the [`executor`] lifecycle and pushes exactly one result per
//! scenario into a shared output queue. The two queues are the only state
//! workers share; a scenario and everything it owns stays with one worker
//! for its entire lifecycle.

pub mod executor;
pub mod results;

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::report::print_detailed_report;
use crate::runner::executor::Executor;
use crate::runner::results::{ScenarioResult, ScenarioStatus};
use crate::scenario::Scenario;

/// Final tally of one orchestrator run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTally {
    /// Scenarios that passed
    pub passed: usize,
    /// Scenarios that failed
    pub failed: usize,
    /// Scenarios skipped by validation
    pub skipped: usize,
}

impl RunTally {
    /// Whether any scenario failed
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Worker pool running scenarios with bounded parallelism
pub struct TestRunner {
    executor: Arc<Executor>,
    parallelism: usize,
}

impl TestRunner {
    /// Create a runner over the given executor with the given parallelism
    pub fn new(executor: Arc<Executor>, parallelism: usize) -> Self {
        Self {
            executor,
            parallelism: parallelism.max(1),
        }
    }

    /// Drain the whole scenario set and return one result per scenario.
    ///
    /// Workers execute scenarios strictly sequentially; completion order is
    /// independent of submission order and the returned order is completion
    /// order. Individual failures never abort the pool.
    pub async fn run(
        &self,
        scenarios: Vec<Scenario>,
        cancel: &CancellationToken,
    ) -> Vec<ScenarioResult> {
        let total = scenarios.len();
        info!(total, parallelism = self.parallelism, "Test suite:");
        for scenario in &scenarios {
            info!("  {}", scenario.name());
        }

        let (scenario_tx, scenario_rx) = mpsc::channel::<Scenario>(total.max(1));
        let (result_tx, mut result_rx) = mpsc::channel::<ScenarioResult>(total.max(1));

        for scenario in scenarios {
            // Capacity equals the scenario count, so this never blocks
            scenario_tx
                .send(scenario)
                .await
                .expect("scenario queue closed before the run started");
        }
        drop(scenario_tx);

        let scenario_rx = Arc::new(Mutex::new(scenario_rx));
        let mut workers = Vec::with_capacity(self.parallelism);
        for worker_id in 0..self.parallelism {
            let queue = scenario_rx.clone();
            let results = result_tx.clone();
            let executor = self.executor.clone();
            let cancel = cancel.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    // Hold the queue lock only for the dequeue, never across
                    // a scenario execution
                    let scenario = { queue.lock().await.recv().await };
                    let Some(scenario) = scenario else { break };

                    info!(worker = worker_id, scenario = %scenario.name(), "Starting to test scenario");
                    let result = executor.execute_scenario(&scenario, &cancel).await;
                    match result.status {
                        ScenarioStatus::Failed => {
                            warn!(worker = worker_id, scenario = %result.scenario_name, message = %result.message, "Finished with failure")
                        }
                        _ => info!(worker = worker_id, scenario = %result.scenario_name, "Finished"),
                    }

                    if results.send(result).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let mut collected = Vec::with_capacity(total);
        while let Some(result) = result_rx.recv().await {
            collected.push(result);
            info!("Finished {}/{} scenarios", collected.len(), total);
        }

        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "Worker task panicked");
            }
        }

        collected
    }
}

/// Print the per-scenario outcome lines and the final tally
pub fn print_summary(results: &[ScenarioResult]) -> RunTally {
    let mut tally = RunTally::default();
    let mut lines = String::new();

    for result in results {
        let prefix = match result.status {
            ScenarioStatus::Passed => {
                tally.passed += 1;
                "PASS"
            }
            ScenarioStatus::Failed => {
                tally.failed += 1;
                "FAIL"
            }
            ScenarioStatus::Skipped => {
                tally.skipped += 1;
                "SKIP"
            }
        };

        let mut line = format!("[{prefix}] - {}", result.scenario_name);
        if !result.message.is_empty() {
            line = format!("{line} : {}", result.message);
        }
        lines.push_str(&line);
        lines.push('\n');

        print_detailed_report(&result.report);
    }

    println!("========================== RESULT ===========================");
    print!("{lines}");
    println!(
        "Passed: {}, Failed: {}, Skipped: {}",
        tally.passed, tally.failed, tally.skipped
    );

    tally
}
