//! Scenario results and the results-status file
//!
//! Every scenario ends in exactly one [`ScenarioResult`]. The compact
//! per-scenario status also goes into a JSON results file together with the
//! configuration it was produced under, so a later invocation can retry only
//! what failed, and discard the file if the configuration changed.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::report::TestReport;

/// Final status of one scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScenarioStatus {
    /// All phases and checks succeeded
    Passed,
    /// A phase or check failed
    Failed,
    /// Validation rejected the scenario before provisioning
    Skipped,
}

/// The outcome of one scenario lifecycle, created exactly once by the worker
/// that owned the scenario
#[derive(Debug)]
pub struct ScenarioResult {
    /// Deterministic scenario name
    pub scenario_name: String,
    /// Final status
    pub status: ScenarioStatus,
    /// Failure or skip explanation; empty on success
    pub message: String,
    /// Wall-clock runtime of the whole lifecycle
    pub duration: Duration,
    /// Name of the provisioned cluster, if provisioning got that far
    pub cluster_name: Option<String>,
    /// Control-plane platform version, if reported
    pub platform_version: String,
    /// The scenario's merged test report
    pub report: TestReport,
}

impl ScenarioResult {
    /// Whether the scenario passed overall
    pub fn passed(&self) -> bool {
        self.status == ScenarioStatus::Passed
    }
}

/// The settings that shape results; recorded in the results file so stale
/// results are never reused under different settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestConfiguration {
    /// Dual-stack networking was enabled
    #[serde(default)]
    pub dual_stack: bool,
    /// The operating-system-manager was enabled
    #[serde(default)]
    pub operating_system_manager: bool,
    /// Names of the enabled checks, sorted
    #[serde(default)]
    pub checks: BTreeSet<String>,
}

/// One line of the results file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioRecord {
    /// Scenario name
    pub scenario: String,
    /// Recorded status
    pub status: ScenarioStatus,
    /// Failure or skip message
    #[serde(default)]
    pub message: String,
}

/// The persisted results-status file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsFile {
    /// Configuration the results were produced under
    pub configuration: TestConfiguration,
    /// One record per scenario
    pub results: Vec<ScenarioRecord>,
    /// When the file was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written_at: Option<DateTime<Utc>>,
}

impl ResultsFile {
    /// Build a results file from this run's outcomes
    pub fn from_results(configuration: TestConfiguration, results: &[ScenarioResult]) -> Self {
        Self {
            configuration,
            results: results
                .iter()
                .map(|r| ScenarioRecord {
                    scenario: r.scenario_name.clone(),
                    status: r.status,
                    message: r.message.clone(),
                })
                .collect(),
            written_at: Some(Utc::now()),
        }
    }

    /// Load a results file; a missing or empty file yields `None`
    pub fn load(path: &Path) -> Result<Option<Self>, Error> {
        match std::fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => Ok(None),
            Ok(content) => {
                let file = serde_json::from_str(&content)
                    .map_err(|e| Error::report(format!("invalid results file: {e}")))?;
                Ok(Some(file))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Write the file as pretty JSON
    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::report(format!("failed to serialize results file: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Merge the previous results file with this run's results.
///
/// Scenarios the current run did not execute (because they already passed
/// and were filtered out) keep their previous record; for re-executed
/// scenarios the new record wins. Without this, a retry-failed run would
/// shrink the file to just the retried scenarios.
pub fn merge_results(previous: &ResultsFile, current: &ResultsFile) -> ResultsFile {
    let mut merged = current.clone();

    for record in &previous.results {
        let rerun = merged.results.iter().any(|r| r.scenario == record.scenario);
        if !rerun {
            merged.results.push(record.clone());
        }
    }

    merged
}
