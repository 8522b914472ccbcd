//! JUnit-style test reports and the precedence-based merge
//!
//! Each scenario produces one [`TestReport`] whose [`TestCase`]s are the
//! outcomes of its conformance checks. Some test drivers shard work across
//! parallel sub-processes, each writing a partial report in which a case
//! executed by another shard shows up as skipped; [`merge_into`] folds those
//! partial reports with the rule that a real result always beats a skip
//! placeholder.

pub mod xml;

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::Error;

/// One merged JUnit-style test suite
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestReport {
    /// Suite name; the scenario name for scenario reports
    pub name: String,
    /// Total test counter as report consumers expect it (see [`merge_into`]
    /// for why this is not always a recount of the case list)
    pub tests: u32,
    /// Failure counter
    pub failures: u32,
    /// Error counter; additive across merges
    pub errors: u32,
    /// Wall-clock duration of the whole suite
    pub duration: Duration,
    /// Ordered list of cases, unique per (name, class_name)
    pub test_cases: Vec<TestCase>,
}

/// One executed (or skipped) test case
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    /// Case name; identity together with `class_name`
    pub name: String,
    /// Class name; identity together with `name`
    pub class_name: String,
    /// Case runtime
    pub duration: Duration,
    /// Failure message, if the case failed
    pub failure_message: Option<String>,
    /// Whether the case was skipped rather than executed
    pub skipped: bool,
}

impl TestCase {
    /// Whether this case carries a failure
    pub fn is_failure(&self) -> bool {
        self.failure_message.is_some()
    }
}

impl TestReport {
    /// Create an empty report with the given suite name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Whether the suite passed: at least one executed case and no
    /// failures or errors.
    pub fn passed(&self) -> bool {
        !self.test_cases.is_empty() && self.failures == 0 && self.errors == 0
    }

    /// Recount (tests, failures) from the final case list.
    ///
    /// The merge deliberately does not keep counters in sync with the case
    /// list (consumer compatibility); this recount exists for diagnostics
    /// and tests, nothing in the merge path calls it.
    pub fn recount(&self) -> (u32, u32) {
        let tests = self.test_cases.iter().filter(|c| !c.skipped).count() as u32;
        let failures = self.test_cases.iter().filter(|c| c.is_failure()).count() as u32;
        (tests, failures)
    }

    fn find_case_mut(&mut self, name: &str, class_name: &str) -> Option<&mut TestCase> {
        self.test_cases
            .iter_mut()
            .find(|c| c.name == name && c.class_name == class_name)
    }
}

/// Merge `incoming` into `merged` with skip-loses precedence.
///
/// - Error counts are additive.
/// - An incoming case with no (name, class_name) match is appended; if it
///   carries a failure, both the failure and test counters grow.
/// - On a match, a real (non-skipped) incoming case replaces a skipped
///   existing one; a failure grows the failure counter. Nothing is ever
///   decremented: the skip it replaces was never counted as a test.
/// - Two real results for one identity: the later one wins verbatim, with
///   no counter reconciliation.
/// - An incoming skip never replaces anything.
pub fn merge_into(merged: &mut TestReport, incoming: &TestReport) {
    merged.errors += incoming.errors;

    for case in &incoming.test_cases {
        match merged.find_case_mut(&case.name, &case.class_name) {
            None => {
                if case.is_failure() {
                    merged.failures += 1;
                    merged.tests += 1;
                }
                merged.test_cases.push(case.clone());
            }
            Some(existing) => {
                if case.skipped {
                    continue;
                }
                let was_skipped = existing.skipped;
                *existing = case.clone();
                if was_skipped && case.is_failure() {
                    merged.failures += 1;
                }
            }
        }
    }
}

/// Collect and merge every shard report below `reports_dir`.
///
/// Parallel test drivers write one `junit*.xml` per shard; files that fail
/// to parse are logged and skipped. An empty merged report is an error: it
/// means no shard actually executed anything.
pub fn collect_shard_reports(suite_name: &str, reports_dir: &Path) -> Result<TestReport, Error> {
    let mut merged = TestReport::new(suite_name);

    let mut entries: Vec<_> = std::fs::read_dir(reports_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("junit") && n.ends_with(".xml"))
        })
        .collect();
    entries.sort();

    for path in entries {
        let content = std::fs::read_to_string(&path)?;
        match xml::parse_report(&content) {
            Ok(shard) => merge_into(&mut merged, &shard),
            Err(err) => warn!(file = %path.display(), error = %err, "Skipping unparsable shard report"),
        }
    }

    if merged.test_cases.is_empty() {
        return Err(Error::report(format!(
            "report {suite_name:?} is empty, it seems no tests were executed"
        )));
    }

    Ok(merged)
}

/// Print the failed and errored cases of a report, one line each
pub fn print_detailed_report(report: &TestReport) {
    for case in &report.test_cases {
        if let Some(message) = &case.failure_message {
            info!(
                suite = %report.name,
                case = %case.name,
                duration = ?case.duration,
                "FAIL: {message}"
            );
        }
    }
}
