//! Error types for the konform orchestrator

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Main error type for orchestrator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Scenario matrix produced no runnable scenarios
    #[error("no scenarios match the given criteria")]
    NoScenarios,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Cluster or machine provisioning error
    #[error("provisioning error: {0}")]
    Provisioning(String),

    /// A wait phase exhausted its deadline
    #[error("deadline exceeded after {waited:?}: {last_error}")]
    DeadlineExceeded {
        /// How long the poll loop ran before giving up
        waited: Duration,
        /// The last transient error observed, for diagnostics
        last_error: String,
    },

    /// The run was cancelled from the outside
    #[error("operation cancelled")]
    Cancelled,

    /// A conformance check failed
    #[error("check {check} failed: {message}")]
    CheckFailed {
        /// Name of the failing check
        check: String,
        /// Failure detail
        message: String,
    },

    /// A retried operation ran out of attempts
    #[error("did not succeed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// How many attempts were made
        attempts: u32,
        /// The error of the final attempt
        source: Box<Error>,
    },

    /// Cluster teardown failed
    #[error("teardown error: {0}")]
    Teardown(String),

    /// Report parsing or writing error
    #[error("report error: {0}")]
    Report(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a provisioning error with the given message
    pub fn provisioning(msg: impl Into<String>) -> Self {
        Self::Provisioning(msg.into())
    }

    /// Create a teardown error with the given message
    pub fn teardown(msg: impl Into<String>) -> Self {
        Self::Teardown(msg.into())
    }

    /// Create a report error with the given message
    pub fn report(msg: impl Into<String>) -> Self {
        Self::Report(msg.into())
    }

    /// Whether this error is the distinct cancellation error
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Collects every error produced by one scenario lifecycle.
///
/// A failing check must not hide a later teardown failure (or vice versa), so
/// instead of returning the first error we fold all of them into one value
/// that preserves each message.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<Error>,
}

impl AggregateError {
    /// Create an empty aggregate
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error
    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    /// Record the error of a result, passing success through
    pub fn record<T>(&mut self, result: Result<T, Error>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.push(e);
                None
            }
        }
    }

    /// Whether any error was recorded
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of recorded errors
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Collapse into a single error, or `Ok(())` if nothing was recorded.
    pub fn into_result(self) -> Result<(), Error> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Provisioning(self.to_string()))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.errors[0]),
            n => {
                write!(f, "{n} errors occurred: ")?;
                for (i, err) in self.errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "[{err}]")?;
                }
                Ok(())
            }
        }
    }
}
