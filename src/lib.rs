//! konform - end-to-end cluster-conformance test orchestrator
//!
//! Given a matrix of cloud providers, operating systems, container runtimes
//! and Kubernetes versions, konform provisions real clusters through a
//! managed control plane, waits for them to become healthy, runs a pluggable
//! battery of checks, and tears everything down, producing a merged
//! pass/fail report per scenario.
//!
//! # Architecture
//!
//! - [`scenario`] - the scenario value, matrix generation and filtering
//! - [`runner`] - the bounded-parallelism worker pool and the per-scenario
//!   phase lifecycle
//! - [`wait`] - the poll-until-ready primitive every wait phase blocks in
//! - [`retry`] - retry and metrics decorators around fallible operations
//! - [`report`] - JUnit-style reports and the shard-merge rule
//! - [`provision`] - capability traits for the managed control plane, with
//!   a kube-backed production implementation
//! - [`checks`] - pluggable conformance checks
//! - [`config`] - the resolved configuration value
//! - [`metrics`] - the explicitly passed metrics sink
//! - [`error`] - error taxonomy

#![deny(missing_docs)]

pub mod checks;
pub mod config;
pub mod error;
pub mod metrics;
pub mod provision;
pub mod report;
pub mod retry;
pub mod runner;
pub mod scenario;
pub mod wait;

pub use error::Error;

/// Result type alias using the orchestrator's error type
pub type Result<T> = std::result::Result<T, Error>;
