//! Retry decorators for fallible operations
//!
//! Two flavors are used by the orchestrator:
//!
//! - [`retry_n_attempts`]: a fixed number of attempts with a small constant
//!   backoff, for idempotent operations such as conformance checks or
//!   patch-on-conflict races. Exhaustion returns the last error annotated
//!   with the attempt count.
//! - [`retry_with_backoff`]: exponential backoff with jitter for transient
//!   remote-call failures in the provisioning client.
//!
//! [`measured_retry_n_attempts`] composes metrics around the first flavor:
//! each attempt's duration and the total attempt count are published to the
//! [`MetricsSink`]. The decorators stay independent; metrics wrap retry.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{error, warn};

use crate::error::Error;
use crate::metrics::MetricsSink;

/// Backoff between fixed-count retry attempts
const ATTEMPT_BACKOFF: Duration = Duration::from_secs(3);

/// Configuration for exponential backoff with jitter
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Run `operation(attempt)` up to `max_attempts` times with a fixed backoff.
///
/// Attempt numbers start at 1. On exhaustion the last error is returned,
/// annotated with the attempt count.
pub async fn retry_n_attempts<F, Fut, T>(max_attempts: u32, mut operation: F) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt < max_attempts {
                    warn!(attempt, error = %err, "Attempt failed, retrying");
                    tokio::time::sleep(ATTEMPT_BACKOFF).await;
                }
                last_err = Some(err);
            }
        }
    }

    Err(Error::RetriesExhausted {
        attempts: max_attempts,
        source: Box::new(last_err.unwrap_or_else(|| Error::config("zero retry attempts"))),
    })
}

/// [`retry_n_attempts`] with per-attempt duration and total attempt count
/// published to `sink` under `operation_name`.
pub async fn measured_retry_n_attempts<F, Fut, T>(
    sink: &MetricsSink,
    operation_name: &str,
    max_attempts: u32,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempts = 0;

    let result = retry_n_attempts(max_attempts, |attempt| {
        attempts = attempt;
        let fut = operation(attempt);
        async move {
            let started = Instant::now();
            let result = fut.await;
            sink.record_attempt_runtime(operation_name, attempt, started.elapsed());
            result
        }
    })
    .await;

    sink.record_attempts(operation_name, attempts);
    result
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Used for remote calls that fail transiently; jitter decorrelates parallel
/// workers hammering the same API endpoint.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
