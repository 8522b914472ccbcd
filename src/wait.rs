//! Bounded poll-until-ready loops
//!
//! Every wait phase of a scenario lifecycle blocks inside [`poll`]: a check
//! runs once per tick and reports either success, a transient error (logged,
//! loop continues) or a terminal error (loop aborts). Reaching the deadline
//! yields a deadline-exceeded failure carrying the last transient error for
//! diagnostics, and an external cancellation signal aborts the loop promptly
//! with a distinct error.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;

/// Outcome of one poll tick
#[derive(Debug)]
pub enum PollOutcome {
    /// The awaited condition holds; the loop ends successfully
    Ready,
    /// Not there yet; logged and retried after the poll interval
    Pending(Error),
    /// Unrecoverable; the loop aborts immediately with this error
    Abort(Error),
}

/// Remaining time threaded sequentially through the wait phases of one
/// scenario.
///
/// Each wait consumes its elapsed time from the budget, so the next wait
/// inherits leftover time instead of a fresh ceiling. The remainder is
/// floored at zero and a wait handed an exhausted budget fails immediately
/// without polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunBudget(Duration);

impl RunBudget {
    /// Create a budget with the given ceiling
    pub fn new(ceiling: Duration) -> Self {
        Self(ceiling)
    }

    /// Time left in the budget
    pub fn remaining(&self) -> Duration {
        self.0
    }

    /// Whether the budget has run out
    pub fn is_exhausted(&self) -> bool {
        self.0.is_zero()
    }

    /// Subtract elapsed time, flooring at zero
    pub fn consume(self, elapsed: Duration) -> Self {
        Self(self.0.saturating_sub(elapsed))
    }

    /// Grow the budget, e.g. for providers known to be slower
    pub fn extend(self, extra: Duration) -> Self {
        Self(self.0 + extra)
    }
}

/// Poll `check` every `interval` until it reports [`PollOutcome::Ready`],
/// aborting on a terminal error, on `deadline`, or on cancellation.
///
/// The first check runs immediately, before any sleeping. `name` labels log
/// lines only.
pub async fn poll<F, Fut>(
    name: &str,
    interval: Duration,
    deadline: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollOutcome>,
{
    if deadline.is_zero() {
        return Err(Error::DeadlineExceeded {
            waited: Duration::ZERO,
            last_error: "wait budget already exhausted".to_string(),
        });
    }

    let started = Instant::now();
    let give_up = started + deadline;
    let mut last_transient: Option<Error> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match check().await {
            PollOutcome::Ready => {
                debug!(wait = name, elapsed = ?started.elapsed(), "Condition met");
                return Ok(());
            }
            PollOutcome::Abort(err) => return Err(err),
            PollOutcome::Pending(err) => {
                warn!(wait = name, error = %err, "Not ready yet, retrying");
                last_transient = Some(err);
            }
        }

        let now = Instant::now();
        if now + interval >= give_up {
            return Err(Error::DeadlineExceeded {
                waited: started.elapsed(),
                last_error: last_transient
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "condition never reported an error".to_string()),
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Budget-aware [`poll`]: the deadline is the budget's remainder and the
/// leftover budget is returned on success, so sequential waits share one
/// worst-case ceiling instead of summing independent ones.
pub async fn poll_with_budget<F, Fut>(
    name: &str,
    interval: Duration,
    budget: RunBudget,
    cancel: &CancellationToken,
    check: F,
) -> Result<RunBudget, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollOutcome>,
{
    let started = Instant::now();
    poll(name, interval, budget.remaining(), cancel, check).await?;
    Ok(budget.consume(started.elapsed()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn millis(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    // ==========================================================================
    // Story: Budget Decay
    //
    // The remaining budget is max(0, deadline - elapsed): monotonic, floored,
    // and a zero budget fails a wait before its check ever runs.
    // ==========================================================================

    #[test]
    fn budget_decay_is_monotonic_and_floored() {
        let budget = RunBudget::new(Duration::from_secs(10));
        let after_three = budget.consume(Duration::from_secs(3));
        assert_eq!(after_three.remaining(), Duration::from_secs(7));

        // Consuming more than remains floors at zero instead of underflowing
        let drained = after_three.consume(Duration::from_secs(60));
        assert_eq!(drained.remaining(), Duration::ZERO);
        assert!(drained.is_exhausted());

        // Once exhausted, stays exhausted
        assert!(drained.consume(Duration::from_secs(1)).is_exhausted());
    }

    #[tokio::test]
    async fn zero_budget_wait_fails_without_polling() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let cancel = CancellationToken::new();

        let result = poll("nodes-join", millis(1), Duration::ZERO, &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                PollOutcome::Ready
            }
        })
        .await;

        assert!(matches!(result, Err(Error::DeadlineExceeded { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "check must not run");
    }

    // ==========================================================================
    // Story: Transient vs Terminal Errors
    // ==========================================================================

    #[tokio::test]
    async fn transient_errors_are_retried_until_ready() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let cancel = CancellationToken::new();

        let result = poll("control-plane", millis(1), millis(500), &cancel, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    PollOutcome::Pending(Error::provisioning("2 pods not ready"))
                } else {
                    PollOutcome::Ready
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn terminal_error_aborts_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let cancel = CancellationToken::new();

        let result = poll("machines", millis(1), millis(500), &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                PollOutcome::Abort(Error::provisioning("found two clusters, expected one"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Provisioning(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deadline_error_carries_last_transient_for_diagnostics() {
        let cancel = CancellationToken::new();

        let result = poll("addons", millis(5), millis(30), &cancel, || async {
            PollOutcome::Pending(Error::provisioning("addon dns not reconciled"))
        })
        .await;

        match result {
            Err(Error::DeadlineExceeded { last_error, .. }) => {
                assert!(last_error.contains("dns not reconciled"));
            }
            other => panic!("expected DeadlineExceeded, got {other:?}"),
        }
    }

    // ==========================================================================
    // Story: Cancellation
    //
    // A cancelled run aborts the loop promptly and is distinguishable from a
    // timeout, so callers can skip remaining phases but still run teardown.
    // ==========================================================================

    #[tokio::test]
    async fn cancellation_aborts_with_distinct_error() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(millis(10)).await;
            token.cancel();
        });

        let result = poll("workloads", millis(5), Duration::from_secs(60), &cancel, || async {
            PollOutcome::Pending(Error::provisioning("still waiting"))
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    // ==========================================================================
    // Story: Budget Threading Between Waits
    // ==========================================================================

    #[tokio::test]
    async fn successful_wait_returns_leftover_budget() {
        let cancel = CancellationToken::new();
        let budget = RunBudget::new(Duration::from_secs(30));

        let remaining = poll_with_budget("nodes", millis(1), budget, &cancel, || async {
            PollOutcome::Ready
        })
        .await
        .expect("wait should succeed");

        assert!(remaining.remaining() <= Duration::from_secs(30));
        assert!(remaining.remaining() > Duration::from_secs(25));
    }
}
