//! Resource-throttled execution of submission units.
//!
//! This module provides:
//! - Submission units and resource requests
//! - The pipeline-wide concurrency throttle
//! - The retry controller wrapping each unit's lifecycle
//! - Stage execution: one unit per job, fanned out and joined as a barrier

mod retry;
mod submission;
mod throttle;

pub use retry::{BackoffStrategy, JitterStrategy, RetryController, RetryPolicy};
pub use submission::{ResourceRequest, SubmissionUnit, UnitOutcome, UnitStatus};
pub use throttle::{StageLimiter, Throttle, ThrottlePermit};

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;

/// Runs one unit per job concurrently and waits for all of them.
///
/// Each job gets a single task that walks its unit through every retry, so
/// no job ever has two units in flight. Returns outcomes keyed by the
/// caller's job index, in completion order.
pub async fn execute_units(
    controller: Arc<RetryController>,
    units: Vec<(usize, SubmissionUnit)>,
) -> Vec<(usize, UnitOutcome)> {
    let mut tasks = FuturesUnordered::new();

    for (id, unit) in units {
        let controller = controller.clone();
        let handle = tokio::spawn(async move { controller.run(unit).await });
        tasks.push(async move { (id, handle.await) });
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    while let Some((id, joined)) = tasks.next().await {
        let outcome = joined.unwrap_or_else(|e| {
            UnitOutcome::failed(0, Vec::new(), format!("Task join error: {e}"))
        });
        outcomes.push((id, outcome));
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::events::NoOpEventSink;
    use crate::testing::ScriptedBackend;
    use std::path::PathBuf;
    use std::time::Duration;

    #[tokio::test]
    async fn test_execute_units_respects_limit() {
        let backend = Arc::new(ScriptedBackend::new().with_run_polls(3));
        let throttle = Throttle::new(10);
        let controller = Arc::new(RetryController::new(
            backend.clone(),
            "batch",
            0,
            RetryPolicy::immediate(),
            Duration::from_millis(2),
            throttle.limiter(2),
            Arc::new(CancellationToken::new()),
            Arc::new(NoOpEventSink),
        ));

        let units = (0..5)
            .map(|i| {
                let job = format!("job-{i}");
                (i, SubmissionUnit::new(job, "run[0]", "true", ResourceRequest::default(), PathBuf::from("/w")))
            })
            .collect();

        let outcomes = execute_units(controller, units).await;

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|(_, o)| o.status == UnitStatus::Succeeded));
        assert!(backend.peak_in_flight() <= 2);
        assert!(throttle.peak() <= 2);
        assert_eq!(throttle.in_flight(), 0);
    }
}
