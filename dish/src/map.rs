//! Local map runner.
//!
//! Applies an in-process function to each job record on the blocking pool.
//! Calls compete for the same throttle as cluster submissions because they
//! typically do blocking I/O on the shared store (listing an archive,
//! reading a BAM header).

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tracing::debug;

use crate::executor::StageLimiter;
use crate::job::JobRecord;

/// A per-job function run by [`crate::Pipeline::map`].
pub type MapFn = dyn Fn(&mut JobRecord) -> anyhow::Result<()> + Send + Sync;

/// The record after the function ran, and how the call went.
#[derive(Debug)]
pub struct MapResult {
    /// Index of the job in the pipeline.
    pub id: usize,
    /// The record, including any partial mutation made before an error.
    pub record: JobRecord,
    /// `Err` carries the rendered error chain.
    pub outcome: Result<(), String>,
}

/// Runs `function` over `records` concurrently, bounded by `limiter`.
///
/// Returns one result per input record, in completion order.
pub async fn map_records(
    function: Arc<MapFn>,
    limiter: StageLimiter,
    records: Vec<(usize, JobRecord)>,
) -> Vec<MapResult> {
    let mut tasks = FuturesUnordered::new();

    for (id, record) in records {
        let function = function.clone();
        let limiter = limiter.clone();
        let original = record.clone();

        let handle = tokio::spawn(async move {
            let _permit = match limiter.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    return MapResult {
                        id,
                        record,
                        outcome: Err(format!("concurrency limiter closed: {e}")),
                    };
                }
            };

            let joined = tokio::task::spawn_blocking(move || {
                let mut record = record;
                let outcome = function(&mut record).map_err(|e| format!("{e:#}"));
                (record, outcome)
            })
            .await;

            match joined {
                Ok((record, outcome)) => MapResult { id, record, outcome },
                Err(e) => MapResult {
                    id,
                    record: original,
                    outcome: Err(format!("map function panicked: {e}")),
                },
            }
        });

        tasks.push(handle);
    }

    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.next().await {
        match joined {
            Ok(result) => {
                debug!(job = %result.record.description(), ok = result.outcome.is_ok(), "Map call finished");
                results.push(result);
            }
            // The outer task only awaits; it cannot panic short of a runtime shutdown.
            Err(e) => tracing::error!(error = %e, "Map task join error"),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Throttle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn records(n: usize) -> Vec<(usize, JobRecord)> {
        (0..n).map(|i| (i, JobRecord::new(format!("job-{i}")))).collect()
    }

    #[tokio::test]
    async fn test_map_mutates_records() {
        let f: Arc<MapFn> = Arc::new(|job: &mut JobRecord| -> anyhow::Result<()> {
            let upper = job.description().to_uppercase();
            job.set("upper", upper)?;
            Ok(())
        });

        let mut results = map_records(f, Throttle::new(4).limiter(4), records(3)).await;
        results.sort_by_key(|r| r.id);

        assert_eq!(results.len(), 3);
        assert_eq!(results[2].record.get_str("upper"), Some("JOB-2"));
        assert!(results.iter().all(|r| r.outcome.is_ok()));
    }

    #[tokio::test]
    async fn test_map_error_is_per_job() {
        let f: Arc<MapFn> = Arc::new(|job: &mut JobRecord| -> anyhow::Result<()> {
            job.set("touched", 1)?;
            if job.description() == "job-1" {
                anyhow::bail!("something is dramatically wrong");
            }
            Ok(())
        });

        let mut results = map_records(f, Throttle::new(4).limiter(4), records(3)).await;
        results.sort_by_key(|r| r.id);

        assert!(results[0].outcome.is_ok());
        assert_eq!(
            results[1].outcome.as_ref().unwrap_err(),
            "something is dramatically wrong"
        );
        // Partial mutation survives, as with in-place mutation.
        assert!(results[1].record.field("touched").is_some());
        assert!(results[2].outcome.is_ok());
    }

    #[tokio::test]
    async fn test_map_panic_keeps_original_record() {
        let f: Arc<MapFn> = Arc::new(|_job: &mut JobRecord| -> anyhow::Result<()> { panic!("boom") });

        let results = map_records(f, Throttle::new(1).limiter(1), records(1)).await;
        assert_eq!(results[0].record.description(), "job-0");
        assert!(results[0].outcome.as_ref().unwrap_err().contains("panicked"));
    }

    #[tokio::test]
    async fn test_map_respects_limit() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (c, p) = (current.clone(), peak.clone());

        let f: Arc<MapFn> = Arc::new(move |_job: &mut JobRecord| -> anyhow::Result<()> {
            let now = c.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            c.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });

        let results = map_records(f, Throttle::new(8).limiter(2), records(6)).await;
        assert_eq!(results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
