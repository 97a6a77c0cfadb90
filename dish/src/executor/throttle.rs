//! Concurrency ceiling shared by every stage of a pipeline.
//!
//! Two semaphores gate each unit: the pipeline-wide one sized to the global
//! ceiling, which lives as long as the pipeline, and a stage-level one sized
//! to the effective limit of the current stage (`min(max, group, global)`).
//! A unit holds both permits while it is submitted or running.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Pipeline-wide admission control.
#[derive(Debug, Clone)]
pub struct Throttle {
    global: Arc<Semaphore>,
    ceiling: usize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Throttle {
    /// Creates a throttle with the given ceiling (at least 1).
    #[must_use]
    pub fn new(ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            global: Arc::new(Semaphore::new(ceiling)),
            ceiling,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the global ceiling.
    #[must_use]
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Returns the number of permits currently held.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Returns the highest number of permits ever held at once.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Creates a stage limiter; the limit is clamped to `1..=ceiling`.
    #[must_use]
    pub fn limiter(&self, limit: usize) -> StageLimiter {
        let limit = limit.clamp(1, self.ceiling);
        StageLimiter {
            local: Arc::new(Semaphore::new(limit)),
            limit,
            throttle: self.clone(),
        }
    }
}

/// Admission control for one stage.
#[derive(Debug, Clone)]
pub struct StageLimiter {
    local: Arc<Semaphore>,
    limit: usize,
    throttle: Throttle,
}

impl StageLimiter {
    /// Returns the effective limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns the pipeline-wide in-flight count.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.throttle.in_flight()
    }

    /// Waits for a stage slot, then a global slot.
    pub async fn acquire(&self) -> Result<ThrottlePermit, AcquireError> {
        let local = self.local.clone().acquire_owned().await?;
        let global = self.throttle.global.clone().acquire_owned().await?;

        let now = self.throttle.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.throttle.peak.fetch_max(now, Ordering::SeqCst);

        Ok(ThrottlePermit {
            _local: local,
            _global: global,
            in_flight: self.throttle.in_flight.clone(),
        })
    }
}

/// Held while a unit is in flight; releases both slots on drop.
#[derive(Debug)]
pub struct ThrottlePermit {
    _local: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_limit_clamped_to_ceiling() {
        let throttle = Throttle::new(70);
        assert_eq!(throttle.limiter(25).limit(), 25);
        assert_eq!(throttle.limiter(500).limit(), 70);
        assert_eq!(throttle.limiter(0).limit(), 1);
    }

    #[tokio::test]
    async fn test_permit_tracks_in_flight() {
        let throttle = Throttle::new(4);
        let limiter = throttle.limiter(2);

        let a = limiter.acquire().await.unwrap();
        let b = limiter.acquire().await.unwrap();
        assert_eq!(throttle.in_flight(), 2);

        drop(a);
        assert_eq!(throttle.in_flight(), 1);
        drop(b);
        assert_eq!(throttle.in_flight(), 0);
        assert_eq!(throttle.peak(), 2);
    }

    #[tokio::test]
    async fn test_stage_limit_blocks_beyond_limit() {
        let throttle = Throttle::new(4);
        let limiter = throttle.limiter(1);

        let held = limiter.acquire().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(20), limiter.acquire()).await;
        assert!(blocked.is_err());

        drop(held);
        assert!(limiter.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_global_budget_shared_across_limiters() {
        let throttle = Throttle::new(2);
        let first = throttle.limiter(2);
        let second = throttle.limiter(2);

        let _a = first.acquire().await.unwrap();
        let _b = first.acquire().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(20), second.acquire()).await;
        assert!(blocked.is_err());
    }
}
