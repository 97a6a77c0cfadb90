//! Per-stage options.

use serde::{Deserialize, Serialize};

use crate::executor::ResourceRequest;

/// Options for [`super::Pipeline::run`].
///
/// `max` and `retries` fall back to the enclosing group or pipeline
/// configuration when unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// CPU cores per unit.
    pub cores: u32,
    /// Memory per unit, in gigabytes.
    pub mem: u32,
    /// Stage-level concurrency limit.
    pub max: Option<usize>,
    /// Retry budget override.
    pub retries: Option<u32>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cores: 1,
            mem: 1,
            max: None,
            retries: None,
        }
    }
}

impl RunOptions {
    /// One core, 1 GB, no overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the core count.
    #[must_use]
    pub fn with_cores(mut self, cores: u32) -> Self {
        self.cores = cores;
        self
    }

    /// Sets the memory request in gigabytes.
    #[must_use]
    pub fn with_mem(mut self, mem: u32) -> Self {
        self.mem = mem;
        self
    }

    /// Caps concurrency for this stage.
    #[must_use]
    pub fn with_max(mut self, max: usize) -> Self {
        self.max = Some(max);
        self
    }

    /// Overrides the retry budget for this stage.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub(crate) fn resources(&self) -> ResourceRequest {
        ResourceRequest::new(self.cores, self.mem)
    }
}
