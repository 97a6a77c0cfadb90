//! # Dish
//!
//! A transactional, resource-throttled job pipeline for batch clusters.
//!
//! A pipeline holds one job record per input dataset and drives every job
//! through a sequence of stages:
//!
//! - **`run`**: expand a command template per job and submit it to the
//!   cluster, retrying failures, with a shared ceiling on units in flight
//! - **`map`**: apply an in-process function to every job record
//! - **`transaction`**: skip jobs whose outputs already exist, and fail jobs
//!   whose outputs are still missing after the block
//! - **`group`**: tighten the concurrency ceiling for a block of stages
//!
//! A job that fails is recorded as failed and left out of later stages; its
//! siblings carry on.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dish::prelude::*;
//!
//! let config = PipelineConfig::new("/glusterfs/work", 70, "torque", "batch")?;
//! let jobs = vec![JobRecord::new("SRR1234567").with_field("tarball", "/data/SRR1234567.tar.gz")];
//!
//! let mut p = Pipeline::new(config, jobs)?;
//! p.start()?;
//!
//! {
//!     let mut group = p.group(25)?;
//!     let mut tx = group.transaction(Completion::target("reads_1.fastq")?)?;
//!     tx.run("tar xvzf {tarball}", RunOptions::new()).await?;
//! }
//!
//! p.write_report("report.json")?;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod backend;
pub mod cancellation;
pub mod config;
pub mod errors;
pub mod events;
pub mod executor;
pub mod job;
pub mod map;
pub mod observability;
pub mod pipeline;
pub mod template;
pub mod testing;
pub mod transaction;

pub use pipeline::Pipeline;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{BackendKind, ClusterBackend, LocalBackend, TorqueBackend};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{LogConfig, LogFormat, PipelineConfig};
    pub use crate::errors::{BackendError, ConfigError, DishError, FieldError, TemplateError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{BackoffStrategy, JitterStrategy, ResourceRequest, RetryPolicy};
    pub use crate::job::{FieldValue, JobFailure, JobRecord, JobStatus};
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{Pipeline, PipelineReport, RunOptions, StageReport, TransactionReport};
    pub use crate::template::Template;
    pub use crate::transaction::Completion;
}
