//! Pipeline lifecycle events.
//!
//! The pipeline emits events such as `stage.started`, `job.failed` and
//! `transaction.exited` to the sink it was configured with. Sinks are held by
//! the pipeline itself; there is no process-wide sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
