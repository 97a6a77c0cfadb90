//! Job records and their lifecycle status.

mod record;
mod status;

pub use record::{FieldValue, JobFailure, JobRecord, RESERVED_FIELDS};
pub use status::JobStatus;
