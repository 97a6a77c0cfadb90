//! Testing utilities for dish pipelines.
//!
//! This module provides a scripted in-memory cluster backend that records
//! what was submitted and how many units were in flight at once.

mod backend;

pub use backend::ScriptedBackend;
