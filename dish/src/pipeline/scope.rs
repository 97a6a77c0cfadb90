//! Transaction and group scopes.
//!
//! Scopes form a stack on the pipeline. Opening one returns a guard that
//! borrows the pipeline mutably and derefs to it, so stages inside the block
//! are called on the guard. Dropping the guard closes the scope: a
//! transaction re-checks its postcondition, a group restores the outer
//! ceiling.

use std::ops::{Deref, DerefMut};

use super::report::TransactionReport;
use super::Pipeline;
use crate::transaction::Completion;

/// An open scope.
#[derive(Debug)]
pub(crate) enum Scope {
    Group { max: usize },
    Transaction(TransactionScope),
}

/// Bookkeeping for an open transaction.
#[derive(Debug)]
pub(crate) struct TransactionScope {
    pub(crate) label: String,
    pub(crate) completion: Completion,
    /// Jobs that run the block.
    pub(crate) participants: Vec<usize>,
    /// Jobs already complete on entry; excluded from the block's stages.
    pub(crate) skipped: Vec<usize>,
}

impl TransactionScope {
    pub(crate) fn new(label: String, completion: Completion) -> Self {
        Self {
            label,
            completion,
            participants: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

/// A block whose jobs are checked against a completion condition on exit.
///
/// Dropping the guard runs the check; [`TransactionGuard::commit`] does the
/// same and returns what happened.
#[must_use = "the transaction closes as soon as the guard is dropped"]
pub struct TransactionGuard<'p> {
    pipeline: &'p mut Pipeline,
    depth: usize,
    closed: bool,
}

impl<'p> TransactionGuard<'p> {
    pub(crate) fn new(pipeline: &'p mut Pipeline, depth: usize) -> Self {
        Self {
            pipeline,
            depth,
            closed: false,
        }
    }

    /// Closes the transaction and reports skipped, completed and failed jobs.
    pub fn commit(mut self) -> TransactionReport {
        self.closed = true;
        self.pipeline.close_scopes(self.depth).unwrap_or_default()
    }
}

impl Deref for TransactionGuard<'_> {
    type Target = Pipeline;

    fn deref(&self) -> &Pipeline {
        self.pipeline
    }
}

impl DerefMut for TransactionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Pipeline {
        self.pipeline
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.pipeline.close_scopes(self.depth);
        }
    }
}

/// A block with a tighter concurrency ceiling.
#[must_use = "the group closes as soon as the guard is dropped"]
pub struct GroupGuard<'p> {
    pipeline: &'p mut Pipeline,
    depth: usize,
}

impl<'p> GroupGuard<'p> {
    pub(crate) fn new(pipeline: &'p mut Pipeline, depth: usize) -> Self {
        Self { pipeline, depth }
    }
}

impl Deref for GroupGuard<'_> {
    type Target = Pipeline;

    fn deref(&self) -> &Pipeline {
        self.pipeline
    }
}

impl DerefMut for GroupGuard<'_> {
    fn deref_mut(&mut self) -> &mut Pipeline {
        self.pipeline
    }
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        self.pipeline.close_scopes(self.depth);
    }
}
