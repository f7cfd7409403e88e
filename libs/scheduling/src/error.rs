//! Error types for scheduling decisions.

use jobplane_id::{Hostname, WorkItemId};
use thiserror::Error;

/// Result type for scheduling operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur while deciding or dispatching work.
///
/// Running out of capacity is not an error: an item that fits nowhere is
/// simply deferred to a later pass.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The node vanished since the node list was loaded.
    #[error("node {0} not found")]
    NodeNotFound(Hostname),

    /// Fleet configuration breaks a scheduling invariant.
    #[error("configuration invariant violated: {0}")]
    ConfigurationInvariantViolation(String),

    /// The executor handoff failed.
    #[error("dispatch of {item} to {node} failed: {reason}")]
    DispatchFailure {
        item: WorkItemId,
        node: Hostname,
        reason: String,
    },
}

impl SchedulerError {
    /// Returns true if the error only affects the current pass and the
    /// item should simply be retried by the next one.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NodeNotFound(_))
    }
}
