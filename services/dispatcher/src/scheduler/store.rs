//! Store seam between the task manager and durable state.

use async_trait::async_trait;
use jobplane_id::{WorkItemId, WorkflowNodeId};
use jobplane_scheduling::dependencies::{DependencyCatalog, NewPrerequisite};
use jobplane_scheduling::{
    Assignment, Node, NodeGroup, NodeTemplate, PassReport, Status, WorkItem, WorkItemKind,
    WorkflowState,
};

use crate::db::DbError;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reading or writing scheduler state.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbError),

    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Outcome of persisting a pass's decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub persisted: usize,
    /// Items that were no longer pending when the decisions were written.
    pub vanished: Vec<WorkItemId>,
}

/// Status an item moves to once it has been handed to its node.
///
/// Workflow runs are orchestrated in-process and go straight to running;
/// everything else waits for the executor to pick it up.
pub fn dispatched_status(kind: WorkItemKind) -> Status {
    match kind {
        WorkItemKind::WorkflowRun => Status::Running,
        _ => Status::Waiting,
    }
}

/// Durable state read and written by one scheduling pass.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    /// Pending items of one kind.
    async fn list_pending(&self, kind: WorkItemKind) -> StoreResult<Vec<WorkItem>>;

    /// Waiting and running items of one kind.
    async fn list_running_and_waiting(&self, kind: WorkItemKind) -> StoreResult<Vec<WorkItem>>;

    async fn list_nodes(&self) -> StoreResult<Vec<Node>>;

    /// Node groups in evaluation order.
    async fn list_node_groups(&self) -> StoreResult<Vec<NodeGroup>>;

    /// Update-on-launch settings, latest syncs and recorded prerequisites for
    /// the given pending items.
    async fn load_dependency_catalog(&self, pending: &[WorkItem]) -> StoreResult<DependencyCatalog>;

    /// Insert a planned prerequisite as a new pending item.
    async fn create_prerequisite(&self, prerequisite: &NewPrerequisite) -> StoreResult<WorkItem>;

    /// Record that `item` must wait for `prerequisites`.
    async fn record_prerequisites(
        &self,
        item: WorkItemId,
        prerequisites: &[WorkItemId],
    ) -> StoreResult<()>;

    /// Fail pending items with an explanation. Items no longer pending are
    /// left alone. Returns how many were failed.
    async fn fail_items(&self, failures: &[(WorkItemId, String)]) -> StoreResult<usize>;

    /// Running workflow runs with their node graphs.
    async fn load_running_workflows(&self) -> StoreResult<Vec<WorkflowState>>;

    /// Insert the pending item for a workflow node and link it to the node.
    async fn spawn_workflow_node(
        &self,
        run: WorkItemId,
        node: WorkflowNodeId,
        template: &NodeTemplate,
    ) -> StoreResult<WorkItem>;

    /// Move a workflow run to `status` and cancel the listed jobs.
    ///
    /// Pending jobs are canceled outright; waiting and running jobs are
    /// flagged for their executor to stop.
    async fn finish_workflow(
        &self,
        run: WorkItemId,
        status: Status,
        cancel: &[WorkItemId],
    ) -> StoreResult<()>;

    /// Write every decision of a pass in one transaction.
    async fn persist_assignments(&self, started: &[(WorkItem, Assignment)]) -> StoreResult<PersistOutcome>;

    /// Keep the pass report for operators.
    async fn record_pass(&self, report: &PassReport) -> StoreResult<()>;
}
